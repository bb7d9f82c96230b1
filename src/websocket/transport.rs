use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::SessionError;
use crate::websocket::handshake::{Scheme, Target};

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<BoxedStream, SessionError>;
}

#[derive(Clone)]
pub struct TcpConnector {
    tls: tokio_native_tls::TlsConnector,
}

impl TcpConnector {
    pub fn new() -> Result<Self, SessionError> {
        let tls = native_tls::TlsConnector::new()?;
        Ok(Self::with_tls(tls))
    }

    pub fn with_tls(tls: native_tls::TlsConnector) -> Self {
        Self { tls: tls.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &Target) -> Result<BoxedStream, SessionError> {
        let tcp = TcpStream::connect((target.host(), target.port())).await?;
        tcp.set_nodelay(true)?;
        debug!(
            "TCP connected to {}:{} (local {:?})",
            target.host(),
            target.port(),
            tcp.local_addr().ok()
        );

        match target.scheme() {
            Scheme::Ws => Ok(Box::new(tcp)),
            Scheme::Wss => {
                // SNI comes from the target, not from the resolved address.
                let tls = self.tls.connect(target.server_name(), tcp).await?;
                debug!("TLS established with {}", target.server_name());
                Ok(Box::new(tls))
            }
        }
    }
}
