pub mod config;
pub mod error;
pub mod websocket;

pub use error::{ErrorKind, HandshakeError, ProtocolError, SessionError};
pub type Result<T> = std::result::Result<T, SessionError>;
pub use config::{SessionConfig, Settings};

pub use websocket::{
    CloseCode, CloseFrame, Connector, Message, Session, SessionBuilder, SessionObserver, State,
    Target, TcpConnector, UpgradeResponse,
};

pub fn session_from_settings(settings: &Settings) -> Result<Session> {
    let mut target = Target::parse(&settings.client.url)?.with_protocols(settings.client.protocols.clone());
    if let Some(authorization) = &settings.client.authorization {
        target = target.with_authorization(authorization)?;
    }

    Ok(Session::builder(target).config(settings.session.clone()).build())
}
