#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::oneshot;
use tokio_util::codec::{Framed, FramedParts};
use ws_session::websocket::{
    derive_accept_key, BoxedStream, FrameCodec, MessageCodec, DEFAULT_MAX_MESSAGE_SIZE,
};
use ws_session::{Connector, Session, SessionError, SessionObserver, Target, UpgradeResponse};

pub const BUFFER: usize = 64 * 1024;

/// Hands out one pre-built in-memory stream.
pub struct DuplexConnector(Mutex<Option<BoxedStream>>);

impl DuplexConnector {
    pub fn pair() -> (Self, DuplexStream) {
        let (client, server) = tokio::io::duplex(BUFFER);
        (Self(Mutex::new(Some(Box::new(client) as BoxedStream))), server)
    }

    /// Like `pair`, but client writes start failing once the flag is set.
    pub fn with_write_switch() -> (Self, DuplexStream, Arc<AtomicBool>) {
        let (client, server) = tokio::io::duplex(BUFFER);
        let broken = Arc::new(AtomicBool::new(false));
        let stream = BreakableStream {
            inner: client,
            broken: broken.clone(),
        };
        (Self(Mutex::new(Some(Box::new(stream) as BoxedStream))), server, broken)
    }
}

pub const BROKEN_WRITE: &str = "write side broken";

/// Reads pass through untouched; writes fail while `broken` is set.
pub struct BreakableStream {
    inner: DuplexStream,
    broken: Arc<AtomicBool>,
}

impl BreakableStream {
    fn check(&self) -> io::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, BROKEN_WRITE));
        }
        Ok(())
    }
}

impl AsyncRead for BreakableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BreakableStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check()?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check()?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _target: &Target) -> Result<BoxedStream, SessionError> {
        self.0
            .lock()
            .take()
            .ok_or_else(|| SessionError::TransportError("stream already taken".into()))
    }
}

/// Never finishes connecting.
pub struct StalledConnector;

#[async_trait]
impl Connector for StalledConnector {
    async fn connect(&self, _target: &Target) -> Result<BoxedStream, SessionError> {
        std::future::pending().await
    }
}

/// Resolves when the session reports its first connect.
pub fn connected(session: &Session) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    session.set_on_connect(move || {
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send(());
        }
    });
    rx
}

pub fn target() -> Target {
    Target::parse("ws://peer.test/socket").unwrap()
}

/// Read the client's upgrade request head.
pub async fn read_request(stream: &mut DuplexStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.expect("request head");
        head.push(byte[0]);
    }
    String::from_utf8(head).expect("request is utf-8")
}

pub fn header<'a>(request: &'a str, name: &str) -> Option<&'a str> {
    request.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

pub fn switching_protocols(request: &str, extra_headers: &str) -> String {
    let key = header(request, "Sec-WebSocket-Key").expect("Sec-WebSocket-Key");
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n{}\r\n",
        derive_accept_key(key.as_bytes()),
        extra_headers
    )
}

/// Server side of an upgraded connection. Unmasked frames out, masked in.
pub type PeerFrames = Framed<DuplexStream, MessageCodec>;

/// Accept the upgrade and write `trailing` in the same write as the
/// response head.
pub async fn accept_with(mut stream: DuplexStream, trailing: &[u8]) -> (PeerFrames, String) {
    let request = read_request(&mut stream).await;
    let mut bytes = switching_protocols(&request, "").into_bytes();
    bytes.extend_from_slice(trailing);
    stream.write_all(&bytes).await.expect("write response");
    (server_frames(stream), request)
}

pub async fn accept(stream: DuplexStream) -> (PeerFrames, String) {
    accept_with(stream, &[]).await
}

pub fn server_frames(stream: DuplexStream) -> PeerFrames {
    let parts = FramedParts::new::<ws_session::Message>(
        stream,
        MessageCodec::new(FrameCodec::server(), DEFAULT_MAX_MESSAGE_SIZE),
    );
    Framed::from_parts(parts)
}

pub async fn next_message(frames: &mut PeerFrames) -> Option<ws_session::Message> {
    frames.next().await.and_then(Result::ok)
}

/// Unmasked server frame bytes, for writing raw frames ahead of the codec.
pub fn raw_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![if fin { 0x80 } else { 0x00 } | opcode];
    match payload.len() {
        len if len < 126 => out.push(len as u8),
        len if len <= u16::MAX as usize => {
            out.push(126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
    out
}

/// Everything the session reported, in delivery order.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
    errors: Mutex<Vec<Option<SessionError>>>,
}

impl Recorder {
    pub fn attach(session: &Session) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        session.set_observer(&recorder);
        recorder
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn disconnects(&self) -> Vec<Option<SessionError>> {
        self.errors.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix("text:").map(str::to_string))
            .collect()
    }
}

impl SessionObserver for Recorder {
    fn did_connect(&self, _session: &Session) {
        self.events.lock().push("connect".into());
    }

    fn did_disconnect(&self, _session: &Session, error: Option<&SessionError>) {
        self.events.lock().push("disconnect".into());
        self.errors.lock().push(error.cloned());
    }

    fn did_receive_message(&self, _session: &Session, text: &str, _response: &UpgradeResponse) {
        self.events.lock().push(format!("text:{}", text));
    }

    fn did_receive_data(&self, _session: &Session, data: &[u8], _response: &UpgradeResponse) {
        self.events.lock().push(format!("data:{}", data.len()));
    }

    fn http_upgrade_request(&self, _session: &Session, _request: &str) {
        self.events.lock().push("upgrade-request".into());
    }

    fn http_upgrade_response(&self, _session: &Session, response: &str) {
        let status = response.lines().next().unwrap_or_default().to_string();
        self.events.lock().push(format!("upgrade-response:{}", status));
    }
}
