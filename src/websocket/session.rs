use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{HandshakeError, SessionError};
use crate::websocket::codec::{CloseCode, CloseFrame, Message, MessageCodec};
use crate::websocket::dispatcher::{Dispatcher, SessionObserver};
use crate::websocket::handshake::{Handshake, Target, UpgradeResponse};
use crate::websocket::transport::{BoxedStream, Connector, TcpConnector};
use crate::websocket::watchdog::Watchdog;

type Transport = Framed<BoxedStream, MessageCodec>;

pub type Completion = Box<dyn FnOnce(Result<(), SessionError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

pub(crate) enum Command {
    Send {
        message: Message,
        completion: Option<Completion>,
    },
    Close(CloseCode),
    WatchdogExpired(Duration),
}

#[derive(Clone, Default)]
enum Executor {
    #[default]
    Dedicated,
    Handle(Handle),
}

struct Shared {
    id: Uuid,
    target: Target,
    config: SessionConfig,
    executor: Executor,
    connector: Option<Arc<dyn Connector>>,
    dispatcher: Dispatcher,
    state: watch::Sender<State>,
    connected: Arc<AtomicBool>,
    started: AtomicBool,
    commands: mpsc::UnboundedSender<Command>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    response: RwLock<Option<UpgradeResponse>>,
    close_frame: Mutex<Option<CloseFrame>>,
    error: Mutex<Option<SessionError>>,
}

pub struct SessionBuilder {
    target: Target,
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
    executor: Executor,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn runtime(mut self, handle: Handle) -> Self {
        self.executor = Executor::Handle(handle);
        self
    }

    pub fn build(self) -> Session {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(State::Connecting);
        Session {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                target: self.target,
                config: self.config,
                executor: self.executor,
                connector: self.connector,
                dispatcher: Dispatcher::new(),
                state,
                connected: Arc::new(AtomicBool::new(false)),
                started: AtomicBool::new(false),
                commands,
                inbox: Mutex::new(Some(inbox)),
                response: RwLock::new(None),
                close_frame: Mutex::new(None),
                error: Mutex::new(None),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("host", &self.shared.target.host())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(target: Target) -> Self {
        Self::builder(target).build()
    }

    pub fn builder(target: Target) -> SessionBuilder {
        SessionBuilder {
            target,
            config: SessionConfig::default(),
            connector: None,
            executor: Executor::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn target(&self) -> &Target {
        &self.shared.target
    }

    pub fn state(&self) -> State {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn upgrade_response(&self) -> Option<UpgradeResponse> {
        self.shared.response.read().clone()
    }

    pub fn close_frame(&self) -> Option<CloseFrame> {
        self.shared.close_frame.lock().clone()
    }

    pub fn error(&self) -> Option<SessionError> {
        self.shared.error.lock().clone()
    }

    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == State::Closed).await;
    }

    pub fn set_observer<O>(&self, observer: &Arc<O>)
    where
        O: SessionObserver + 'static,
    {
        self.shared.dispatcher.set_observer(observer);
    }

    pub fn clear_observer(&self) {
        self.shared.dispatcher.clear_observer();
    }

    pub fn set_on_connect(&self, f: impl Fn() + Send + Sync + 'static) {
        self.shared.dispatcher.set_on_connect(f);
    }

    pub fn set_on_text(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.shared.dispatcher.set_on_text(f);
    }

    pub fn set_on_data(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.dispatcher.set_on_data(f);
    }

    pub fn set_on_disconnect(&self, f: impl Fn(Option<&SessionError>) + Send + Sync + 'static) {
        self.shared.dispatcher.set_on_disconnect(f);
    }

    pub fn connect(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            warn!("connect() called again on session {}, ignoring", self.shared.id);
            return;
        }
        let inbox = match self.shared.inbox.lock().take() {
            Some(inbox) => inbox,
            None => return,
        };

        let session = self.clone();
        match &self.shared.executor {
            Executor::Handle(handle) => {
                handle.spawn(run(session, inbox));
            }
            Executor::Dedicated => {
                let name = format!("ws-session-{}", self.shared.id.simple());
                let spawned = std::thread::Builder::new().name(name).spawn(move || {
                    match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime.block_on(run(session, inbox)),
                        Err(e) => {
                            error!("Failed to start session worker: {}", e);
                            session.finish(Some(e.into()));
                        }
                    }
                });
                // The worker thread is detached and exits once CLOSED.
                if let Err(e) = spawned {
                    error!("Failed to spawn session worker thread: {}", e);
                    self.finish(Some(e.into()));
                }
            }
        }
    }

    pub fn disconnect(&self) {
        self.disconnect_with_code(CloseCode::Normal);
    }

    pub fn disconnect_with_code(&self, code: CloseCode) {
        if !self.shared.started.swap(true, Ordering::SeqCst) {
            // Never connected, so there is no worker to hand this to.
            debug!("Session {} closed before connect()", self.shared.id);
            self.finish(None);
            return;
        }
        if self.shared.commands.send(Command::Close(code)).is_err() {
            debug!("Session {} already closed", self.shared.id);
        }
    }

    pub fn write_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.enqueue(Message::Text(text.into()), None)
    }

    pub fn write_binary(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        self.enqueue(Message::Binary(data.into()), None)
    }

    pub fn write_text_with_completion(
        &self,
        text: impl Into<String>,
        completion: impl FnOnce(Result<(), SessionError>) + Send + 'static,
    ) {
        self.enqueue_with_completion(Message::Text(text.into()), Box::new(completion));
    }

    pub fn write_binary_with_completion(
        &self,
        data: impl Into<Bytes>,
        completion: impl FnOnce(Result<(), SessionError>) + Send + 'static,
    ) {
        self.enqueue_with_completion(Message::Binary(data.into()), Box::new(completion));
    }

    fn enqueue_with_completion(&self, message: Message, completion: Completion) {
        if self.state() != State::Open {
            completion(Err(SessionError::NotConnected));
            return;
        }
        // A failed send hands the command back, completion included.
        if let Err(mpsc::error::SendError(command)) = self.shared.commands.send(Command::Send {
            message,
            completion: Some(completion),
        }) {
            if let Command::Send {
                completion: Some(completion),
                ..
            } = command
            {
                completion(Err(SessionError::NotConnected));
            }
        }
    }

    fn enqueue(&self, message: Message, completion: Option<Completion>) -> Result<(), SessionError> {
        if self.state() != State::Open {
            return Err(SessionError::NotConnected);
        }
        self.shared
            .commands
            .send(Command::Send {
                message,
                completion,
            })
            .map_err(|_| SessionError::NotConnected)
    }

    fn advance(&self, next: State) -> bool {
        self.shared.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn record_close_frame(&self, frame: &CloseFrame) {
        let mut slot = self.shared.close_frame.lock();
        if slot.is_none() {
            *slot = Some(frame.clone());
        }
    }

    // Enter CLOSED. The disconnect notification goes out before the state
    // is published, so `closed()` never resolves ahead of it.
    fn finish(&self, error: Option<SessionError>) -> bool {
        if self.state() == State::Closed {
            return false;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        match &error {
            Some(e) => {
                warn!("Session {} closed with error: {}", self.shared.id, e);
                *self.shared.error.lock() = Some(e.clone());
            }
            None => info!("Session {} closed", self.shared.id),
        }
        let notified = self.shared.dispatcher.disconnect(self, error.as_ref());
        self.advance(State::Closed);
        notified
    }
}

enum Interrupt {
    Local,
    Watchdog(Duration),
}

async fn run(session: Session, mut inbox: mpsc::UnboundedReceiver<Command>) {
    let shared = &session.shared;
    info!(
        "Session {} connecting to {}:{}{}",
        shared.id,
        shared.target.host(),
        shared.target.port(),
        shared.target.path()
    );

    let mut watchdog = Watchdog::arm(
        shared.id,
        shared.config.connect_timeout(),
        shared.connected.clone(),
        shared.commands.clone(),
    );

    let opened = tokio::select! {
        result = open(&session) => result.map_err(Some),
        interrupt = interrupted(&mut inbox) => Err(match interrupt {
            Interrupt::Local => None,
            Interrupt::Watchdog(deadline) => Some(SessionError::WatchdogTimeout(deadline)),
        }),
    };

    // Dropping the open future above is what releases a half-open transport.
    let (mut transport, response) = match opened {
        Ok(opened) => opened,
        Err(error) => {
            watchdog.disarm();
            reject_pending(&mut inbox, error.as_ref());
            session.finish(error);
            return;
        }
    };

    shared.connected.store(true, Ordering::SeqCst);
    watchdog.disarm();
    *shared.response.write() = Some(response.clone());
    shared.dispatcher.http_upgrade_response(&session, &response);
    session.advance(State::Open);
    info!(
        "Session {} connected at {}: {}",
        shared.id,
        response.received_at().to_rfc3339(),
        response.status_line()
    );
    shared.dispatcher.connect(&session);

    let outcome = drive(&session, &mut transport, &response, &mut inbox).await;
    drop(transport);
    reject_pending(&mut inbox, outcome.as_ref());
    session.finish(outcome);
}

// Stops accepting commands and fails every write still queued. Writes
// enqueued after this fail on the closed channel instead.
fn reject_pending(inbox: &mut mpsc::UnboundedReceiver<Command>, error: Option<&SessionError>) {
    inbox.close();
    let error = error.cloned().unwrap_or(SessionError::NotConnected);
    while let Ok(command) = inbox.try_recv() {
        if let Command::Send { completion, .. } = command {
            complete(completion, Err(error.clone()));
        }
    }
}

async fn interrupted(inbox: &mut mpsc::UnboundedReceiver<Command>) -> Interrupt {
    loop {
        match inbox.recv().await {
            Some(Command::Close(_)) | None => return Interrupt::Local,
            Some(Command::WatchdogExpired(deadline)) => return Interrupt::Watchdog(deadline),
            Some(Command::Send { completion, .. }) => {
                complete(completion, Err(SessionError::NotConnected));
            }
        }
    }
}

async fn open(session: &Session) -> Result<(Transport, UpgradeResponse), SessionError> {
    let shared = &session.shared;
    let connector: Arc<dyn Connector> = match &shared.connector {
        Some(connector) => connector.clone(),
        None => Arc::new(TcpConnector::new()?),
    };
    let mut stream = connector.connect(&shared.target).await?;

    let handshake = Handshake::new(&shared.target);
    shared.dispatcher.http_upgrade_request(session, handshake.request());
    debug!("Session {} sending upgrade request", shared.id);
    stream.write_all(handshake.request().as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let (response, consumed) = loop {
        if let Some(parsed) = UpgradeResponse::parse(&buf)? {
            break parsed;
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::ConnectionClosed.into());
        }
    };
    handshake.verify(&response)?;

    // Frames the server sent right behind its response stay in the buffer.
    buf.advance(consumed);
    let codec = MessageCodec::client(shared.config.max_frame_size, shared.config.max_message_size);
    let mut parts = FramedParts::new::<Message>(stream, codec);
    parts.read_buf = buf;
    Ok((Framed::from_parts(parts), response))
}

async fn drive(
    session: &Session,
    transport: &mut Transport,
    response: &UpgradeResponse,
    inbox: &mut mpsc::UnboundedReceiver<Command>,
) -> Option<SessionError> {
    let shared = &session.shared;
    let mut close_deadline: Option<Instant> = None;
    let mut keepalive = shared
        .config
        .ping_interval()
        .map(|period| interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            command = inbox.recv() => match command {
                Some(Command::Send { message, completion }) => {
                    if close_deadline.is_some() {
                        complete(completion, Err(SessionError::NotConnected));
                        continue;
                    }
                    match transport.send(message).await {
                        Ok(()) => complete(completion, Ok(())),
                        Err(e) => {
                            error!("Session {} write failed: {}", shared.id, e);
                            complete(completion, Err(e.clone()));
                            return Some(e);
                        }
                    }
                }
                Some(Command::Close(code)) => {
                    if close_deadline.is_some() {
                        continue;
                    }
                    let frame = CloseFrame::new(code, "");
                    session.record_close_frame(&frame);
                    session.advance(State::Closing);
                    info!("Session {} closing with code {}", shared.id, u16::from(code));
                    if let Err(e) = transport.send(Message::Close(Some(frame))).await {
                        return Some(e);
                    }
                    close_deadline = Some(Instant::now() + shared.config.close_timeout());
                }
                Some(Command::WatchdogExpired(_)) => {
                    if session.is_connected() {
                        debug!("Session {} watchdog expired after connect, ignoring", shared.id);
                    }
                }
                None => return None,
            },
            inbound = transport.next() => match inbound {
                Some(Ok(Message::Text(text))) => shared.dispatcher.text(session, &text, response),
                Some(Ok(Message::Binary(data))) => shared.dispatcher.data(session, &data, response),
                Some(Ok(Message::Ping(payload))) => {
                    if close_deadline.is_none() {
                        if let Err(e) = transport.send(Message::Pong(payload)).await {
                            return Some(e);
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => trace!("Session {} pong", shared.id),
                Some(Ok(Message::Close(frame))) => {
                    debug!("Session {} received close {:?}", shared.id, frame);
                    if let Some(frame) = &frame {
                        session.record_close_frame(frame);
                    }
                    if close_deadline.is_none() {
                        session.advance(State::Closing);
                        // Echo the peer's status code back.
                        let echo = frame.map(|f| CloseFrame::new(f.code, ""));
                        let _ = transport.send(Message::Close(echo)).await;
                    }
                    let _ = transport.close().await;
                    return None;
                }
                Some(Err(e)) => {
                    if let SessionError::ProtocolViolation(violation) = &e {
                        error!("Session {} protocol violation: {}", shared.id, violation);
                        if close_deadline.is_none() {
                            let frame = CloseFrame::new(violation.close_code(), "");
                            session.record_close_frame(&frame);
                            let _ = transport.send(Message::Close(Some(frame))).await;
                        }
                    }
                    return Some(e);
                }
                None => {
                    if close_deadline.is_some() {
                        return None;
                    }
                    return Some(SessionError::TransportError(
                        "connection closed without a close frame".into(),
                    ));
                }
            },
            _ = deadline(close_deadline) => {
                warn!("Session {} peer did not answer close, aborting", shared.id);
                return None;
            }
            _ = tick(&mut keepalive) => {
                if close_deadline.is_none() {
                    if let Err(e) = transport.send(Message::Ping(Bytes::new())).await {
                        return Some(e);
                    }
                }
            }
        }
    }
}

fn complete(completion: Option<Completion>, result: Result<(), SessionError>) {
    if let Some(completion) = completion {
        completion(result);
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
