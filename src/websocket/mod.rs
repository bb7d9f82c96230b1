//! WebSocket client session
//!
//! This module holds the frame codec, the upgrade handshake, the session
//! state machine and the event dispatcher that reports back to callers.

mod codec;
mod dispatcher;
mod handshake;
mod session;
mod transport;
mod watchdog;

pub use codec::{
    CloseCode, CloseFrame, Frame, FrameCodec, Message, MessageCodec, Opcode, Role,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
};
pub use dispatcher::{Dispatcher, SessionObserver};
pub use handshake::{derive_accept_key, Handshake, Scheme, Target, UpgradeResponse, MAX_RESPONSE_HEAD};
pub use session::{Completion, Session, SessionBuilder, State};
pub use transport::{AsyncStream, BoxedStream, Connector, TcpConnector};
