use std::time::Duration;
use thiserror::Error;

use crate::websocket::CloseCode;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(#[from] HandshakeError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Handshake did not complete within {0:?}")]
    WatchdogTimeout(Duration),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    HandshakeFailed,
    ProtocolViolation,
    TransportError,
    WatchdogTimeout,
    InvalidTarget,
    NotConnected,
    Config,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            SessionError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            SessionError::TransportError(_) => ErrorKind::TransportError,
            SessionError::WatchdogTimeout(_) => ErrorKind::WatchdogTimeout,
            SessionError::InvalidTarget(_) => ErrorKind::InvalidTarget,
            SessionError::NotConnected => ErrorKind::NotConnected,
            SessionError::ConfigError(_) => ErrorKind::Config,
        }
    }
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for SessionError {
    fn from(err: config::ConfigError) -> Self {
        SessionError::ConfigError(err.to_string())
    }
}

// Socket level failures all surface as transport errors
impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::TransportError(err.to_string())
    }
}

impl From<native_tls::Error> for SessionError {
    fn from(err: native_tls::Error) -> Self {
        SessionError::TransportError(format!("TLS: {}", err))
    }
}

impl From<url::ParseError> for SessionError {
    fn from(err: url::ParseError) -> Self {
        SessionError::InvalidTarget(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Malformed HTTP response: {0}")]
    MalformedResponse(String),

    #[error("Response head exceeds {0} bytes")]
    ResponseTooLarge(usize),

    #[error("Unexpected status {0}, expected 101 Switching Protocols")]
    UnexpectedStatus(u16),

    #[error("Missing or invalid header: {0}")]
    MissingHeader(&'static str),

    #[error("Sec-WebSocket-Accept mismatch: expected {expected}, got {actual}")]
    AcceptMismatch { expected: String, actual: String },

    #[error("Server selected sub-protocol {0:?} that was not requested")]
    UnrequestedProtocol(String),

    #[error("Connection closed during handshake")]
    ConnectionClosed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),

    #[error("Reserved bits set without a negotiated extension")]
    ReservedBitsSet,

    #[error("Frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: u64, max: usize },

    #[error("Message of {size} bytes exceeds maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(usize),

    #[error("Control frame is fragmented")]
    FragmentedControlFrame,

    #[error("Continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("New data frame while a fragmented message is in progress")]
    ExpectedContinuation,

    #[error("Server frames must not be masked")]
    MaskedServerFrame,

    #[error("Client frames must be masked")]
    UnmaskedClientFrame,

    #[error("Invalid UTF-8 in text payload")]
    InvalidUtf8,

    #[error("Invalid close frame payload")]
    InvalidClosePayload,

    #[error("Payload length has the most significant bit set")]
    InvalidLength,
}

impl ProtocolError {
    pub fn close_code(&self) -> CloseCode {
        match self {
            ProtocolError::FrameTooLarge { .. } | ProtocolError::MessageTooLarge { .. } => {
                CloseCode::MessageTooBig
            }
            ProtocolError::InvalidUtf8 => CloseCode::InvalidPayload,
            _ => CloseCode::ProtocolError,
        }
    }
}
