use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, SessionError};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 21;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 << 20;

const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(ProtocolError::InvalidOpcode(other)),
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

// Codes without a named variant, including the reserved 1004 and 1006,
// are kept as `CloseCode::Other` so they survive a decode/encode cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    NoStatusReceived,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1005 => CloseCode::NoStatusReceived,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::NoStatusReceived => 1005,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Option<Self>, ProtocolError> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(ProtocolError::InvalidClosePayload),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Some(CloseFrame::new(code.into(), reason)))
            }
        }
    }

    fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.code.into());
        buf.put_slice(self.reason.as_bytes());
        buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Message::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    pub fn close(code: CloseCode) -> Self {
        Message::Close(Some(CloseFrame::new(code, "")))
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::new(true, Opcode::Text, text),
            Message::Binary(data) => Frame::new(true, Opcode::Binary, data),
            Message::Ping(data) => Frame::new(true, Opcode::Ping, data),
            Message::Pong(data) => Frame::new(true, Opcode::Pong, data),
            Message::Close(Some(close)) => Frame::new(true, Opcode::Close, close.to_payload()),
            Message::Close(None) => Frame::new(true, Opcode::Close, Bytes::new()),
        }
    }
}

// Which end of the connection this codec runs on. Clients mask outbound
// frames and reject masked inbound ones; servers do the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, SessionError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];
        let fin = first & 0x80 != 0;
        if first & 0x70 != 0 {
            return Err(ProtocolError::ReservedBitsSet.into());
        }
        let opcode = Opcode::from_u8(first & 0x0F)?;
        let masked = second & 0x80 != 0;

        match self.role {
            Role::Client if masked => return Err(ProtocolError::MaskedServerFrame.into()),
            Role::Server if !masked => return Err(ProtocolError::UnmaskedClientFrame.into()),
            _ => {}
        }

        let (declared, length_bytes) = match second & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 2)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(ProtocolError::InvalidLength.into());
                }
                (len, 8)
            }
            short => (u64::from(short), 0),
        };

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControlFrame.into());
            }
            if declared > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ProtocolError::ControlFrameTooLarge(declared as usize).into());
            }
        }
        // Checked against the header alone, before any payload is buffered.
        if declared > self.max_frame_size as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: declared,
                max: self.max_frame_size,
            }
            .into());
        }

        let payload_len = declared as usize;
        let header_len = 2 + length_bytes + if masked { 4 } else { 0 };
        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }

        src.advance(2 + length_bytes);
        let mask = if masked {
            let mut key = [0u8; 4];
            src.copy_to_slice(&mut key);
            Some(key)
        } else {
            None
        };
        let mut payload = src.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = SessionError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), SessionError> {
        let len = frame.payload.len();
        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(ProtocolError::FragmentedControlFrame.into());
            }
            if len > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooLarge(len).into());
            }
        }

        let mask_bit = if self.role == Role::Client { 0x80 } else { 0 };
        let first = frame.opcode as u8 | if frame.fin { 0x80 } else { 0 };

        dst.reserve(14 + len);
        dst.put_u8(first);
        if len <= 125 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= usize::from(u16::MAX) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        if self.role == Role::Client {
            let key: [u8; 4] = rand::random();
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        } else {
            dst.put_slice(&frame.payload);
        }
        Ok(())
    }
}

fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

#[derive(Debug)]
struct Fragments {
    opcode: Opcode,
    buf: BytesMut,
}

#[derive(Debug)]
pub struct MessageCodec {
    frames: FrameCodec,
    max_message_size: usize,
    partial: Option<Fragments>,
}

impl MessageCodec {
    pub fn new(frames: FrameCodec, max_message_size: usize) -> Self {
        Self {
            frames,
            max_message_size,
            partial: None,
        }
    }

    pub fn client(max_frame_size: usize, max_message_size: usize) -> Self {
        Self::new(FrameCodec::client().max_frame_size(max_frame_size), max_message_size)
    }

    fn complete(opcode: Opcode, payload: Bytes) -> Result<Message, ProtocolError> {
        match opcode {
            Opcode::Text => String::from_utf8(payload.to_vec())
                .map(Message::Text)
                .map_err(|_| ProtocolError::InvalidUtf8),
            _ => Ok(Message::Binary(payload)),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, SessionError> {
        loop {
            let frame = match self.frames.decode(src)? {
                Some(frame) => frame,
                None => return Ok(None),
            };

            match frame.opcode {
                Opcode::Ping => return Ok(Some(Message::Ping(frame.payload))),
                Opcode::Pong => return Ok(Some(Message::Pong(frame.payload))),
                Opcode::Close => {
                    return Ok(Some(Message::Close(CloseFrame::parse(&frame.payload)?)));
                }
                Opcode::Text | Opcode::Binary => {
                    if self.partial.is_some() {
                        return Err(ProtocolError::ExpectedContinuation.into());
                    }
                    if frame.fin {
                        return Ok(Some(Self::complete(frame.opcode, frame.payload)?));
                    }
                    self.partial = Some(Fragments {
                        opcode: frame.opcode,
                        buf: BytesMut::from(&frame.payload[..]),
                    });
                }
                Opcode::Continuation => {
                    let partial = self
                        .partial
                        .as_mut()
                        .ok_or(ProtocolError::UnexpectedContinuation)?;
                    let size = partial.buf.len() + frame.payload.len();
                    if size > self.max_message_size {
                        return Err(ProtocolError::MessageTooLarge {
                            size,
                            max: self.max_message_size,
                        }
                        .into());
                    }
                    partial.buf.extend_from_slice(&frame.payload);
                    if frame.fin {
                        if let Some(done) = self.partial.take() {
                            return Ok(Some(Self::complete(done.opcode, done.buf.freeze())?));
                        }
                    }
                }
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = SessionError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), SessionError> {
        self.frames.encode(message.into_frame(), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_with(codec: &mut FrameCodec, frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_text_round_trip() {
        let mut buf = BytesMut::new();
        MessageCodec::client(DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE)
            .encode(Message::text("ping"), &mut buf)
            .unwrap();

        // Client output is masked, so it is read back the way a server would.
        assert_eq!(buf[1] & 0x80, 0x80);
        let frame = FrameCodec::server().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.fin);
        assert_eq!(&frame.payload[..], b"ping");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extended_lengths() {
        let mut server = FrameCodec::server();
        for len in [126usize, 70_000] {
            let payload = vec![7u8; len];
            let mut buf = encode_with(&mut server, Frame::new(true, Opcode::Binary, payload.clone()));
            let frame = FrameCodec::client().decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.payload.len(), len);
            assert_eq!(&frame.payload[..], &payload[..]);
        }
    }

    #[test]
    fn test_partial_input_waits_for_more() {
        let mut buf = encode_with(&mut FrameCodec::server(), Frame::new(true, Opcode::Text, "hello"));
        let mut tail = buf.split_off(4);
        let mut codec = FrameCodec::client();
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.unsplit(tail.split());
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[test]
    fn test_declared_length_over_cap_is_rejected() {
        // Header only: binary, 64-bit length of 5 MiB, no payload bytes yet.
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(127);
        buf.put_u64(5 << 20);

        let err = FrameCodec::client().decode(&mut buf).unwrap_err();
        assert_eq!(
            err,
            SessionError::ProtocolViolation(ProtocolError::FrameTooLarge {
                size: 5 << 20,
                max: DEFAULT_MAX_FRAME_SIZE,
            })
        );
    }

    #[test]
    fn test_malformed_frames() {
        let cases: Vec<(Vec<u8>, ProtocolError)> = vec![
            (vec![0x83, 0x00], ProtocolError::InvalidOpcode(0x3)),
            (vec![0xC1, 0x00], ProtocolError::ReservedBitsSet),
            (vec![0x09, 0x00], ProtocolError::FragmentedControlFrame),
            (vec![0x89, 126, 0x00, 0x7E], ProtocolError::ControlFrameTooLarge(126)),
            (vec![0x81, 0x80, 0, 0, 0, 0], ProtocolError::MaskedServerFrame),
        ];
        for (bytes, expected) in cases {
            let mut buf = BytesMut::from(&bytes[..]);
            let err = FrameCodec::client().decode(&mut buf).unwrap_err();
            assert_eq!(err, SessionError::ProtocolViolation(expected));
        }
    }

    #[test]
    fn test_fragmented_message_reassembly() {
        let mut server = FrameCodec::server();
        let mut buf = BytesMut::new();
        buf.unsplit(encode_with(&mut server, Frame::new(false, Opcode::Text, "hel")));
        buf.unsplit(encode_with(&mut server, Frame::new(true, Opcode::Ping, "")));
        buf.unsplit(encode_with(&mut server, Frame::new(false, Opcode::Continuation, "lo ")));
        buf.unsplit(encode_with(&mut server, Frame::new(true, Opcode::Continuation, "world")));

        let mut codec = MessageCodec::client(DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Ping(Bytes::new())));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::text("hello world")));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_fragment_sequence_errors() {
        let mut server = FrameCodec::server();
        let mut codec = MessageCodec::client(DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE);
        let mut buf = encode_with(&mut server, Frame::new(true, Opcode::Continuation, "x"));
        assert_eq!(
            codec.decode(&mut buf).unwrap_err(),
            SessionError::ProtocolViolation(ProtocolError::UnexpectedContinuation)
        );

        let mut codec = MessageCodec::client(DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE);
        let mut buf = encode_with(&mut server, Frame::new(false, Opcode::Binary, "a"));
        buf.unsplit(encode_with(&mut server, Frame::new(true, Opcode::Text, "b")));
        assert_eq!(
            codec.decode(&mut buf).unwrap_err(),
            SessionError::ProtocolViolation(ProtocolError::ExpectedContinuation)
        );
    }

    #[test]
    fn test_reassembled_message_limit() {
        let mut server = FrameCodec::server();
        let mut codec = MessageCodec::client(DEFAULT_MAX_FRAME_SIZE, 4);
        let mut buf = encode_with(&mut server, Frame::new(false, Opcode::Binary, "abc"));
        buf.unsplit(encode_with(&mut server, Frame::new(true, Opcode::Continuation, "de")));
        assert_eq!(
            codec.decode(&mut buf).unwrap_err(),
            SessionError::ProtocolViolation(ProtocolError::MessageTooLarge { size: 5, max: 4 })
        );
    }

    #[test]
    fn test_invalid_utf8_text() {
        let mut buf = encode_with(
            &mut FrameCodec::server(),
            Frame::new(true, Opcode::Text, vec![0xff, 0xfe]),
        );
        let mut codec = MessageCodec::client(DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(
            codec.decode(&mut buf).unwrap_err(),
            SessionError::ProtocolViolation(ProtocolError::InvalidUtf8)
        );
    }

    #[test]
    fn test_close_frames() {
        let mut server = MessageCodec::new(FrameCodec::server(), DEFAULT_MAX_MESSAGE_SIZE);
        let mut client = MessageCodec::client(DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE);

        // Reserved codes are not in the named set but still come through intact.
        for code in [1000u16, 1004, 1006, 4001] {
            let mut buf = BytesMut::new();
            let close = CloseFrame::new(code.into(), "bye");
            server.encode(Message::Close(Some(close.clone())), &mut buf).unwrap();
            let decoded = client.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, Message::Close(Some(close)));
            if let Message::Close(Some(frame)) = decoded {
                assert_eq!(u16::from(frame.code), code);
            }
        }

        let mut buf = BytesMut::from(&[0x88u8, 0x00][..]);
        assert_eq!(client.decode(&mut buf).unwrap(), Some(Message::Close(None)));

        let mut buf = BytesMut::from(&[0x88u8, 0x01, 0x03][..]);
        assert_eq!(
            client.decode(&mut buf).unwrap_err(),
            SessionError::ProtocolViolation(ProtocolError::InvalidClosePayload)
        );
    }

    #[test]
    fn test_close_code_values() {
        let named = [
            (CloseCode::Normal, 1000),
            (CloseCode::GoingAway, 1001),
            (CloseCode::ProtocolError, 1002),
            (CloseCode::UnsupportedData, 1003),
            (CloseCode::NoStatusReceived, 1005),
            (CloseCode::InvalidPayload, 1007),
            (CloseCode::PolicyViolation, 1008),
            (CloseCode::MessageTooBig, 1009),
        ];
        for (code, value) in named {
            assert_eq!(u16::from(code), value);
            assert_eq!(CloseCode::from(value), code);
        }
        assert_eq!(CloseCode::from(1006), CloseCode::Other(1006));
    }

    #[test]
    fn test_encoder_rejects_oversized_control_frame() {
        let mut buf = BytesMut::new();
        let err = FrameCodec::client()
            .encode(Frame::new(true, Opcode::Ping, vec![0u8; 126]), &mut buf)
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::ProtocolViolation(ProtocolError::ControlFrameTooLarge(126))
        );
    }
}
