use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use http::StatusCode;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use url::Url;

use crate::error::{HandshakeError, SessionError};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const MAX_RESPONSE_HEAD: usize = 16 * 1024;

const MAX_RESPONSE_HEADERS: usize = 64;

// Written by the negotiator itself; caller supplied copies are dropped.
const RESERVED_HEADERS: [&str; 6] = [
    "host",
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ws,
    Wss,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Target {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
    headers: HeaderMap,
    protocols: Vec<String>,
}

impl Target {
    pub fn parse(url: &str) -> Result<Self, SessionError> {
        Self::from_url(&Url::parse(url)?)
    }

    pub fn from_url(url: &Url) -> Result<Self, SessionError> {
        let scheme = match url.scheme() {
            "ws" | "http" => Scheme::Ws,
            "wss" | "https" => Scheme::Wss,
            other => {
                return Err(SessionError::InvalidTarget(format!(
                    "unsupported scheme {:?}",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| SessionError::InvalidTarget(format!("{} has no host", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
            headers: HeaderMap::new(),
            protocols: Vec::new(),
        })
    }

    pub fn from_request<B>(request: &http::Request<B>) -> Result<Self, SessionError> {
        let url = Url::parse(&request.uri().to_string())?;
        let mut target = Self::from_url(&url)?;
        for (name, value) in request.headers() {
            target.insert_header(name.clone(), value.clone())?;
        }
        Ok(target)
    }

    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_authorization(self, value: &str) -> Result<Self, SessionError> {
        self.with_header(AUTHORIZATION.as_str(), value)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, SessionError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SessionError::InvalidTarget(format!("header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| SessionError::InvalidTarget(format!("header {}: {}", name, e)))?;
        self.insert_header(name, value)?;
        Ok(self)
    }

    fn insert_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<(), SessionError> {
        if value.to_str().is_err() {
            return Err(SessionError::InvalidTarget(format!(
                "header {}: value is not visible ASCII",
                name
            )));
        }
        if !RESERVED_HEADERS.contains(&name.as_str()) {
            self.headers.append(name, value);
        }
        Ok(())
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    // Name presented for TLS SNI. Always the target host, never inferred
    // from the resolved address.
    pub fn server_name(&self) -> &str {
        &self.host
    }

    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
    }

    fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Handshake {
    key: String,
    request: String,
    protocols: Vec<String>,
}

impl Handshake {
    pub fn new(target: &Target) -> Self {
        let key = STANDARD.encode(rand::random::<[u8; 16]>());

        let mut request = String::with_capacity(256);
        // Writing into a String cannot fail.
        let _ = write!(request, "GET {} HTTP/1.1\r\n", target.path());
        let _ = write!(request, "Host: {}\r\n", target.host_header());
        request.push_str("Upgrade: websocket\r\n");
        request.push_str("Connection: Upgrade\r\n");
        let _ = write!(request, "Sec-WebSocket-Key: {}\r\n", key);
        request.push_str("Sec-WebSocket-Version: 13\r\n");
        if !target.protocols().is_empty() {
            let _ = write!(
                request,
                "Sec-WebSocket-Protocol: {}\r\n",
                target.protocols().join(", ")
            );
        }
        for (name, value) in target.headers() {
            // Target only admits visible-ASCII values.
            if let Ok(value) = value.to_str() {
                let _ = write!(request, "{}: {}\r\n", name, value);
            }
        }
        request.push_str("\r\n");

        Self {
            key,
            request,
            protocols: target.protocols().to_vec(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn expected_accept(&self) -> String {
        derive_accept_key(self.key.as_bytes())
    }

    pub fn verify(&self, response: &UpgradeResponse) -> Result<(), HandshakeError> {
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(HandshakeError::UnexpectedStatus(response.status().as_u16()));
        }

        let upgrade = response
            .header("upgrade")
            .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(HandshakeError::MissingHeader("Upgrade"));
        }

        let connection = response
            .header("connection")
            .ok_or(HandshakeError::MissingHeader("Connection"))?;
        if !connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        {
            return Err(HandshakeError::MissingHeader("Connection"));
        }

        let accept = response
            .header("sec-websocket-accept")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
        let expected = self.expected_accept();
        if accept.trim() != expected {
            return Err(HandshakeError::AcceptMismatch {
                expected,
                actual: accept.to_string(),
            });
        }

        if let Some(selected) = response.protocol() {
            if !self.protocols.iter().any(|p| p == selected) {
                return Err(HandshakeError::UnrequestedProtocol(selected.to_string()));
            }
        }
        Ok(())
    }
}

pub fn derive_accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    status: StatusCode,
    status_line: String,
    headers: HeaderMap,
    raw: String,
    received_at: DateTime<Utc>,
}

impl UpgradeResponse {
    // Parse a response head from the start of `buf`. Returns the response
    // and the number of bytes it occupied, or `None` if more input is needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, HandshakeError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let consumed = match response.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_RESPONSE_HEAD {
                    return Err(HandshakeError::ResponseTooLarge(MAX_RESPONSE_HEAD));
                }
                return Ok(None);
            }
            Err(e) => return Err(HandshakeError::MalformedResponse(e.to_string())),
        };
        if consumed > MAX_RESPONSE_HEAD {
            return Err(HandshakeError::ResponseTooLarge(MAX_RESPONSE_HEAD));
        }

        let code = response
            .code
            .ok_or_else(|| HandshakeError::MalformedResponse("missing status code".into()))?;
        let status = StatusCode::from_u16(code)
            .map_err(|e| HandshakeError::MalformedResponse(e.to_string()))?;

        let mut map = HeaderMap::with_capacity(response.headers.len());
        for header in response.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| HandshakeError::MalformedResponse(e.to_string()))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| HandshakeError::MalformedResponse(e.to_string()))?;
            map.append(name, value);
        }

        let raw = String::from_utf8_lossy(&buf[..consumed]).into_owned();
        let status_line = raw.lines().next().unwrap_or_default().to_string();

        Ok(Some((
            Self {
                status,
                status_line,
                headers: map,
                raw,
                received_at: Utc::now(),
            },
            consumed,
        )))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn protocol(&self) -> Option<&str> {
        self.header("sec-websocket-protocol").map(str::trim)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}
