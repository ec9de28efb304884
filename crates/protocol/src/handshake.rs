//! HTTP/1.1 upgrade handshake.
//!
//! Builds the client request and server response, parses an assembled header
//! block and derives `Sec-WebSocket-Accept`. Callers accumulate bytes until
//! [`find_header_end`] reports a complete block; nothing here reads sockets.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use sha1::{Digest, Sha1};

use crate::constants::{HEADER_TERMINATOR, MAX_HANDSHAKE_SIZE, WS_GUID, WS_VERSION};

/// Errors produced while validating an upgrade request or response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("malformed HTTP head: {0}")]
    Malformed(String),

    #[error("handshake block exceeds {max} bytes")]
    TooLarge { max: usize },

    #[error("expected GET request, got {0}")]
    NotGet(String),

    #[error("missing upgrade token in Connection header")]
    MissingUpgradeToken,

    #[error("Upgrade header is not websocket")]
    NotWebSocket,

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("unexpected status line: {0}")]
    UnexpectedStatus(String),

    #[error("Sec-WebSocket-Accept does not match the request key")]
    AcceptMismatch,

    #[error("authentication rejected")]
    Unauthorized,
}

/// Derives the `Sec-WebSocket-Accept` value for a client key.
///
/// `base64(SHA1(trim(key) + GUID))`.
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.trim().as_bytes());
    sha.update(WS_GUID.as_bytes());
    B64.encode(sha.finalize())
}

/// Generates a random `Sec-WebSocket-Key` (16 random bytes, base64).
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    B64.encode(nonce)
}

/// Returns the length of the header block (terminator included) once
/// `buf` holds a complete one.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Splits a complete header block off the front of `buf`.
///
/// Returns `Ok(None)` while the terminator has not arrived and the buffer is
/// still under [`MAX_HANDSHAKE_SIZE`].
pub fn take_header_block(buf: &[u8]) -> Result<Option<(String, usize)>, HandshakeError> {
    match find_header_end(buf) {
        Some(end) if end > MAX_HANDSHAKE_SIZE => Err(HandshakeError::TooLarge {
            max: MAX_HANDSHAKE_SIZE,
        }),
        Some(end) => {
            let block = std::str::from_utf8(&buf[..end])
                .map_err(|e| HandshakeError::Malformed(format!("invalid UTF-8: {e}")))?;
            Ok(Some((block.to_string(), end)))
        }
        None if buf.len() > MAX_HANDSHAKE_SIZE => Err(HandshakeError::TooLarge {
            max: MAX_HANDSHAKE_SIZE,
        }),
        None => Ok(None),
    }
}

/// A parsed HTTP request or response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    /// Parses a header block. Header names keep their original case; lookups
    /// are case-insensitive.
    pub fn parse(block: &str) -> Result<Self, HandshakeError> {
        let mut lines = block.split("\r\n");
        let start_line = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HandshakeError::Malformed("empty start line".into()))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::Malformed(format!("bad header line: {line}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            start_line,
            headers,
        })
    }

    /// First value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a comma-separated header contains `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.header(name).is_some_and(|value| {
            value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }
}

/// Query-string credentials carried by an upgrade request (`user`, `pwd`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// A validated client upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request target exactly as sent.
    pub target: String,
    /// Path component of the target.
    pub path: String,
    pub key: String,
    pub credentials: Credentials,
    pub head: HttpHead,
}

impl UpgradeRequest {
    /// Validates a server-side header block.
    pub fn parse(block: &str) -> Result<Self, HandshakeError> {
        let head = HttpHead::parse(block)?;

        let mut parts = head.start_line.split_whitespace();
        let method = parts.next().unwrap_or_default();
        if method != "GET" {
            return Err(HandshakeError::NotGet(method.to_string()));
        }
        let target = parts
            .next()
            .ok_or_else(|| HandshakeError::Malformed("missing request target".into()))?
            .to_string();

        if !head.has_token("Connection", "upgrade") {
            return Err(HandshakeError::MissingUpgradeToken);
        }
        if !head
            .header("Upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
        {
            return Err(HandshakeError::NotWebSocket);
        }
        let key = head
            .header("Sec-WebSocket-Key")
            .filter(|k| !k.is_empty())
            .ok_or(HandshakeError::MissingKey)?
            .to_string();

        let (path, credentials) = parse_target(&target)?;

        Ok(Self {
            target,
            path,
            key,
            credentials,
            head,
        })
    }

    /// The `101 Switching Protocols` response for this request.
    pub fn response(&self) -> Vec<u8> {
        switching_protocols_response(&accept_key(&self.key))
    }
}

/// Extracts the path and `user`/`pwd` query parameters from a request
/// target, which may be origin-form (`/chat?user=a`) or absolute-form
/// (`ws://host:port/chat?user=a`).
fn parse_target(target: &str) -> Result<(String, Credentials), HandshakeError> {
    let url = if target.starts_with('/') {
        url::Url::parse(&format!("http://localhost{target}"))
    } else {
        url::Url::parse(target)
    }
    .map_err(|e| HandshakeError::Malformed(format!("bad request target {target}: {e}")))?;

    let mut credentials = Credentials::default();
    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "user" if credentials.user.is_none() => credentials.user = Some(value.into_owned()),
            "pwd" if credentials.password.is_none() => {
                credentials.password = Some(value.into_owned())
            }
            _ => {}
        }
    }

    Ok((url.path().to_string(), credentials))
}

/// Builds the server's `101 Switching Protocols` response.
pub fn switching_protocols_response(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Client-side upgrade request builder.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub target: String,
    pub host: String,
    pub key: String,
    pub extra_headers: Vec<(String, String)>,
}

impl ClientHandshake {
    /// Creates a request for `target` on `host` with a fresh random key.
    pub fn new(target: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            host: host.into(),
            key: generate_key(),
            extra_headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.extra_headers.extend(headers);
        self
    }

    /// Serializes the request head.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "GET {} HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Host: {}\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: {WS_VERSION}\r\n",
            self.target, self.host, self.key
        );
        for (name, value) in &self.extra_headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Validates the server's response head against this request's key.
    pub fn validate_response(&self, block: &str) -> Result<HttpHead, HandshakeError> {
        let head = HttpHead::parse(block)?;

        let mut parts = head.start_line.split_whitespace();
        let version = parts.next().unwrap_or_default();
        let status = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") || status != "101" {
            return Err(HandshakeError::UnexpectedStatus(head.start_line.clone()));
        }

        if !head.has_token("Connection", "upgrade") {
            return Err(HandshakeError::MissingUpgradeToken);
        }

        match head.header("Sec-WebSocket-Accept") {
            Some(accept) if accept == accept_key(&self.key) => Ok(head),
            _ => Err(HandshakeError::AcceptMismatch),
        }
    }
}
