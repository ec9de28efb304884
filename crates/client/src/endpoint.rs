//! `ws://` and `wss://` endpoint parsing.

use crate::ClientError;

/// A parsed WebSocket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub secure: bool,
    /// Host without IPv6 brackets; used for DNS and TLS server names.
    pub host: String,
    pub port: u16,
    /// Path plus query, as sent on the request line.
    pub target: String,
}

impl WsUrl {
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let url = url::Url::parse(input)
            .map_err(|e| ClientError::InvalidUrl(format!("{input}: {e}")))?;

        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => return Err(ClientError::UnsupportedScheme(other.to_string())),
        };

        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(addr)) => addr.to_string(),
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(ClientError::InvalidUrl(format!("{input}: missing host"))),
        };
        let port = url
            .port()
            .unwrap_or(if secure { 443 } else { 80 });

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        Ok(Self {
            secure,
            host,
            port,
            target,
        })
    }

    /// Value for the `Host` header: the port is omitted when it is the
    /// scheme default.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}
