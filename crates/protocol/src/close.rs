//! Close status codes and close frame payloads.

/// Close status code (RFC 6455 §7.4.1).
///
/// Codes outside the named set, such as application codes 3000-4999, are kept
/// as [`CloseStatusCode::Other`] rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseStatusCode {
    NormalClosure,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    Reserved,
    /// No code was present in the close frame.
    NoStatus,
    AbnormalClosure,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    MandatoryExtension,
    InternalError,
    BadGateway,
    TlsHandshakeError,
    Other(u16),
}

impl CloseStatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::NormalClosure => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::UnsupportedData => 1003,
            Self::Reserved => 1004,
            Self::NoStatus => 1005,
            Self::AbnormalClosure => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::BadGateway => 1014,
            Self::TlsHandshakeError => 1015,
            Self::Other(code) => code,
        }
    }

    /// Whether the code may appear on the wire.
    ///
    /// 1005, 1006 and 1015 are reserved for local reporting only.
    pub fn is_sendable(self) -> bool {
        !matches!(
            self,
            Self::NoStatus | Self::AbnormalClosure | Self::TlsHandshakeError
        )
    }
}

impl From<u16> for CloseStatusCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::NormalClosure,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::UnsupportedData,
            1004 => Self::Reserved,
            1005 => Self::NoStatus,
            1006 => Self::AbnormalClosure,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            1014 => Self::BadGateway,
            1015 => Self::TlsHandshakeError,
            other => Self::Other(other),
        }
    }
}

impl From<CloseStatusCode> for u16 {
    fn from(code: CloseStatusCode) -> Self {
        code.as_u16()
    }
}

impl std::fmt::Display for CloseStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.as_u16())
    }
}

/// Longest reason that fits a 125-byte control payload after the code.
pub const MAX_CLOSE_REASON: usize = 123;

/// Parsed body of a Close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseStatusCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseStatusCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parses a close payload: `[2 bytes BE code][UTF-8 reason]`.
    ///
    /// A payload shorter than two bytes yields [`CloseStatusCode::NoStatus`].
    pub fn from_payload(payload: &[u8]) -> Self {
        if payload.len() < 2 {
            return Self::new(CloseStatusCode::NoStatus, "");
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        Self {
            code: code.into(),
            reason: String::from_utf8_lossy(&payload[2..]).into_owned(),
        }
    }

    /// Serializes the close body. Codes that must not be sent produce an
    /// empty payload.
    ///
    /// The reason is cut to [`MAX_CLOSE_REASON`] bytes at a character
    /// boundary so the frame stays within the control-frame limit.
    pub fn to_payload(&self) -> Vec<u8> {
        if !self.code.is_sendable() {
            return Vec::new();
        }
        let mut end = self.reason.len().min(MAX_CLOSE_REASON);
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }
        let mut out = Vec::with_capacity(2 + end);
        out.extend_from_slice(&self.code.as_u16().to_be_bytes());
        out.extend_from_slice(&self.reason.as_bytes()[..end]);
        out
    }
}
