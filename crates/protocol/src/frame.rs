//! RFC 6455 frame codec.
//!
//! # Wire format
//!
//! ```text
//! [1 byte: FIN | opcode]
//! [1 byte: MASK | len7]
//! [0/2/8 bytes BE: extended length]   len7 == 126 -> u16, len7 == 127 -> u64
//! [0/4 bytes: masking key]            present iff MASK is set
//! [N bytes: payload]                  XOR key[i % 4] when masked
//! ```
//!
//! Decoding never consumes a partial frame: if the buffer does not yet hold
//! the whole frame, [`decode`] returns `Ok(None)` and the caller keeps its
//! bytes until more arrive.

use crate::close::{CloseFrame, CloseStatusCode};
use crate::constants::MAX_PAYLOAD_SIZE;

/// Largest possible frame header: 2 + 8 bytes of length + 4 bytes of key.
pub const MAX_HEADER_SIZE: usize = 14;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const LEN_MASK: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Frame opcode.
///
/// Values 3-7 and 11-15 are reserved by the protocol. They decode to
/// [`Opcode::Reserved`] so the receiver can log and skip the frame while
/// staying aligned on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    /// Maps the low nibble of the first header byte to an opcode.
    pub fn from_u8(value: u8) -> Self {
        match value & OPCODE_MASK {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(value) => value & OPCODE_MASK,
        }
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Self::Reserved(_))
    }
}

/// One protocol-level unit: an opcode plus its unmasked payload.
///
/// `fin` is clear on every fragment of a message except the last. Frames
/// built by the constructors below are always final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Same frame with the FIN bit cleared, for a fragment that more
    /// continuation frames will follow.
    pub fn non_final(mut self) -> Self {
        self.fin = false;
        self
    }

    /// A UTF-8 text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    /// An empty ping.
    pub fn ping() -> Self {
        Self::new(Opcode::Ping, Vec::new())
    }

    /// An empty pong.
    pub fn pong() -> Self {
        Self::new(Opcode::Pong, Vec::new())
    }

    /// A close frame carrying `code` and no reason.
    pub fn close(code: CloseStatusCode) -> Self {
        Self::close_with(&CloseFrame::new(code, ""))
    }

    pub fn close_with(close: &CloseFrame) -> Self {
        Self::new(Opcode::Close, close.to_payload())
    }
}

/// Errors raised while decoding a frame header.
///
/// Running out of bytes is not one of them; see [`decode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("unexpected mask bit (expected masked = {expected})")]
    UnexpectedMask { expected: bool },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: usize },
}

/// XORs `data` in place with the repeating 4-byte `key`.
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Decodes one frame from the front of `buf` using [`MAX_PAYLOAD_SIZE`].
///
/// See [`decode_with_limit`].
pub fn decode(buf: &[u8], masked: bool) -> Result<Option<(Frame, usize)>, FrameError> {
    decode_with_limit(buf, masked, MAX_PAYLOAD_SIZE)
}

/// Decodes one frame from the front of `buf`.
///
/// `masked` states whether the peer is required to mask (true when this side
/// is the server). Returns the frame and the number of bytes it occupied, or
/// `Ok(None)` when `buf` does not yet contain a complete frame. Nothing is
/// allocated for the payload until all of its bytes are present.
pub fn decode_with_limit(
    buf: &[u8],
    masked: bool,
    max_payload: usize,
) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & FIN_BIT != 0;
    let opcode = Opcode::from_u8(buf[0]);
    let has_mask = buf[1] & MASK_BIT != 0;
    if has_mask != masked {
        return Err(FrameError::UnexpectedMask { expected: masked });
    }

    let mut index = 2;
    let declared = match buf[1] & LEN_MASK {
        LEN_16 => {
            if buf.len() < index + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            index += 2;
            len
        }
        LEN_64 => {
            if buf.len() < index + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            index += 8;
            u64::from_be_bytes(raw)
        }
        len => len as u64,
    };

    if declared > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            size: declared,
            max: max_payload,
        });
    }
    let len = declared as usize;

    let key = if masked {
        if buf.len() < index + 4 {
            return Ok(None);
        }
        let key = [buf[index], buf[index + 1], buf[index + 2], buf[index + 3]];
        index += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() - index < len {
        return Ok(None);
    }

    let mut payload = buf[index..index + len].to_vec();
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }

    Ok(Some((
        Frame {
            fin,
            opcode,
            payload,
        },
        index + len,
    )))
}

/// Encodes `frame`. The FIN bit follows [`Frame::fin`].
///
/// When `mask` is set a fresh random key is generated. Clients must mask and
/// servers must not; the caller picks the value for its role.
pub fn encode(frame: &Frame, mask: bool) -> Vec<u8> {
    let key = mask.then(rand::random::<[u8; 4]>);
    encode_with_key(frame, key)
}

/// Encodes `frame`, masking with `key` when one is given.
pub fn encode_with_key(frame: &Frame, key: Option<[u8; 4]>) -> Vec<u8> {
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(MAX_HEADER_SIZE + len);

    let fin_bit = if frame.fin { FIN_BIT } else { 0 };
    out.push(fin_bit | frame.opcode.as_u8());

    let mask_bit = if key.is_some() { MASK_BIT } else { 0 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | LEN_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LEN_64);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(&frame.payload),
    }

    out
}
