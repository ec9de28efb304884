//! WebSocket wire protocol (RFC 6455) without I/O.
//!
//! - [`frame`]: binary frame codec with masking and extended lengths.
//! - [`handshake`]: HTTP upgrade request/response and accept-key derivation.
//! - [`close`]: close status codes and close payloads.
//! - [`constants`]: protocol constants and default timings shared by the
//!   connection, server and client crates.

pub mod close;
pub mod constants;
pub mod frame;
pub mod handshake;

pub use close::{CloseFrame, CloseStatusCode};
pub use frame::{Frame, FrameError, Opcode, apply_mask, decode, decode_with_limit, encode};
pub use handshake::{ClientHandshake, Credentials, HandshakeError, UpgradeRequest, accept_key};
