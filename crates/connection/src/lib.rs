//! Per-connection WebSocket machinery shared by the server and the client.
//!
//! A [`Connection`] drives the HTTP upgrade over any [`AsyncStream`]. Once
//! open it splits into a write pump (owning the write half, fed by cloneable
//! [`Sender`] handles) and a read pump that decodes frames, answers pings,
//! completes the close handshake and reports [`ConnectionEvent`]s.

pub mod connection;
pub mod event;
pub mod reader;
pub mod sender;
pub mod state;
pub mod stream;
pub mod tls;

use std::time::Duration;

use corews_protocol::HandshakeError;

pub use connection::{Connection, ConnectionId, OpenConnection};
pub use event::{ConnectionEvent, EventSink};
pub use reader::{Disconnect, FrameReader, ReadOptions, read_pump};
pub use sender::{SendError, Sender};
pub use state::{ConnectionState, Role, SharedState};
pub use stream::{AsyncStream, BoxedStream};
pub use tls::{RustlsAcceptor, RustlsConnector, SecureAcceptor, SecureStreamProvider};

/// Errors raised while establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("upgrade not completed within {0:?}")]
    UpgradeTimeout(Duration),

    #[error("peer closed the stream")]
    Eof,
}
