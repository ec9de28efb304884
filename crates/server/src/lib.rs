//! Multi-client WebSocket server.
//!
//! Each accepted TCP stream gets its own task that runs the upgrade and then
//! the connection's read pump. The [`Server`] keeps a registry of those
//! connections for targeted sends, broadcast and shutdown, and reports
//! [`ServerEvent`]s on a channel obtained with [`Server::take_events`].

pub mod config;
pub mod event;
pub mod server;

use corews_connection::{ConnectionError, ConnectionId, SendError};

pub use config::ServerConfig;
pub use event::ServerEvent;
pub use server::{Authenticator, Server};

/// Errors from the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("send failed: {0}")]
    Send(#[from] SendError),

    #[error("TLS handshake timed out")]
    TlsTimeout,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("no connection with id {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),
}
