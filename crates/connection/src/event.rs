//! Notifications raised by a running connection.

use corews_protocol::CloseFrame;
use tokio::sync::mpsc;

/// Something the read pump observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Text(String),
    Binary(Vec<u8>),
    /// Payload of a continuation frame, delivered as-is without reassembly.
    Continuation(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// The close handshake ran (either side initiated it) or the connection
    /// was failed with a protocol status code.
    Closed(CloseFrame),
    /// The transport went away without a close handshake.
    Disconnected,
}

/// Receives [`ConnectionEvent`]s from a read pump.
///
/// Implementations must not block: the read pump calls `emit` inline.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: ConnectionEvent);
}

impl EventSink for mpsc::Sender<ConnectionEvent> {
    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.try_send(event) {
            tracing::warn!("failed to deliver connection event: {e}");
        }
    }
}

impl EventSink for mpsc::UnboundedSender<ConnectionEvent> {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.send(event);
    }
}
