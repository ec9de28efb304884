use corews_connection::{ConnectionEvent, EventSink};
use corews_protocol::CloseFrame;
use tokio::sync::mpsc;

/// Notifications delivered to the application that owns a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The upgrade completed.
    Connected,
    Text(String),
    Binary(Vec<u8>),
    Continuation(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// The close handshake finished with this status.
    Closed(CloseFrame),
    /// The transport was lost without a close handshake.
    Disconnected,
}

impl From<ConnectionEvent> for ClientEvent {
    fn from(event: ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::Text(text) => Self::Text(text),
            ConnectionEvent::Binary(data) => Self::Binary(data),
            ConnectionEvent::Continuation(data) => Self::Continuation(data),
            ConnectionEvent::Ping(data) => Self::Ping(data),
            ConnectionEvent::Pong(data) => Self::Pong(data),
            ConnectionEvent::Closed(close) => Self::Closed(close),
            ConnectionEvent::Disconnected => Self::Disconnected,
        }
    }
}

#[derive(Clone)]
pub(crate) struct ClientSink {
    pub(crate) tx: mpsc::Sender<ClientEvent>,
}

impl ClientSink {
    pub(crate) fn send(&self, event: ClientEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!("failed to deliver client event: {e}");
        }
    }
}

impl EventSink for ClientSink {
    fn emit(&self, event: ConnectionEvent) {
        self.send(event.into());
    }
}
