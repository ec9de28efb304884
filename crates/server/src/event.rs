use std::net::SocketAddr;

use corews_connection::{ConnectionEvent, ConnectionId, EventSink};
use corews_protocol::CloseStatusCode;
use tokio::sync::mpsc;
use tracing::trace;

/// Notifications delivered to the application that owns a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected {
        id: ConnectionId,
        peer_addr: SocketAddr,
    },
    MessageReceived {
        id: ConnectionId,
        text: String,
    },
    BinaryReceived {
        id: ConnectionId,
        data: Vec<u8>,
    },
    /// Payload of a continuation frame, not reassembled.
    FragmentReceived {
        id: ConnectionId,
        data: Vec<u8>,
    },
    /// Sent after the connection has been removed from the registry.
    ClientDisconnected {
        id: ConnectionId,
        code: CloseStatusCode,
    },
}

/// Tags a connection's events with its id and forwards them to the server
/// channel.
pub(crate) struct ServerSink {
    pub(crate) id: ConnectionId,
    pub(crate) tx: mpsc::Sender<ServerEvent>,
}

impl ServerSink {
    pub(crate) fn send(&self, event: ServerEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!(id = self.id, "failed to deliver server event: {e}");
        }
    }
}

impl EventSink for ServerSink {
    fn emit(&self, event: ConnectionEvent) {
        let id = self.id;
        match event {
            ConnectionEvent::Text(text) => self.send(ServerEvent::MessageReceived { id, text }),
            ConnectionEvent::Binary(data) => self.send(ServerEvent::BinaryReceived { id, data }),
            ConnectionEvent::Continuation(data) => {
                self.send(ServerEvent::FragmentReceived { id, data })
            }
            ConnectionEvent::Ping(_) => trace!(id, "ping"),
            ConnectionEvent::Pong(_) => trace!(id, "pong"),
            // Reported as ClientDisconnected once the registry entry is gone.
            ConnectionEvent::Closed(_) | ConnectionEvent::Disconnected => {}
        }
    }
}
