use std::time::Duration;

use corews_protocol::constants::{
    ACCEPT_POLL_INTERVAL, EVENT_BUFFER_SIZE, KEEP_ALIVE_INTERVAL, MAX_PAYLOAD_SIZE,
    SERVER_READ_TIMEOUT, UPGRADE_TIMEOUT,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Upper bound on one socket read before liveness is re-checked.
    pub read_timeout: Duration,
    /// Time a client gets to complete TLS and the HTTP upgrade.
    pub upgrade_timeout: Duration,
    /// Registry maintenance interval of the accept loop.
    pub accept_poll_interval: Duration,
    /// Delay between a successful upgrade and the `ClientConnected` event.
    pub connected_settle_delay: Duration,
    pub keep_alive: Duration,
    pub max_payload_size: usize,
    /// Capacity of the server event channel.
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            read_timeout: SERVER_READ_TIMEOUT,
            upgrade_timeout: UPGRADE_TIMEOUT,
            accept_poll_interval: ACCEPT_POLL_INTERVAL,
            connected_settle_delay: Duration::ZERO,
            keep_alive: KEEP_ALIVE_INTERVAL,
            max_payload_size: MAX_PAYLOAD_SIZE,
            event_buffer: EVENT_BUFFER_SIZE,
        }
    }
}
