use std::time::Duration;

use corews_protocol::constants::{
    CLIENT_READ_TIMEOUT, CONNECT_TIMEOUT, EVENT_BUFFER_SIZE, HANDSHAKE_RETRY_INTERVAL,
    KEEP_ALIVE_INTERVAL, MAX_PAYLOAD_SIZE,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Budget for TCP connect, TLS and the upgrade response together.
    pub connect_timeout: Duration,
    /// How often to poll for the upgrade response.
    pub handshake_retry_interval: Duration,
    pub read_timeout: Duration,
    /// How often the run loop checks that the transport is alive.
    pub keep_alive: Duration,
    /// Send a ping this often. Off by default.
    pub ping_interval: Option<Duration>,
    /// Treat the connection as dead after this long without inbound bytes.
    pub idle_timeout: Option<Duration>,
    pub max_payload_size: usize,
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            handshake_retry_interval: HANDSHAKE_RETRY_INTERVAL,
            read_timeout: CLIENT_READ_TIMEOUT,
            keep_alive: KEEP_ALIVE_INTERVAL,
            ping_interval: None,
            idle_timeout: None,
            max_payload_size: MAX_PAYLOAD_SIZE,
            event_buffer: EVENT_BUFFER_SIZE,
        }
    }
}
