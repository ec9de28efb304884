use std::time::Duration;

/// GUID appended to the client key when deriving `Sec-WebSocket-Accept`.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this crate speaks.
pub const WS_VERSION: &str = "13";

/// Terminator of an HTTP header block.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest HTTP upgrade header block accepted from a peer (16 KB).
pub const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

/// Largest frame payload accepted by default (50 MB).
pub const MAX_PAYLOAD_SIZE: usize = 50 * 1024 * 1024;

/// How often the server accept loop wakes up when idle.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read bound for server-side connections.
pub const SERVER_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Read bound for client connections.
pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Time an accepted socket has to complete the upgrade handshake.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between polls for the server's upgrade response.
pub const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Total time a client waits for TCP connect plus upgrade.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the client run loop checks that the transport is alive.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between client run loop iterations that found nothing to do.
pub const RUN_LOOP_YIELD: Duration = Duration::from_millis(10);

/// Time allowed for the closing handshake to flush before the stream is dropped.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Capacity of the per-connection outbound frame queue.
pub const SEND_BUFFER_SIZE: usize = 1024;

/// Capacity of event channels handed to applications.
pub const EVENT_BUFFER_SIZE: usize = 1024;

/// Size of a single socket read.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;
