//! WebSocket client.
//!
//! [`Client::connect`] opens the transport and completes the upgrade within
//! one time budget. The read side is then driven by [`Client::run`] (or a
//! task started with [`Client::spawn`]); sends go through the connection's
//! write pump and never block.

use std::sync::Arc;
use std::time::Duration;

use corews_connection::{
    BoxedStream, Connection, ConnectionState, Disconnect, OpenConnection, ReadOptions, Role,
    RustlsConnector, SecureStreamProvider, Sender, SharedState,
};
use corews_protocol::constants::{CLOSE_FLUSH_TIMEOUT, RUN_LOOP_YIELD};
use corews_protocol::{ClientHandshake, CloseStatusCode, Frame};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ClientError;
use crate::config::ClientConfig;
use crate::endpoint::WsUrl;
use crate::event::{ClientEvent, ClientSink};

/// A WebSocket client connected to one server.
pub struct Client {
    url: WsUrl,
    config: ClientConfig,
    state: SharedState,
    sender: Sender,
    cancel: CancellationToken,
    open: Mutex<Option<OpenConnection<BoxedStream>>>,
    sink: ClientSink,
    events_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
}

impl Client {
    /// Connects to `url` (`ws://` or `wss://`) and completes the upgrade.
    ///
    /// `wss` uses a [`RustlsConnector`] with the bundled web PKI roots.
    pub async fn connect(
        url: &str,
        extra_headers: &[(String, String)],
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        Self::connect_with(url, extra_headers, config, None).await
    }

    /// Like [`connect`](Self::connect), with a caller-supplied TLS provider.
    pub async fn connect_with(
        url: &str,
        extra_headers: &[(String, String)],
        config: ClientConfig,
        tls: Option<Arc<dyn SecureStreamProvider>>,
    ) -> Result<Self, ClientError> {
        let url = WsUrl::parse(url)?;
        let state = SharedState::new(ConnectionState::Connecting);
        let budget = config.connect_timeout;
        let started = Instant::now();
        let remaining = || budget.saturating_sub(started.elapsed());

        let tcp = tokio::time::timeout(budget, TcpStream::connect((url.host.as_str(), url.port)))
            .await
            .map_err(|_| ClientError::Timeout(budget))??;
        tcp.set_nodelay(true)?;
        debug!(host = %url.host, port = url.port, "TCP connected");

        let stream: BoxedStream = if url.secure {
            let provider: Arc<dyn SecureStreamProvider> = match tls {
                Some(provider) => provider,
                None => Arc::new(RustlsConnector::default()),
            };
            tokio::time::timeout(remaining(), provider.establish(tcp, &url.host))
                .await
                .map_err(|_| ClientError::Timeout(budget))??
        } else {
            Box::new(tcp)
        };

        let mut conn = Connection::new(0, Role::Client, stream, url.secure)
            .with_state(state.clone())
            .with_max_payload(config.max_payload_size);
        let handshake = ClientHandshake::new(url.target.clone(), url.host_header())
            .with_headers(extra_headers.iter().cloned());
        conn.request_upgrade(&handshake, config.handshake_retry_interval, remaining())
            .await?;
        info!(host = %url.host, port = url.port, target = %url.target, "connected");

        let cancel = CancellationToken::new();
        let open = conn.open(cancel.clone());
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let sink = ClientSink { tx: events_tx };
        sink.send(ClientEvent::Connected);

        Ok(Self {
            url,
            config,
            state,
            sender: open.sender(),
            cancel,
            open: Mutex::new(Some(open)),
            sink,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Returns `true` while the connection is open and its writer alive.
    pub fn is_connected(&self) -> bool {
        self.state.is_open() && self.sender.is_connected()
    }

    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Takes the event receiver. Returns `None` after the first call.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Queues a frame. Returns `false` if it could not be queued; a dead
    /// transport is reported by the run loop, not here.
    pub fn send(&self, frame: Frame) -> bool {
        match self.sender.send(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!("send dropped: {e}");
                false
            }
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::text(text))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> bool {
        self.send(Frame::binary(data))
    }

    /// Runs the read loop on the current task until the connection ends.
    ///
    /// Emits [`ClientEvent::Disconnected`] when the transport is lost and
    /// [`ClientEvent::Closed`] when the close handshake finishes.
    pub async fn run(&self) -> Result<Disconnect, ClientError> {
        let open = self.take_open().await?;
        Ok(drive(open, self.sink.clone(), self.read_options(), self.config.ping_interval).await)
    }

    /// Runs the read loop on a new task.
    pub async fn spawn(&self) -> Result<JoinHandle<Disconnect>, ClientError> {
        let open = self.take_open().await?;
        let sink = self.sink.clone();
        let options = self.read_options();
        let ping_interval = self.config.ping_interval;
        Ok(tokio::spawn(drive(open, sink, options, ping_interval)))
    }

    /// Sends `Close(NormalClosure)`, waits briefly for the handshake to
    /// finish, then releases the transport.
    pub async fn disconnect(&self) {
        if self.sender.close(CloseStatusCode::NormalClosure).is_err() {
            debug!("close frame not queued, releasing transport");
        }

        // Not running means nobody reads the peer's echo; release right away.
        let unread = self.open.lock().await.take();
        if unread.is_none() {
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
                while self.state.get() != ConnectionState::Closed {
                    tokio::time::sleep(RUN_LOOP_YIELD).await;
                }
            })
            .await;
        }

        self.cancel.cancel();
        drop(unread);
        self.state.advance(ConnectionState::Closed);
        info!(host = %self.url.host, port = self.url.port, "disconnected");
    }

    async fn take_open(&self) -> Result<OpenConnection<BoxedStream>, ClientError> {
        self.open.lock().await.take().ok_or(ClientError::AlreadyRunning)
    }

    fn read_options(&self) -> ReadOptions {
        ReadOptions {
            read_timeout: self.config.read_timeout,
            keep_alive: self.config.keep_alive,
            idle_timeout: self.config.idle_timeout,
            max_payload: self.config.max_payload_size,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.sender.close(CloseStatusCode::NormalClosure);
        self.cancel.cancel();
    }
}

async fn drive(
    open: OpenConnection<BoxedStream>,
    sink: ClientSink,
    options: ReadOptions,
    ping_interval: Option<Duration>,
) -> Disconnect {
    let pinger = ping_interval.map(|every| {
        tokio::spawn(ping_pump(open.sender(), every, open.cancel_token()))
    });

    let outcome = open.run(&sink, &options).await;

    if let Some(pinger) = pinger {
        pinger.abort();
    }
    outcome
}

/// Sends periodic pings until cancelled or the connection starts closing.
async fn ping_pump(sender: Sender, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if sender.send_ping().is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corews_connection::{ConnectionEvent, EventSink};
    use tokio::net::TcpListener;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(2),
            handshake_retry_interval: Duration::from_millis(10),
            read_timeout: Duration::from_millis(20),
            ..ClientConfig::default()
        }
    }

    /// One-shot server built from the connection layer. Collects what the
    /// client sends until the connection ends.
    async fn fake_server<F>(script: F) -> (u16, JoinHandle<Vec<ConnectionEvent>>)
    where
        F: FnOnce(Sender) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(1, Role::Server, stream, false);
            conn.accept_upgrade(|_| true, Duration::from_millis(20), Duration::from_secs(2))
                .await
                .unwrap();
            let open = conn.open(CancellationToken::new());
            script(open.sender());

            let (tx, mut rx) = mpsc::unbounded_channel();
            open.run(&tx, &ReadOptions::default()).await;
            let mut seen = Vec::new();
            while let Ok(event) = rx.try_recv() {
                seen.push(event);
            }
            seen
        });
        (port, handle)
    }

    async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn connect_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Client::connect(&format!("ws://127.0.0.1:{port}/"), &[], fast_config()).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }

    #[tokio::test]
    async fn unanswered_upgrade_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let config = ClientConfig {
            connect_timeout: Duration::from_millis(300),
            ..fast_config()
        };
        let started = std::time::Instant::now();
        let result = Client::connect(&format!("ws://127.0.0.1:{port}/"), &[], config).await;
        assert!(matches!(
            result,
            Err(ClientError::Connection(
                corews_connection::ConnectionError::UpgradeTimeout(_)
            ))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn receives_frames_and_disconnects_gracefully() {
        let (port, server) = fake_server(|sender| {
            sender.send_text("welcome").unwrap();
            sender.send_binary(vec![4, 2]).unwrap();
        })
        .await;

        let client = Client::connect(&format!("ws://127.0.0.1:{port}/"), &[], fast_config())
            .await
            .unwrap();
        assert!(client.is_connected());
        let mut events = client.take_events().await.unwrap();
        assert!(client.take_events().await.is_none());
        let run = client.spawn().await.unwrap();
        assert!(matches!(client.run().await, Err(ClientError::AlreadyRunning)));

        assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
        assert_eq!(next_event(&mut events).await, ClientEvent::Text("welcome".into()));
        assert_eq!(next_event(&mut events).await, ClientEvent::Binary(vec![4, 2]));

        assert!(client.send_text("bye"));
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.send_text("too late"));

        let outcome = run.await.unwrap();
        assert_eq!(outcome.code(), CloseStatusCode::NormalClosure);

        let seen = server.await.unwrap();
        assert_eq!(seen[0], ConnectionEvent::Text("bye".into()));
        assert!(matches!(
            seen.last(),
            Some(ConnectionEvent::Closed(close)) if close.code == CloseStatusCode::NormalClosure
        ));
    }

    #[tokio::test]
    async fn server_close_ends_the_run_loop() {
        let (port, server) = fake_server(|sender| {
            sender.close(CloseStatusCode::GoingAway).unwrap();
        })
        .await;

        let client = Client::connect(&format!("ws://127.0.0.1:{port}/"), &[], fast_config())
            .await
            .unwrap();
        let mut events = client.take_events().await.unwrap();

        let outcome = client.run().await.unwrap();
        assert_eq!(outcome.code(), CloseStatusCode::GoingAway);
        assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
        assert!(matches!(
            next_event(&mut events).await,
            ClientEvent::Closed(close) if close.code == CloseStatusCode::GoingAway
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn ping_interval_sends_pings() {
        let (port, server) = fake_server(|_| {}).await;
        let config = ClientConfig {
            ping_interval: Some(Duration::from_millis(30)),
            ..fast_config()
        };
        let client = Client::connect(&format!("ws://127.0.0.1:{port}/"), &[], config)
            .await
            .unwrap();
        let mut events = client.take_events().await.unwrap();
        let _run = client.spawn().await.unwrap();

        assert_eq!(next_event(&mut events).await, ClientEvent::Connected);
        assert_eq!(next_event(&mut events).await, ClientEvent::Pong(Vec::new()));

        drop(client);
        let seen = server.await.unwrap();
        assert!(seen.contains(&ConnectionEvent::Ping(Vec::new())));
    }

    #[tokio::test]
    async fn extra_headers_reach_the_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(1, Role::Server, stream, false);
            let req = conn
                .accept_upgrade(|_| true, Duration::from_millis(20), Duration::from_secs(2))
                .await
                .unwrap();
            req.head.header("X-Token").map(str::to_string)
        });

        let headers = [("X-Token".to_string(), "abc".to_string())];
        let _client = Client::connect(&format!("ws://127.0.0.1:{port}/"), &headers, fast_config())
            .await
            .unwrap();
        assert_eq!(server.await.unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn sink_maps_connection_events() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ClientSink { tx };
        sink.emit(ConnectionEvent::Text("x".into()));
        sink.emit(ConnectionEvent::Disconnected);
        assert_eq!(rx.try_recv().unwrap(), ClientEvent::Text("x".into()));
        assert_eq!(rx.try_recv().unwrap(), ClientEvent::Disconnected);
    }
}
