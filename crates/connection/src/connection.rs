//! A single WebSocket connection from accept/connect through the upgrade
//! handshake, and the split into read and write pumps once it is open.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use corews_protocol::constants::{MAX_PAYLOAD_SIZE, READ_CHUNK_SIZE, SEND_BUFFER_SIZE};
use corews_protocol::handshake::{HttpHead, take_header_block};
use corews_protocol::{ClientHandshake, HandshakeError, UpgradeRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ConnectionError;
use crate::event::EventSink;
use crate::reader::{Disconnect, FrameReader, ReadOptions, read_pump};
use crate::sender::{self, Sender};
use crate::state::{ConnectionState, Role, SharedState};
use crate::stream::AsyncStream;

/// Numeric connection identifier, unique within one server.
pub type ConnectionId = u64;

/// A connection that has not been upgraded yet.
pub struct Connection<S> {
    id: ConnectionId,
    role: Role,
    stream: S,
    secure: bool,
    state: SharedState,
    buffer: BytesMut,
    max_payload: usize,
}

impl<S: AsyncStream> Connection<S> {
    pub fn new(id: ConnectionId, role: Role, stream: S, secure: bool) -> Self {
        Self {
            id,
            role,
            stream,
            secure,
            state: SharedState::new(ConnectionState::AwaitingUpgrade),
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Shares an existing state cell, e.g. one a client exposed while still
    /// connecting. The cell is advanced to `AwaitingUpgrade`.
    pub fn with_state(mut self, state: SharedState) -> Self {
        state.advance(ConnectionState::AwaitingUpgrade);
        self.state = state;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    /// Server side: reads and validates the client's upgrade request, then
    /// answers `101 Switching Protocols`.
    ///
    /// `authorize` sees the parsed request (path, query credentials, headers)
    /// and may reject it. Any failure leaves the connection `Closed`; the
    /// caller drops it to release the transport.
    pub async fn accept_upgrade<F>(
        &mut self,
        authorize: F,
        read_timeout: Duration,
        upgrade_timeout: Duration,
    ) -> Result<UpgradeRequest, ConnectionError>
    where
        F: FnOnce(&UpgradeRequest) -> bool,
    {
        let result = self
            .accept_upgrade_inner(authorize, read_timeout, upgrade_timeout)
            .await;
        match &result {
            Ok(req) => {
                self.state.advance(ConnectionState::Open);
                info!(id = self.id, path = %req.path, "connection upgraded");
            }
            Err(e) => {
                self.state.advance(ConnectionState::Closed);
                warn!(id = self.id, "upgrade failed: {e}");
            }
        }
        result
    }

    async fn accept_upgrade_inner<F>(
        &mut self,
        authorize: F,
        read_timeout: Duration,
        upgrade_timeout: Duration,
    ) -> Result<UpgradeRequest, ConnectionError>
    where
        F: FnOnce(&UpgradeRequest) -> bool,
    {
        let deadline = Instant::now() + upgrade_timeout;
        let block = loop {
            if let Some(block) = self.take_head()? {
                break block;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectionError::UpgradeTimeout(upgrade_timeout));
            }
            self.read_some(read_timeout.min(deadline - now)).await?;
        };

        let request = UpgradeRequest::parse(&block)?;
        if !authorize(&request) {
            return Err(HandshakeError::Unauthorized.into());
        }

        self.stream.write_all(&request.response()).await?;
        self.stream.flush().await?;
        Ok(request)
    }

    /// Client side: sends the upgrade request and polls for the response at
    /// `retry_interval` until it arrives, the peer disconnects, or `timeout`
    /// has passed.
    pub async fn request_upgrade(
        &mut self,
        handshake: &ClientHandshake,
        retry_interval: Duration,
        timeout: Duration,
    ) -> Result<HttpHead, ConnectionError> {
        let result = self.request_upgrade_inner(handshake, retry_interval, timeout).await;
        match &result {
            Ok(_) => {
                self.state.advance(ConnectionState::Open);
                debug!(target = %handshake.target, "upgrade accepted");
            }
            Err(_) => {
                self.state.advance(ConnectionState::Closed);
            }
        }
        result
    }

    async fn request_upgrade_inner(
        &mut self,
        handshake: &ClientHandshake,
        retry_interval: Duration,
        timeout: Duration,
    ) -> Result<HttpHead, ConnectionError> {
        self.stream.write_all(&handshake.to_bytes()).await?;
        self.stream.flush().await?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(block) = self.take_head()? {
                return Ok(handshake.validate_response(&block)?);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectionError::UpgradeTimeout(timeout));
            }
            self.read_some(retry_interval.min(deadline - now)).await?;
        }
    }

    /// Reads once, waiting at most `wait`. Returns whether bytes arrived.
    async fn read_some(&mut self, wait: Duration) -> Result<bool, ConnectionError> {
        self.buffer.reserve(READ_CHUNK_SIZE);
        match tokio::time::timeout(wait, self.stream.read_buf(&mut self.buffer)).await {
            Err(_) => Ok(false),
            Ok(Ok(0)) => Err(ConnectionError::Eof),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Splits a complete header block off the buffer. Whatever follows it
    /// stays buffered for the frame decoder.
    fn take_head(&mut self) -> Result<Option<String>, HandshakeError> {
        Ok(take_header_block(&self.buffer)?.map(|(block, used)| {
            self.buffer.advance(used);
            block
        }))
    }

    /// Starts the write pump and hands back the pieces of an open connection.
    ///
    /// The write pump stops when `cancel` fires; the read side is driven by
    /// [`OpenConnection::run`].
    pub fn open(self, cancel: CancellationToken) -> OpenConnection<S> {
        self.open_with_capacity(SEND_BUFFER_SIZE, cancel)
    }

    /// Like [`open`](Self::open), with an outbound queue of `capacity`
    /// frames instead of the default.
    pub fn open_with_capacity(
        self,
        capacity: usize,
        cancel: CancellationToken,
    ) -> OpenConnection<S> {
        let (read_half, write_half) = tokio::io::split(self.stream);
        let (sender, rx) = sender::channel(self.state.clone(), capacity);
        let writer = tokio::spawn(sender::write_pump(write_half, rx, self.role, cancel.clone()));
        let reader = FrameReader::new(
            read_half,
            self.buffer,
            self.role.expects_masked(),
            self.max_payload,
        );

        OpenConnection {
            id: self.id,
            reader,
            sender,
            writer,
            cancel,
        }
    }
}

/// An upgraded connection with its write pump running.
pub struct OpenConnection<S> {
    id: ConnectionId,
    reader: FrameReader<ReadHalf<S>>,
    sender: Sender,
    writer: JoinHandle<()>,
    cancel: CancellationToken,
}

impl<S: AsyncStream> OpenConnection<S> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the read pump on the current task until the connection ends,
    /// then stops the write pump and waits for it to release the stream.
    pub async fn run<E>(self, events: &E, options: &ReadOptions) -> Disconnect
    where
        E: EventSink + ?Sized,
    {
        let outcome = read_pump(self.reader, &self.sender, events, &self.cancel, options).await;
        // When read pump exits, cancel the write pump too.
        self.cancel.cancel();
        if let Err(e) = self.writer.await {
            warn!(id = self.id, "write pump panicked: {e}");
        }
        debug!(id = self.id, code = %outcome.code(), "connection finished");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ConnectionEvent;
    use corews_protocol::frame::encode_with_key;
    use corews_protocol::{CloseFrame, CloseStatusCode, Frame, decode};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn upgrade_request(target: &str) -> String {
        format!(
            "GET {target} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: {RFC_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        )
    }

    async fn read_head(peer: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            peer.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    fn server(stream: DuplexStream) -> Connection<DuplexStream> {
        Connection::new(1, Role::Server, stream, false)
    }

    #[tokio::test]
    async fn server_upgrade_answers_with_accept_key() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let mut conn = server(local);
        peer.write_all(upgrade_request("/chat").as_bytes()).await.unwrap();

        let req = conn
            .accept_upgrade(|_| true, Duration::from_millis(50), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(req.path, "/chat");
        assert_eq!(conn.state(), ConnectionState::Open);

        let response = read_head(&mut peer).await;
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains(&format!("Sec-WebSocket-Accept: {RFC_ACCEPT}\r\n")));
    }

    #[tokio::test]
    async fn bytes_after_the_request_reach_the_frame_decoder() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let mut conn = server(local);

        let mut wire = upgrade_request("/").into_bytes();
        wire.extend(encode_with_key(&Frame::text("early"), Some([7, 7, 7, 7])));
        wire.extend(encode_with_key(
            &Frame::close(CloseStatusCode::NormalClosure),
            Some([7, 7, 7, 7]),
        ));
        peer.write_all(&wire).await.unwrap();

        conn.accept_upgrade(|_| true, Duration::from_millis(50), Duration::from_secs(2))
            .await
            .unwrap();

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let open = conn.open(CancellationToken::new());
        let outcome = open.run(&events_tx, &ReadOptions::default()).await;

        assert_eq!(outcome.code(), CloseStatusCode::NormalClosure);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Text("early".into())
        );
    }

    #[tokio::test]
    async fn rejected_credentials_close_the_connection() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let mut conn = server(local);
        peer.write_all(upgrade_request("/?user=eve&pwd=nope").as_bytes())
            .await
            .unwrap();

        let err = conn
            .accept_upgrade(
                |req| req.credentials.user.as_deref() == Some("alice"),
                Duration::from_millis(50),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Handshake(HandshakeError::Unauthorized)
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let (local, _peer) = tokio::io::duplex(4096);
        let mut conn = server(local);

        let err = conn
            .accept_upgrade(|_| true, Duration::from_millis(100), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::UpgradeTimeout(_)));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn peer_hangup_during_upgrade_is_eof() {
        let (local, peer) = tokio::io::duplex(4096);
        let mut conn = server(local);
        drop(peer);

        let err = conn
            .accept_upgrade(|_| true, Duration::from_millis(50), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Eof));
    }

    #[tokio::test]
    async fn client_rejects_wrong_accept_key() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let mut conn = Connection::new(0, Role::Client, local, false);
        let handshake = ClientHandshake::new("/", "localhost");

        let fake_server = tokio::spawn(async move {
            read_head(&mut peer).await;
            peer.write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Accept: bogus\r\n\r\n",
            )
            .await
            .unwrap();
            peer
        });

        let err = conn
            .request_upgrade(&handshake, Duration::from_millis(20), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Handshake(HandshakeError::AcceptMismatch)
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
        fake_server.await.unwrap();
    }

    #[tokio::test]
    async fn client_and_server_exchange_frames_and_close() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = Connection::new(0, Role::Client, client_io, false);
        let mut server = server(server_io);
        let handshake = ClientHandshake::new("/", "localhost");

        let (accepted, requested) = tokio::join!(
            server.accept_upgrade(|_| true, Duration::from_millis(20), Duration::from_secs(2)),
            client.request_upgrade(&handshake, Duration::from_millis(20), Duration::from_secs(2)),
        );
        accepted.unwrap();
        requested.unwrap();

        let (server_tx, mut server_events) = mpsc::unbounded_channel();
        let (client_tx, mut client_events) = mpsc::unbounded_channel();
        let server = server.open(CancellationToken::new());
        let client = client.open(CancellationToken::new());
        let server_sender = server.sender();
        let client_sender = client.sender();

        let server_task = tokio::spawn(async move {
            server.run(&server_tx, &ReadOptions::default()).await
        });
        let client_task = tokio::spawn(async move {
            client.run(&client_tx, &ReadOptions::default()).await
        });

        client_sender.send_text("hello").unwrap();
        assert_eq!(
            server_events.recv().await.unwrap(),
            ConnectionEvent::Text("hello".into())
        );

        server_sender.send_ping().unwrap();
        assert_eq!(
            client_events.recv().await.unwrap(),
            ConnectionEvent::Ping(Vec::new())
        );
        assert_eq!(
            server_events.recv().await.unwrap(),
            ConnectionEvent::Pong(Vec::new())
        );

        client_sender.close(CloseStatusCode::NormalClosure).unwrap();
        let server_outcome = server_task.await.unwrap();
        let client_outcome = client_task.await.unwrap();

        let normal = CloseFrame::new(CloseStatusCode::NormalClosure, "");
        assert_eq!(server_outcome, Disconnect::Closed(normal.clone()));
        assert_eq!(client_outcome, Disconnect::Closed(normal.clone()));
        assert_eq!(
            server_events.recv().await.unwrap(),
            ConnectionEvent::Closed(normal)
        );
        assert_eq!(client_sender.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn server_frames_are_unmasked() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let mut conn = server(local);
        peer.write_all(upgrade_request("/").as_bytes()).await.unwrap();
        conn.accept_upgrade(|_| true, Duration::from_millis(50), Duration::from_secs(2))
            .await
            .unwrap();
        read_head(&mut peer).await;

        let open = conn.open(CancellationToken::new());
        open.sender().send_text("plain").unwrap();

        let mut buf = vec![0u8; 7];
        peer.read_exact(&mut buf).await.unwrap();
        let (frame, used) = decode(&buf, false).unwrap().unwrap();
        assert_eq!(used, 7);
        assert_eq!(frame, Frame::text("plain"));
    }
}
