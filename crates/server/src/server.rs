//! WebSocket server.
//!
//! Listens on a TCP port, upgrades every accepted connection on its own task
//! and keeps a registry of live connections for targeted sends, broadcast and
//! queries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use corews_connection::{
    BoxedStream, Connection, ConnectionId, ConnectionState, ReadOptions, Role, SecureAcceptor,
    Sender, SharedState,
};
use corews_protocol::constants::CLOSE_FLUSH_TIMEOUT;
use corews_protocol::{CloseStatusCode, Frame, UpgradeRequest};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::config::ServerConfig;
use crate::event::{ServerEvent, ServerSink};

/// Decides whether a client may connect, given the `user` and `pwd` query
/// parameters of its upgrade request.
pub type Authenticator = Arc<dyn Fn(Option<&str>, Option<&str>) -> bool + Send + Sync>;

/// Registry entry. The connection's own task owns the stream; the registry
/// only holds what other tasks need to reach it.
struct Entry {
    peer_addr: SocketAddr,
    state: SharedState,
    sender: Option<Sender>,
    cancel: CancellationToken,
}

/// A multi-client WebSocket server.
pub struct Server {
    config: ServerConfig,
    authenticate: Option<Authenticator>,
    acceptor: Option<Arc<dyn SecureAcceptor>>,
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, Entry>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    events_tx: mpsc::Sender<ServerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        Self {
            config,
            authenticate: None,
            acceptor: None,
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Installs an authentication predicate. Without one every upgrade
    /// request is accepted.
    pub fn with_authenticator<F>(mut self, authenticate: F) -> Self
    where
        F: Fn(Option<&str>, Option<&str>) -> bool + Send + Sync + 'static,
    {
        self.authenticate = Some(Arc::new(authenticate));
        self
    }

    /// Serves `wss` by running every accepted stream through `acceptor`.
    pub fn with_tls(mut self, acceptor: Arc<dyn SecureAcceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    /// Takes the event receiver. Returns `None` after the first call.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    pub fn is_secure(&self) -> bool {
        self.acceptor.is_some()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Ids of all registered connections, upgraded or not, in ascending order.
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn state_of(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.read().await.get(&id).map(|e| e.state.get())
    }

    pub async fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.read().await.get(&id).map(|e| e.peer_addr)
    }

    /// Sends `frame` to one open connection.
    pub async fn send_to(&self, id: ConnectionId, frame: Frame) -> Result<(), ServerError> {
        let sender = self.open_sender(id).await?;
        sender.send(frame)?;
        Ok(())
    }

    pub async fn send_text_to(&self, id: ConnectionId, text: &str) -> Result<(), ServerError> {
        self.send_to(id, Frame::text(text)).await
    }

    /// Sends `frame` to every open connection and returns how many accepted
    /// it. A connection that refuses the frame is cancelled and removed from
    /// the registry; the others still get it.
    pub async fn broadcast(&self, frame: Frame) -> usize {
        let targets: Vec<(ConnectionId, Sender, CancellationToken)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(_, e)| e.state.is_open())
                .filter_map(|(id, e)| e.sender.clone().map(|s| (*id, s, e.cancel.clone())))
                .collect()
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sender, cancel) in targets {
            match sender.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(id, "broadcast failed, dropping connection: {e}");
                    cancel.cancel();
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut connections = self.connections.write().await;
            for id in &failed {
                connections.remove(id);
            }
        }
        tracing::trace!(delivered, failed = failed.len(), opcode = ?frame.opcode, "broadcast");
        delivered
    }

    pub async fn broadcast_text(&self, text: &str) -> usize {
        self.broadcast(Frame::text(text)).await
    }

    /// Starts the close handshake on one connection, or drops it outright if
    /// it has not been upgraded yet. Returns `false` for unknown ids.
    pub async fn disconnect(&self, id: ConnectionId, code: CloseStatusCode) -> bool {
        let connections = self.connections.read().await;
        let Some(entry) = connections.get(&id) else {
            return false;
        };
        match &entry.sender {
            Some(sender) if sender.close(code).is_ok() => {}
            _ => entry.cancel.cancel(),
        }
        true
    }

    /// Gracefully shuts down the server.
    ///
    /// Every connection sends `GoingAway` before its stream is released.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    ///
    /// Binds to the configured port and accepts connections.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!(secure = self.is_secure(), "server listening on {local_addr}");

        let mut poll = tokio::time::interval(self.config.accept_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.wait_for_drain().await;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }

                _ = poll.tick() => self.prune().await,
            }
        }
    }

    /// Registers a freshly accepted stream and drives it to completion.
    async fn handle_connection(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = SharedState::new(ConnectionState::AwaitingUpgrade);
        let cancel = self.cancel.child_token();

        self.connections.write().await.insert(
            id,
            Entry {
                peer_addr,
                state: state.clone(),
                sender: None,
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(id, %peer_addr, "connection accepted");

        let result = self.serve(id, stream, peer_addr, state.clone(), cancel).await;
        state.advance(ConnectionState::Closed);
        self.connections.write().await.remove(&id);

        match result {
            Ok(code) => {
                tracing::info!(id, %peer_addr, %code, "client disconnected");
                let sink = ServerSink {
                    id,
                    tx: self.events_tx.clone(),
                };
                sink.send(ServerEvent::ClientDisconnected { id, code });
            }
            Err(e) => tracing::warn!(id, %peer_addr, "connection dropped before upgrade: {e}"),
        }
    }

    /// Upgrade, then run the read pump until the connection ends. Errors mean
    /// the connection never reached `Open`.
    async fn serve(
        &self,
        id: ConnectionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        state: SharedState,
        cancel: CancellationToken,
    ) -> Result<CloseStatusCode, ServerError> {
        let stream: BoxedStream = match &self.acceptor {
            Some(acceptor) => {
                tokio::time::timeout(self.config.upgrade_timeout, acceptor.accept(stream))
                    .await
                    .map_err(|_| ServerError::TlsTimeout)??
            }
            None => Box::new(stream),
        };

        let mut conn = Connection::new(id, Role::Server, stream, self.is_secure())
            .with_state(state)
            .with_max_payload(self.config.max_payload_size);

        let authenticate = self.authenticate.clone();
        let authorize = move |req: &UpgradeRequest| match &authenticate {
            Some(check) => check(
                req.credentials.user.as_deref(),
                req.credentials.password.as_deref(),
            ),
            None => true,
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(ServerError::ShuttingDown),
            upgraded = conn.accept_upgrade(
                authorize,
                self.config.read_timeout,
                self.config.upgrade_timeout,
            ) => {
                upgraded?;
            }
        }

        let open = conn.open(cancel);
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.sender = Some(open.sender());
        }

        if !self.config.connected_settle_delay.is_zero() {
            tokio::time::sleep(self.config.connected_settle_delay).await;
        }

        let sink = ServerSink {
            id,
            tx: self.events_tx.clone(),
        };
        sink.send(ServerEvent::ClientConnected { id, peer_addr });

        let options = ReadOptions {
            read_timeout: self.config.read_timeout,
            keep_alive: self.config.keep_alive,
            idle_timeout: None,
            max_payload: self.config.max_payload_size,
        };
        let outcome = open.run(&sink, &options).await;
        Ok(outcome.code())
    }

    async fn open_sender(&self, id: ConnectionId) -> Result<Sender, ServerError> {
        let connections = self.connections.read().await;
        let entry = connections
            .get(&id)
            .ok_or(ServerError::UnknownConnection(id))?;
        match &entry.sender {
            Some(sender) if entry.state.is_open() => Ok(sender.clone()),
            _ => Err(ServerError::NotOpen(id)),
        }
    }

    /// Drops registry entries whose task is gone without cleaning up.
    async fn prune(&self) {
        let mut connections = self.connections.write().await;
        connections.retain(|id, entry| {
            let dead = entry.state.get() == ConnectionState::Closed
                && entry.sender.as_ref().is_some_and(|s| !s.is_connected());
            if dead {
                tracing::debug!(id, "pruning closed connection");
            }
            !dead
        });
    }

    /// Gives connection tasks a moment to send `GoingAway` and unregister.
    async fn wait_for_drain(&self) {
        let drained = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
            while !self.connections.read().await.is_empty() {
                tokio::time::sleep(self.config.accept_poll_interval.min(CLOSE_FLUSH_TIMEOUT)).await;
            }
        })
        .await;
        if drained.is_err() {
            let left = self.connections.read().await.len();
            tracing::warn!(left, "connections still registered at shutdown");
        }
    }
}
