//! The peer connection pool.
//!
//! The pool is a single coordinator task that owns every live peer
//! connection: it dials outbound peers, admits inbound sockets against
//! resource and rate caps, matches pierce-firewall tokens to the requests
//! that created them, sweeps idle and ghost connections, and fans every
//! per-connection event out to one subscriber channel with the connection
//! context attached.
//!
//! All registries are mutated only from the pool task; handles talk to it
//! through its mailbox.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, Duration, Instant};

use crate::conf::{PeerConf, PoolConf};
use crate::error::{Error, Result};
use crate::peer::{
    ConnectionId, ConnectionState, EventReceiver, EventSender, FailureCause,
    PeerConnection, PeerEvent, PeerHandle, SessionExit,
};
use crate::wire::peer::{
    Directory, DistributedMessage, InitMessage, SearchReply, Shares,
    TransferReply, TransferRequest, UserInfo,
};
use crate::{ConnectionType, PeerInfo, Token, DIRECT_TOKEN};

/// How long a search-reply connection lingers after its reply has been
/// forwarded. Peers open one connection per reply; without this they
/// accumulate.
const SEARCH_REPLY_LINGER: Duration = Duration::from_millis(500);

/// An indirect-connection attempt waiting for the peer to reach us.
#[derive(Clone, Debug)]
pub struct PendingConnection {
    pub username: String,
    pub token: Token,
    pub created_at: Instant,
    pub attempts: u32,
}

/// A point-in-time summary of one pooled connection.
#[derive(Clone, Debug)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub info: PeerInfo,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
}

/// Fires once the outcome of an outbound dial is known.
pub type ReadySignal = oneshot::Receiver<std::result::Result<(), FailureCause>>;

/// An event fanned out by the pool to its subscriber.
pub enum PoolEvent {
    /// A connection changed state. Fires before the pool removes the
    /// registry entry of a terminal connection.
    StateChanged {
        id: ConnectionId,
        username: String,
        state: ConnectionState,
    },
    /// A peer completed its control-channel handshake; the address to
    /// username binding is now known.
    UserIpDiscovered {
        username: String,
        addr: SocketAddr,
    },
    /// An indirect connection attempt was matched by an inbound
    /// control-channel handshake carrying its token.
    IndirectConnectionEstablished {
        username: String,
        token: Token,
        handle: PeerHandle,
    },
    /// A peer pierced our firewall. The connection has already switched to
    /// raw mode; ownership moves to the receiver.
    PierceFirewall {
        username: String,
        token: Token,
        conn: Box<PeerConnection>,
    },
    /// A file-transfer channel finished its handshake. Ownership moves to
    /// the receiver.
    FileTransferConnection {
        username: String,
        token: Token,
        conn: Box<PeerConnection>,
    },
    SearchReply {
        username: String,
        reply: SearchReply,
    },
    SharesReceived {
        username: String,
        shares: Shares,
    },
    SharesRequest {
        username: String,
        handle: PeerHandle,
    },
    UserInfoRequest {
        username: String,
        handle: PeerHandle,
    },
    UserInfoReceived {
        username: String,
        info: UserInfo,
    },
    TransferRequest {
        username: String,
        handle: PeerHandle,
        request: TransferRequest,
    },
    TransferReply {
        username: String,
        handle: PeerHandle,
        reply: TransferReply,
    },
    /// A peer queued a download from us.
    QueueUpload {
        username: String,
        handle: PeerHandle,
        filename: String,
    },
    FolderContentsRequest {
        username: String,
        handle: PeerHandle,
        token: Token,
        folder: String,
    },
    FolderContentsReceived {
        username: String,
        token: Token,
        folder: String,
        directories: Vec<Directory>,
    },
    PlaceInQueueRequest {
        username: String,
        handle: PeerHandle,
        filename: String,
    },
    PlaceInQueueReply {
        username: String,
        filename: String,
        place: u32,
    },
    UploadDenied {
        username: String,
        filename: String,
        reason: String,
    },
    UploadFailed {
        username: String,
        filename: String,
    },
    Distributed {
        username: String,
        message: DistributedMessage,
    },
}

pub type PoolEventReceiver = mpsc::UnboundedReceiver<PoolEvent>;

enum PoolCommand {
    ConnectTo {
        username: String,
        addr: SocketAddr,
        kind: ConnectionType,
        token: Token,
        is_indirect: bool,
        reply: oneshot::Sender<Result<(PeerHandle, ReadySignal)>>,
    },
    HandleIncoming {
        socket: TcpStream,
        reply: oneshot::Sender<Result<PeerHandle>>,
    },
    Pending {
        username: String,
        token: Token,
    },
    ResolvePending {
        token: Token,
        reply: oneshot::Sender<Option<PendingConnection>>,
    },
    IsPending {
        token: Token,
        reply: oneshot::Sender<bool>,
    },
    ConnectionFor {
        username: String,
        reply: oneshot::Sender<Option<PeerHandle>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ConnectionSummary>>,
    },
    ConnHandoff {
        id: ConnectionId,
        conn: Box<PeerConnection>,
        exit: SessionExit,
    },
}

struct Entry {
    handle: PeerHandle,
    ip: IpAddr,
    /// Fired once the dial outcome of an outbound connection is known.
    ready: Option<oneshot::Sender<std::result::Result<(), FailureCause>>>,
}

pub struct Pool {
    conf: PoolConf,
    peer_conf: PeerConf,
    /// Our own username, sent in the init handshake of direct connections.
    username: String,
    cmd_port: mpsc::UnboundedReceiver<PoolCommand>,
    cmd_chan: mpsc::UnboundedSender<PoolCommand>,
    conn_events: EventReceiver,
    conn_events_chan: EventSender,
    subscriber: mpsc::UnboundedSender<PoolEvent>,
    registry: HashMap<ConnectionId, Entry>,
    pending: HashMap<Token, PendingConnection>,
    ip_counts: HashMap<IpAddr, usize>,
    ip_attempts: HashMap<IpAddr, VecDeque<Instant>>,
}

impl Pool {
    /// Creates the pool, its command handle and the subscriber channel on
    /// which all pool events are delivered.
    pub fn new(
        conf: PoolConf,
        peer_conf: PeerConf,
        username: impl Into<String>,
    ) -> (Self, PoolHandle, PoolEventReceiver) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (conn_events_chan, conn_events) = mpsc::unbounded_channel();
        let (subscriber, events) = mpsc::unbounded_channel();
        let handle = PoolHandle {
            chan: cmd_chan.clone(),
        };
        (
            Self {
                conf,
                peer_conf,
                username: username.into(),
                cmd_port,
                cmd_chan,
                conn_events,
                conn_events_chan,
                subscriber,
                registry: HashMap::new(),
                pending: HashMap::new(),
                ip_counts: HashMap::new(),
                ip_attempts: HashMap::new(),
            },
            handle,
            events,
        )
    }

    /// Runs the pool until every handle is dropped.
    pub async fn start(mut self) {
        log::info!("Starting connection pool");
        let mut sweep = interval(self.conf.sweep_interval);
        // the first tick completes immediately
        sweep.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_port.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                event = self.conn_events.recv() => {
                    if let Some((id, event)) = event {
                        self.handle_conn_event(id, event);
                    }
                }
                _ = sweep.tick() => self.sweep(),
            }
        }
        log::info!("Shutting down connection pool");
    }

    fn handle_command(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::ConnectTo {
                username,
                addr,
                kind,
                token,
                is_indirect,
                reply,
            } => {
                let res =
                    self.connect_to(&username, addr, kind, token, is_indirect);
                let _ = reply.send(res);
            }
            PoolCommand::HandleIncoming { socket, reply } => {
                let _ = reply.send(self.handle_incoming(socket));
            }
            PoolCommand::Pending { username, token } => {
                self.register_pending(username, token);
            }
            PoolCommand::ResolvePending { token, reply } => {
                let _ = reply.send(self.pending.remove(&token));
            }
            PoolCommand::IsPending { token, reply } => {
                let _ = reply.send(self.pending.contains_key(&token));
            }
            PoolCommand::ConnectionFor { username, reply } => {
                let _ = reply.send(self.connection_for(&username));
            }
            PoolCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PoolCommand::ConnHandoff { id, conn, exit } => {
                self.handle_handoff(id, conn, exit);
            }
        }
    }

    /// Dials `addr` and registers the connection under
    /// `"{username}-{token}"`.
    ///
    /// A direct connection sends our `PeerInit` as soon as the socket is
    /// ready; an indirect one sends nothing, as the caller pierces with
    /// the matched token via the handle.
    fn connect_to(
        &mut self,
        username: &str,
        addr: SocketAddr,
        kind: ConnectionType,
        token: Token,
        is_indirect: bool,
    ) -> Result<(PeerHandle, ReadySignal)> {
        if self.conf.validate_addresses {
            validate_remote_addr(&addr)?;
        }
        if self.live_count() >= self.conf.max_connections {
            return Err(Error::GlobalLimit);
        }

        let id = format!("{}-{}", username, token);
        if let Some(entry) = self.registry.get(&id) {
            if entry.handle.is_alive() {
                log::debug!("Reusing live connection {}", id);
                let (ready_chan, ready) = oneshot::channel();
                let _ = ready_chan.send(Ok(()));
                return Ok((entry.handle.clone(), ready));
            }
        }
        // a dead entry under this id is replaced
        self.remove_entry(&id);

        let init = if is_indirect {
            None
        } else {
            Some(InitMessage::PeerInit {
                username: self.username.clone(),
                kind,
                token: DIRECT_TOKEN,
            })
        };

        log::info!(
            "Opening {} connection {} to {} (indirect: {})",
            kind,
            id,
            addr,
            is_indirect
        );
        let (conn, handle) = PeerConnection::outbound(
            id.clone(),
            self.peer_conf.clone(),
            addr,
            username,
            kind,
            token,
            self.conf.connect_timeout,
            init,
            self.conn_events_chan.clone(),
        );

        let (ready_chan, ready) = oneshot::channel();
        self.insert_entry(
            id,
            Entry {
                handle: handle.clone(),
                ip: addr.ip(),
                ready: Some(ready_chan),
            },
        );
        self.spawn_conn(conn);
        Ok((handle, ready))
    }

    /// Admits an inbound socket against the global, per-IP and rate caps,
    /// then starts receiving on it.
    ///
    /// Admission failures are reported to the caller and never affect
    /// other connections.
    fn handle_incoming(&mut self, socket: TcpStream) -> Result<PeerHandle> {
        if self.live_count() >= self.conf.max_connections {
            log::warn!("Rejecting inbound connection: global cap reached");
            return Err(Error::GlobalLimit);
        }

        let addr = socket.peer_addr()?;
        let ip = addr.ip();

        let ip_count = self.ip_counts.get(&ip).copied().unwrap_or(0);
        if ip_count >= self.conf.max_connections_per_ip {
            log::warn!("Rejecting inbound connection from {}: per-IP cap", ip);
            return Err(Error::PerIpLimit);
        }

        let now = Instant::now();
        let window = self.conf.rate_limit_window;
        let attempts = self.ip_attempts.entry(ip).or_default();
        while let Some(first) = attempts.front() {
            if now.duration_since(*first) > window {
                attempts.pop_front();
            } else {
                break;
            }
        }
        if attempts.len() >= self.conf.max_attempts_per_window {
            log::warn!("Rejecting inbound connection from {}: rate limited", ip);
            return Err(Error::RateLimited);
        }
        attempts.push_back(now);

        let id = format!("incoming-{:08x}", rand::random::<u32>());
        log::info!("Accepted inbound connection {} from {}", id, addr);
        let (conn, handle) = PeerConnection::inbound(
            id.clone(),
            self.peer_conf.clone(),
            socket,
            self.conf.connect_timeout,
            self.conn_events_chan.clone(),
        )?;

        self.insert_entry(
            id,
            Entry {
                handle: handle.clone(),
                ip,
                ready: None,
            },
        );
        self.spawn_conn(conn);
        Ok(handle)
    }

    /// Runs the connection to completion in its own task. The registry
    /// entry is removed by the terminal state-change event the connection
    /// emits on every close path, so closed sessions need no message here;
    /// only a raw-mode handoff sends the connection back.
    fn spawn_conn(&self, mut conn: PeerConnection) {
        let chan = self.cmd_chan.clone();
        tokio::spawn(async move {
            let id = conn.id().to_string();
            match conn.start().await {
                Ok(SessionExit::Closed) => {}
                Ok(exit) => {
                    let _ = chan.send(PoolCommand::ConnHandoff {
                        id,
                        conn: Box::new(conn),
                        exit,
                    });
                }
                Err(e) => {
                    log::debug!("Connection {} ended: {}", id, e);
                }
            }
        });
    }

    /// A connection switched to raw mode: take it out of the registry and
    /// hand it, by value, to the subscriber.
    fn handle_handoff(
        &mut self,
        id: ConnectionId,
        mut conn: Box<PeerConnection>,
        exit: SessionExit,
    ) {
        self.remove_entry(&id);

        let (token, is_pierce) = match exit {
            SessionExit::PierceFirewall { token } => (token, true),
            SessionExit::FileTransfer { token } => (token, false),
            SessionExit::Closed => return,
        };

        // an inbound pierce carries no username; the pending entry it
        // matches does
        let mut username = conn.info().username;
        if let Some(pending) = self.pending.remove(&token) {
            log::info!(
                "Token {} matched pending connection to {}",
                token,
                pending.username
            );
            if username.is_empty() {
                username = pending.username;
                conn.set_username(&username);
            }
        }

        if is_pierce {
            self.emit(PoolEvent::PierceFirewall {
                username,
                token,
                conn,
            });
        } else {
            self.emit(PoolEvent::FileTransferConnection {
                username,
                token,
                conn,
            });
        }
    }

    fn register_pending(&mut self, username: String, token: Token) {
        let entry =
            self.pending
                .entry(token)
                .or_insert_with(|| PendingConnection {
                    username: username.clone(),
                    token,
                    created_at: Instant::now(),
                    attempts: 0,
                });
        entry.username = username;
        entry.attempts += 1;
        log::debug!(
            "Pending connection to {} with token {} (attempt {})",
            entry.username,
            token,
            entry.attempts
        );
    }

    /// Finds a live connection to `username`, preferring the ones we
    /// opened ourselves over promoted inbound ones. Dead entries found on
    /// the way are removed.
    fn connection_for(&mut self, username: &str) -> Option<PeerHandle> {
        let mut stale = Vec::new();
        let mut outbound = None;
        let mut inbound = None;

        let prefix = format!("{}-", username);
        for (id, entry) in &self.registry {
            if !entry.handle.is_alive() {
                stale.push(id.clone());
                continue;
            }
            if id.starts_with(&prefix) {
                outbound.get_or_insert_with(|| entry.handle.clone());
            } else if id.starts_with("incoming-")
                && entry.handle.info().username == username
            {
                inbound.get_or_insert_with(|| entry.handle.clone());
            }
        }

        for id in stale {
            log::debug!("Removing stale connection {}", id);
            self.remove_entry(&id);
        }
        outbound.or(inbound)
    }

    fn snapshot(&self) -> Vec<ConnectionSummary> {
        self.registry
            .iter()
            .map(|(id, entry)| {
                let stats = entry.handle.stats();
                ConnectionSummary {
                    id: id.clone(),
                    info: entry.handle.info(),
                    bytes_received: stats.bytes_received(),
                    bytes_sent: stats.bytes_sent(),
                    messages_received: stats.messages_received(),
                    messages_sent: stats.messages_sent(),
                }
            })
            .collect()
    }

    /// Translates one connection's event into a subscriber event with the
    /// connection context attached.
    fn handle_conn_event(&mut self, id: ConnectionId, event: PeerEvent) {
        let (handle, username) = match self.registry.get(&id) {
            Some(entry) => {
                (entry.handle.clone(), entry.handle.info().username)
            }
            // events of an already handed-off or removed connection
            None => return,
        };

        match event {
            PeerEvent::StateChanged(state) => {
                // resolve the dial signal as soon as the socket is ready;
                // the indirect flow must be able to pierce before the
                // handshake completes
                let outcome = match &state {
                    ConnectionState::Handshaking => Some(Ok(())),
                    ConnectionState::Connected => Some(Ok(())),
                    ConnectionState::Failed(cause) => Some(Err(*cause)),
                    ConnectionState::Disconnected => {
                        Some(Err(FailureCause::ConnectionClosed))
                    }
                    _ => None,
                };
                if let Some(outcome) = outcome {
                    if let Some(entry) = self.registry.get_mut(&id) {
                        if let Some(ready) = entry.ready.take() {
                            let _ = ready.send(outcome);
                        }
                    }
                }

                let terminal = matches!(
                    state,
                    ConnectionState::Disconnected | ConnectionState::Failed(_)
                );
                // subscribers observe the terminal state before the entry
                // disappears
                self.emit(PoolEvent::StateChanged {
                    id: id.clone(),
                    username,
                    state,
                });
                if terminal {
                    self.remove_entry(&id);
                }
            }
            PeerEvent::Handshaked {
                username: peer_username,
                token,
                ..
            } => {
                if let Some(addr) = handle.info().addr {
                    self.emit(PoolEvent::UserIpDiscovered {
                        username: peer_username.clone(),
                        addr,
                    });
                }
                if token != DIRECT_TOKEN {
                    if let Some(pending) = self.pending.remove(&token) {
                        log::info!(
                            "Token {} matched pending connection to {}",
                            token,
                            pending.username
                        );
                        self.emit(PoolEvent::IndirectConnectionEstablished {
                            username: pending.username,
                            token,
                            handle: handle.clone(),
                        });
                    }
                }
            }
            PeerEvent::SearchReply(reply) => {
                self.emit(PoolEvent::SearchReply {
                    username: reply.username.clone(),
                    reply,
                });
                // one reply per connection; close it shortly after instead
                // of letting them accumulate
                let handle = handle.clone();
                tokio::spawn(async move {
                    sleep(SEARCH_REPLY_LINGER).await;
                    handle.disconnect();
                });
            }
            PeerEvent::SharesReceived(shares) => {
                self.emit(PoolEvent::SharesReceived { username, shares });
            }
            PeerEvent::SharesRequest => {
                self.emit(PoolEvent::SharesRequest { username, handle });
            }
            PeerEvent::UserInfoRequest => {
                self.emit(PoolEvent::UserInfoRequest { username, handle });
            }
            PeerEvent::UserInfoReceived(info) => {
                self.emit(PoolEvent::UserInfoReceived { username, info });
            }
            PeerEvent::TransferRequest(request) => {
                self.emit(PoolEvent::TransferRequest {
                    username,
                    handle,
                    request,
                });
            }
            PeerEvent::TransferReply(reply) => {
                self.emit(PoolEvent::TransferReply {
                    username,
                    handle,
                    reply,
                });
            }
            PeerEvent::QueueDownload { filename } => {
                self.emit(PoolEvent::QueueUpload {
                    username,
                    handle,
                    filename,
                });
            }
            PeerEvent::FolderContentsRequest { token, folder } => {
                self.emit(PoolEvent::FolderContentsRequest {
                    username,
                    handle,
                    token,
                    folder,
                });
            }
            PeerEvent::FolderContentsReceived {
                token,
                folder,
                directories,
            } => {
                self.emit(PoolEvent::FolderContentsReceived {
                    username,
                    token,
                    folder,
                    directories,
                });
            }
            PeerEvent::PlaceInQueueRequest { filename } => {
                self.emit(PoolEvent::PlaceInQueueRequest {
                    username,
                    handle,
                    filename,
                });
            }
            PeerEvent::PlaceInQueueReply { filename, place } => {
                self.emit(PoolEvent::PlaceInQueueReply {
                    username,
                    filename,
                    place,
                });
            }
            PeerEvent::UploadDenied { filename, reason } => {
                self.emit(PoolEvent::UploadDenied {
                    username,
                    filename,
                    reason,
                });
            }
            PeerEvent::UploadFailed { filename } => {
                self.emit(PoolEvent::UploadFailed { username, filename });
            }
            PeerEvent::Distributed(message) => {
                self.emit(PoolEvent::Distributed { username, message });
            }
        }
    }

    /// Drops expired pending entries and disconnects idle and ghost
    /// connections. Removal happens through the terminal state-change
    /// event each disconnect produces.
    fn sweep(&mut self) {
        let now = Instant::now();

        let timeout = self.conf.connect_timeout;
        self.pending.retain(|token, pending| {
            let keep = now.duration_since(pending.created_at) <= timeout;
            if !keep {
                log::debug!(
                    "Dropping expired pending connection to {} (token {})",
                    pending.username,
                    token
                );
            }
            keep
        });

        let mut dead = Vec::new();
        for (id, entry) in &self.registry {
            if !entry.handle.is_alive() {
                dead.push(id.clone());
                continue;
            }
            let stats = entry.handle.stats();
            match stats.last_activity_at() {
                Some(at) if now.duration_since(at) > self.conf.idle_timeout => {
                    log::info!("Disconnecting idle connection {}", id);
                    entry.handle.disconnect();
                }
                None => {
                    // connected but never produced any traffic
                    if let Some(at) = stats.connected_at() {
                        if now.duration_since(at) > self.conf.ghost_timeout {
                            log::info!("Disconnecting ghost connection {}", id);
                            entry.handle.disconnect();
                        }
                    }
                }
                _ => {}
            }
        }
        for id in dead {
            self.remove_entry(&id);
        }
    }

    fn live_count(&self) -> usize {
        self.registry.len()
    }

    fn insert_entry(&mut self, id: ConnectionId, entry: Entry) {
        *self.ip_counts.entry(entry.ip).or_insert(0) += 1;
        self.registry.insert(id, entry);
    }

    /// Every removal path funnels through here so the per-IP count stays
    /// consistent with the registry.
    fn remove_entry(&mut self, id: &str) {
        if let Some(entry) = self.registry.remove(id) {
            if let Some(count) = self.ip_counts.get_mut(&entry.ip) {
                *count -= 1;
                if *count == 0 {
                    self.ip_counts.remove(&entry.ip);
                }
            }
            if let Some(ready) = entry.ready {
                let _ = ready.send(Err(FailureCause::ConnectionClosed));
            }
            log::debug!("Removed connection {}", id);
        }
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.subscriber.send(event);
    }
}

/// A cloneable handle to the pool task.
#[derive(Clone)]
pub struct PoolHandle {
    chan: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolHandle {
    /// Opens an outbound connection. Returns the registered handle
    /// immediately plus a signal that fires once the dial outcome is
    /// known.
    pub async fn connect_to(
        &self,
        username: &str,
        addr: SocketAddr,
        kind: ConnectionType,
        token: Token,
        is_indirect: bool,
    ) -> Result<(PeerHandle, ReadySignal)> {
        let (reply, port) = oneshot::channel();
        self.chan
            .send(PoolCommand::ConnectTo {
                username: username.into(),
                addr,
                kind,
                token,
                is_indirect,
                reply,
            })
            .map_err(|_| Error::ChannelClosed)?;
        port.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Admits an accepted inbound socket.
    pub async fn handle_incoming(&self, socket: TcpStream) -> Result<PeerHandle> {
        let (reply, port) = oneshot::channel();
        self.chan
            .send(PoolCommand::HandleIncoming { socket, reply })
            .map_err(|_| Error::ChannelClosed)?;
        port.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Registers a token to be matched against a later inbound handshake.
    pub fn pending(&self, username: &str, token: Token) -> Result<()> {
        self.chan
            .send(PoolCommand::Pending {
                username: username.into(),
                token,
            })
            .map_err(|_| Error::ChannelClosed)
    }

    /// Consumes and returns the pending entry for `token`, if any.
    pub async fn resolve_pending(
        &self,
        token: Token,
    ) -> Result<Option<PendingConnection>> {
        let (reply, port) = oneshot::channel();
        self.chan
            .send(PoolCommand::ResolvePending { token, reply })
            .map_err(|_| Error::ChannelClosed)?;
        port.await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn is_pending(&self, token: Token) -> Result<bool> {
        let (reply, port) = oneshot::channel();
        self.chan
            .send(PoolCommand::IsPending { token, reply })
            .map_err(|_| Error::ChannelClosed)?;
        port.await.map_err(|_| Error::ChannelClosed)
    }

    /// Finds a live connection to `username`.
    pub async fn connection_for(
        &self,
        username: &str,
    ) -> Result<Option<PeerHandle>> {
        let (reply, port) = oneshot::channel();
        self.chan
            .send(PoolCommand::ConnectionFor {
                username: username.into(),
                reply,
            })
            .map_err(|_| Error::ChannelClosed)?;
        port.await.map_err(|_| Error::ChannelClosed)
    }

    /// A summary of every pooled connection.
    pub async fn snapshot(&self) -> Result<Vec<ConnectionSummary>> {
        let (reply, port) = oneshot::channel();
        self.chan
            .send(PoolCommand::Snapshot { reply })
            .map_err(|_| Error::ChannelClosed)?;
        port.await.map_err(|_| Error::ChannelClosed)
    }
}

/// Rejects addresses no real peer announces: loopback, multicast,
/// broadcast, unspecified and reserved ranges, for both address families.
pub(crate) fn validate_remote_addr(addr: &SocketAddr) -> Result<()> {
    if addr.port() == 0 {
        return Err(Error::InvalidPort(addr.port() as u32));
    }
    let ip = addr.ip();
    let valid = match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.octets()[0] >= 240)
        }
        IpAddr::V6(v6) => {
            let is_link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || is_link_local)
        }
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidAddress(ip))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    fn test_conf() -> PoolConf {
        PoolConf {
            validate_addresses: false,
            ..PoolConf::default()
        }
    }

    fn start_pool(conf: PoolConf) -> (PoolHandle, PoolEventReceiver) {
        let (pool, handle, events) =
            Pool::new(conf, PeerConf::default(), "alice");
        tokio::spawn(pool.start());
        (handle, events)
    }

    #[test]
    fn test_address_validation() {
        let ok = |s: &str| validate_remote_addr(&s.parse().unwrap());
        assert!(ok("203.0.113.4:2234").is_ok());
        assert!(matches!(
            ok("127.0.0.1:2234"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            ok("224.0.0.1:2234"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            ok("255.255.255.255:2234"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(ok("0.0.0.0:2234"), Err(Error::InvalidAddress(_))));
        assert!(matches!(
            ok("240.0.0.1:2234"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(ok("[::1]:2234"), Err(Error::InvalidAddress(_))));
        assert!(matches!(ok("[::]:2234"), Err(Error::InvalidAddress(_))));
        assert!(matches!(
            ok("[ff02::1]:2234"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            ok("[fe80::1]:2234"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(ok("[2001:db8::1]:2234").is_ok());
        assert!(matches!(
            validate_remote_addr(&"203.0.113.4:0".parse().unwrap()),
            Err(Error::InvalidPort(0))
        ));
    }

    #[tokio::test]
    async fn test_direct_connect_sends_peer_init() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (pool, _events) = start_pool(test_conf());

        let (handle, ready) = pool
            .connect_to("bob", addr, ConnectionType::Peer, 0, false)
            .await
            .unwrap();
        assert_eq!(handle.id(), "bob-0");

        let (mut socket, _) = listener.accept().await.unwrap();
        ready.await.unwrap().unwrap();

        // the exact PeerInit bytes for username "alice", type P, token 0
        let mut buf = vec![0u8; 23];
        tokio::io::AsyncReadExt::read_exact(&mut socket, &mut buf)
            .await
            .unwrap();
        assert_eq!(
            buf,
            vec![
                0x13, 0x00, 0x00, 0x00, // length = 19
                0x01, // code = PeerInit
                0x05, 0x00, 0x00, 0x00, b'a', b'l', b'i', b'c', b'e',
                0x01, 0x00, 0x00, 0x00, b'P',
                0x00, 0x00, 0x00, 0x00, // token
            ]
        );

        let snapshot = pool.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "bob-0");
    }

    #[tokio::test]
    async fn test_per_ip_cap() {
        let conf = PoolConf {
            max_connections_per_ip: 2,
            ..test_conf()
        };
        let (pool, _events) = start_pool(conf);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut keep = Vec::new();
        for i in 0..3 {
            let client = TcpStream::connect(addr).await.unwrap();
            let (socket, _) = listener.accept().await.unwrap();
            let res = pool.handle_incoming(socket).await;
            if i < 2 {
                keep.push((client, res.unwrap()));
            } else {
                assert!(matches!(res, Err(Error::PerIpLimit)));
            }
        }

        // the first two connections are unaffected by the rejection
        for (_, handle) in &keep {
            assert!(handle.is_alive());
        }
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let conf = PoolConf {
            max_attempts_per_window: 2,
            ..test_conf()
        };
        let (pool, _events) = start_pool(conf);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut clients = Vec::new();
        for i in 0..3 {
            let client = TcpStream::connect(addr).await.unwrap();
            let (socket, _) = listener.accept().await.unwrap();
            let res = pool.handle_incoming(socket).await;
            clients.push(client);
            if i < 2 {
                res.unwrap();
            } else {
                assert!(matches!(res, Err(Error::RateLimited)));
            }
        }
    }

    #[tokio::test]
    async fn test_global_cap() {
        let conf = PoolConf {
            max_connections: 1,
            ..test_conf()
        };
        let (pool, _events) = start_pool(conf);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let (s1, _) = listener.accept().await.unwrap();
        pool.handle_incoming(s1).await.unwrap();

        let _c2 = TcpStream::connect(addr).await.unwrap();
        let (s2, _) = listener.accept().await.unwrap();
        assert!(matches!(
            pool.handle_incoming(s2).await,
            Err(Error::GlobalLimit)
        ));
    }

    #[tokio::test]
    async fn test_pending_registration_is_unique_per_token() {
        let (pool, _events) = start_pool(test_conf());

        pool.pending("bob", 42).unwrap();
        pool.pending("bob", 42).unwrap();
        assert!(pool.is_pending(42).await.unwrap());

        let pending = pool.resolve_pending(42).await.unwrap().unwrap();
        assert_eq!(pending.username, "bob");
        assert_eq!(pending.token, 42);
        assert_eq!(pending.attempts, 2);

        // consumed
        assert_eq!(pool.resolve_pending(42).await.unwrap().map(|p| p.token), None);
        assert!(!pool.is_pending(42).await.unwrap());
    }

    #[tokio::test]
    async fn test_pierce_firewall_handoff() {
        let (pool, mut events) = start_pool(test_conf());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        pool.pending("bob", 1234).unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        pool.handle_incoming(socket).await.unwrap();

        // the pierce frame followed by raw file bytes
        client
            .write_all(&InitMessage::PierceFirewall(1234).encode())
            .await
            .unwrap();
        client.write_all(&[0xde, 0xad, 0xbe, 0xef]).await.unwrap();
        client.flush().await.unwrap();

        let mut conn = loop {
            match events.recv().await.expect("pool event stream ended") {
                PoolEvent::PierceFirewall {
                    username,
                    token,
                    conn,
                } => {
                    assert_eq!(token, 1234);
                    assert_eq!(username, "bob");
                    break conn;
                }
                _ => {}
            }
        };

        // ownership transferred: the pool no longer tracks it
        assert!(pool.snapshot().await.unwrap().is_empty());
        assert!(!pool.is_pending(1234).await.unwrap());

        // the trailing bytes are raw payload, in order
        let bytes = conn
            .receive_raw_bytes(4, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&bytes[..], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[tokio::test]
    async fn test_file_transfer_handoff() {
        let (pool, mut events) = start_pool(test_conf());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        pool.handle_incoming(socket).await.unwrap();

        client
            .write_all(
                &InitMessage::PeerInit {
                    username: "carol".into(),
                    kind: ConnectionType::FileTransfer,
                    token: 5678,
                }
                .encode(),
            )
            .await
            .unwrap();
        // the 12-byte transfer init right behind the handshake
        client.write_all(&5678u32.to_le_bytes()).await.unwrap();
        client.write_all(&0u64.to_le_bytes()).await.unwrap();

        let mut conn = loop {
            match events.recv().await.expect("pool event stream ended") {
                PoolEvent::FileTransferConnection {
                    username,
                    token,
                    conn,
                } => {
                    assert_eq!(username, "carol");
                    assert_eq!(token, 5678);
                    break conn;
                }
                _ => {}
            }
        };

        let (token, offset) = conn
            .receive_file_transfer_init(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(token, 5678);
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn test_idle_and_ghost_sweep() {
        let conf = PoolConf {
            idle_timeout: Duration::from_millis(200),
            ghost_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(50),
            ..test_conf()
        };
        let (pool, mut events) = start_pool(conf);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        pool.handle_incoming(socket).await.unwrap();
        assert_eq!(pool.snapshot().await.unwrap().len(), 1);

        // the ghost timer kicks in: connected, but no traffic ever
        let mut disconnected = false;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(PoolEvent::StateChanged { state, .. })) => {
                    if state == ConnectionState::Disconnected {
                        disconnected = true;
                        break;
                    }
                }
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert!(disconnected);
        assert!(pool.snapshot().await.unwrap().is_empty());

        // the per-IP slot was given back
        let _client = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        assert!(pool.handle_incoming(socket).await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_for_prefers_outbound_and_prunes_stale() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (pool, _events) = start_pool(test_conf());

        let (handle, ready) = pool
            .connect_to("bob", addr, ConnectionType::Peer, 0, false)
            .await
            .unwrap();
        let (_socket, _) = listener.accept().await.unwrap();
        ready.await.unwrap().unwrap();

        let found = pool.connection_for("bob").await.unwrap().unwrap();
        assert_eq!(found.id(), handle.id());
        assert!(pool.connection_for("nobody").await.unwrap().is_none());
    }
}
