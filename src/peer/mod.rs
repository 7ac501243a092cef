//! The peer connection actor.
//!
//! Each peer connection owns one TCP socket and mediates between two modes:
//! framed mode, in which length-prefixed messages are parsed and dispatched
//! as events, and raw mode, in which every byte is file-transfer payload.
//!
//! The switch from framed to raw is the trickiest invariant in the engine:
//! it must happen in the same step that recognizes the mode-switching init
//! message, before anything else observes the connection, or file bytes
//! already buffered behind the handshake get consumed as malformed frames.
//! Here the switch is the transition out of the framed run loop: the codec
//! buffer is drained into the file-transfer buffer before the session exit
//! is surfaced to the pool.

mod codec;

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::codec::Framed;

use crate::conf::PeerConf;
use crate::error::{is_definitive, Error, Result};
use crate::wire::peer::{
    DecodeCaps, Directory, DistributedMessage, InitMessage, PeerMessage,
    SearchReply, Shares, TransferReply, TransferRequest, UserInfo,
};
use crate::{ConnectionType, PeerInfo, Token};

use codec::{PeerCodec, PeerFrame};

/// How long to wait between retries of a transient connect failure.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A connection's identifier within the engine.
pub type ConnectionId = String;

/// The channel on which connections push their events, tagged with the
/// emitting connection's id.
pub type EventSender = mpsc::UnboundedSender<(ConnectionId, PeerEvent)>;
pub type EventReceiver = mpsc::UnboundedReceiver<(ConnectionId, PeerEvent)>;

/// At any given time, a peer connection is in one of the below states.
///
/// Transitions are monotonic within one connection attempt; `Disconnected`
/// is terminal but resettable.
#[derive(Clone, Debug)]
pub enum ConnectionState {
    /// The connection has not yet been established, or it has been shut
    /// down cleanly.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The TCP connection is up and the init handshake is in flight.
    Handshaking,
    /// The normal state: the handshake completed in at least one direction
    /// and messages (or raw bytes) flow.
    Connected,
    /// The connection died; the cause is retained for subscribers.
    Failed(FailureCause),
}

/// Equality is on the state tag only; two failures compare equal
/// regardless of cause.
impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

impl Eq for ConnectionState {}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Why a connection failed, reduced to the error's kind so state values
/// stay cheap to clone and compare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCause {
    NotConnected,
    ConnectionClosed,
    Timeout,
    HandshakeFailed,
    BufferOverflow,
    Io,
    Other,
}

impl From<&Error> for FailureCause {
    fn from(e: &Error) -> Self {
        match e {
            Error::NotConnected => Self::NotConnected,
            Error::ConnectionClosed => Self::ConnectionClosed,
            Error::Timeout => Self::Timeout,
            Error::HandshakeFailed(_) => Self::HandshakeFailed,
            Error::BufferOverflow => Self::BufferOverflow,
            Error::Io(_) => Self::Io,
            _ => Self::Other,
        }
    }
}

impl FailureCause {
    /// The closest [`Error`] for callers that need one; the original IO
    /// detail is only retained in the connection's log.
    pub fn into_error(self) -> Error {
        match self {
            Self::NotConnected => Error::NotConnected,
            Self::ConnectionClosed | Self::Other => Error::ConnectionClosed,
            Self::Timeout => Error::Timeout,
            Self::HandshakeFailed => Error::HandshakeFailed("peer handshake"),
            Self::BufferOverflow => Error::BufferOverflow,
            Self::Io => Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "peer socket error",
            )),
        }
    }
}

/// Statistics of one connection, readable from any task.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    connected_at: StdMutex<Option<Instant>>,
    last_activity_at: StdMutex<Option<Instant>>,
}

impl ConnectionStats {
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn connected_at(&self) -> Option<Instant> {
        *self.connected_at.lock().unwrap()
    }

    pub fn last_activity_at(&self) -> Option<Instant> {
        *self.last_activity_at.lock().unwrap()
    }

    fn mark_connected(&self) {
        *self.connected_at.lock().unwrap() = Some(Instant::now());
    }

    fn touch(&self) {
        *self.last_activity_at.lock().unwrap() = Some(Instant::now());
    }

    fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    fn record_received(&self, bytes: u64) {
        if bytes > 0 {
            self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
            self.touch();
        }
    }
}

/// An event emitted by a peer connection.
///
/// Events of one connection are delivered in wire-arrival order; there is
/// no ordering across connections.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    StateChanged(ConnectionState),
    /// The peer's init message arrived on a control or distributed
    /// channel. (File-transfer handshakes surface through the session exit
    /// instead, together with the connection itself.)
    Handshaked {
        username: String,
        kind: ConnectionType,
        token: Token,
    },
    SharesRequest,
    SharesReceived(Shares),
    SearchReply(SearchReply),
    UserInfoRequest,
    UserInfoReceived(UserInfo),
    FolderContentsRequest {
        token: Token,
        folder: String,
    },
    FolderContentsReceived {
        token: Token,
        folder: String,
        directories: Vec<Directory>,
    },
    TransferRequest(TransferRequest),
    TransferReply(TransferReply),
    QueueDownload {
        filename: String,
    },
    PlaceInQueueRequest {
        filename: String,
    },
    PlaceInQueueReply {
        filename: String,
        place: u32,
    },
    UploadFailed {
        filename: String,
    },
    UploadDenied {
        filename: String,
        reason: String,
    },
    Distributed(DistributedMessage),
}

/// The commands a peer connection task can receive from its handle.
enum Command {
    Send(PeerMessage),
    SendInit(InitMessage),
    AwaitTransfer {
        token: Token,
        chan: oneshot::Sender<TransferRequest>,
    },
    StopReceiving,
    Disconnect,
}

/// How a connection's framed run loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionExit {
    /// The connection is finished: remote close, local disconnect, or a
    /// fatal error already reflected in the state.
    Closed,
    /// The peer pierced our firewall; the connection has switched to raw
    /// mode and awaits its new owner.
    PierceFirewall { token: Token },
    /// A file-transfer channel finished its handshake and switched to raw
    /// mode.
    FileTransfer { token: Token },
}

/// A cloneable handle to a running peer connection.
///
/// Commands are serialized through the connection's mailbox, so no two
/// handlers of the same connection ever run concurrently. Statistics and
/// peer info are read through shared state and are safe from any task.
#[derive(Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    cmd_chan: mpsc::UnboundedSender<Command>,
    info: Arc<StdMutex<PeerInfo>>,
    stats: Arc<ConnectionStats>,
}

impl PeerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// A snapshot of what is known about the peer.
    pub fn info(&self) -> PeerInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Whether the connection task is still servicing commands.
    pub fn is_alive(&self) -> bool {
        !self.cmd_chan.is_closed()
    }

    /// Queues a control message for sending.
    pub fn send(&self, msg: PeerMessage) -> Result<()> {
        self.cmd_chan
            .send(Command::Send(msg))
            .map_err(|_| Error::NotConnected)
    }

    /// Queues an init message for sending; used by the NAT traversal flow
    /// to pierce with a matched token.
    pub fn send_init(&self, init: InitMessage) -> Result<()> {
        self.cmd_chan
            .send(Command::SendInit(init))
            .map_err(|_| Error::NotConnected)
    }

    /// Registers a one-shot handler for the transfer request carrying
    /// `token`. The handler wins over the generic event for that token and
    /// is consumed by the first match.
    pub fn await_transfer_request(
        &self,
        token: Token,
    ) -> Result<oneshot::Receiver<TransferRequest>> {
        let (chan, port) = oneshot::channel();
        self.cmd_chan
            .send(Command::AwaitTransfer { token, chan })
            .map_err(|_| Error::NotConnected)?;
        Ok(port)
    }

    /// Switches the connection out of framed mode; buffered bytes move to
    /// the file-transfer buffer and the connection is handed back through
    /// the pool.
    pub fn stop_receiving(&self) -> Result<()> {
        self.cmd_chan
            .send(Command::StopReceiving)
            .map_err(|_| Error::NotConnected)
    }

    /// Asks the connection to shut down. Safe to call in any state.
    pub fn disconnect(&self) {
        let _ = self.cmd_chan.send(Command::Disconnect);
    }
}

/// A chunk of a file transfer stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileChunk {
    /// Payload bytes; more may follow.
    Data(Bytes),
    /// The final payload bytes: the socket reached EOF right behind them.
    DataWithCompletion(Bytes),
    /// Clean EOF with no bytes left.
    Complete,
}

pub struct PeerConnection {
    id: ConnectionId,
    conf: PeerConf,
    caps: DecodeCaps,
    kind: ConnectionType,
    addr: SocketAddr,
    token: Token,
    state: ConnectionState,
    info: Arc<StdMutex<PeerInfo>>,
    stats: Arc<ConnectionStats>,
    events: EventSender,
    cmd_port: mpsc::UnboundedReceiver<Command>,
    /// One-shot transfer-request handlers keyed by token.
    transfer_handlers: HashMap<Token, oneshot::Sender<TransferRequest>>,
    connect_timeout: Duration,
    /// The init message to send as soon as the outbound socket is ready.
    initial_message: Option<InitMessage>,
    /// An accepted socket not yet started.
    pending_socket: Option<TcpStream>,
    /// The socket in raw mode, after the framed loop has exited.
    stream: Option<TcpStream>,
    /// Bytes received after the switch to raw mode, plus whatever the
    /// framed parser had buffered at the moment of the switch.
    file_transfer_buffer: BytesMut,
    raw_eof: bool,
    should_stop_receiving: bool,
    /// Set once either our init was written or the peer's was received;
    /// never cleared.
    handshake_complete: bool,
    /// Set only when the peer's own init message arrived.
    peer_handshake_received: bool,
}

impl PeerConnection {
    /// Creates an outbound connection to `addr`.
    ///
    /// If `initial_message` is set it is written as soon as the socket is
    /// ready; an indirect attempt leaves it empty and pierces later via
    /// the handle.
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        id: ConnectionId,
        conf: PeerConf,
        addr: SocketAddr,
        username: &str,
        kind: ConnectionType,
        token: Token,
        connect_timeout: Duration,
        initial_message: Option<InitMessage>,
        events: EventSender,
    ) -> (Self, PeerHandle) {
        let mut info = PeerInfo::new(username);
        info.addr = Some(addr);
        Self::new(id, conf, addr, info, kind, token, connect_timeout, initial_message, None, events)
    }

    /// Wraps an accepted inbound socket.
    ///
    /// The peer's identity is unknown until its init message arrives; the
    /// run loop does not begin until [`PeerConnection::start`], so callers
    /// can register the handle first.
    pub fn inbound(
        id: ConnectionId,
        conf: PeerConf,
        socket: TcpStream,
        connect_timeout: Duration,
        events: EventSender,
    ) -> Result<(Self, PeerHandle)> {
        let addr = socket.peer_addr()?;
        let mut info = PeerInfo::default();
        info.addr = Some(addr);
        Ok(Self::new(
            id,
            conf,
            addr,
            info,
            ConnectionType::Peer,
            0,
            connect_timeout,
            None,
            Some(socket),
            events,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: ConnectionId,
        conf: PeerConf,
        addr: SocketAddr,
        info: PeerInfo,
        kind: ConnectionType,
        token: Token,
        connect_timeout: Duration,
        initial_message: Option<InitMessage>,
        pending_socket: Option<TcpStream>,
        events: EventSender,
    ) -> (Self, PeerHandle) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let info = Arc::new(StdMutex::new(info));
        let stats = Arc::new(ConnectionStats::default());
        let caps = DecodeCaps {
            max_decompressed_bytes: conf.max_decompressed_bytes,
            max_compression_ratio: conf.max_compression_ratio,
        };
        let handle = PeerHandle {
            id: id.clone(),
            cmd_chan,
            info: Arc::clone(&info),
            stats: Arc::clone(&stats),
        };
        (
            Self {
                id,
                conf,
                caps,
                kind,
                addr,
                token,
                state: ConnectionState::default(),
                info,
                stats,
                events,
                cmd_port,
                transfer_handlers: HashMap::new(),
                connect_timeout,
                initial_message,
                pending_socket,
                stream: None,
                file_transfer_buffer: BytesMut::new(),
                raw_eof: false,
                should_stop_receiving: false,
                handshake_complete: false,
                peer_handshake_received: false,
            },
            handle,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ConnectionType {
        self.kind
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> ConnectionState {
        self.state.clone()
    }

    pub fn info(&self) -> PeerInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Whether the peer's own init message has been received, as opposed
    /// to the handshake completing because we wrote ours.
    pub fn peer_handshake_received(&self) -> bool {
        self.peer_handshake_received
    }

    /// Fills in a username learned out of band, e.g. from the pending
    /// entry a pierce-firewall token matched.
    pub(crate) fn set_username(&mut self, username: &str) {
        self.info.lock().unwrap().username = username.into();
    }

    /// The bytes accumulated for the file transfer so far.
    pub fn file_transfer_buffer(&self) -> &[u8] {
        &self.file_transfer_buffer
    }

    /// Runs the connection until it closes or switches to raw mode.
    ///
    /// A raw-mode exit leaves the connection fully usable through the raw
    /// byte operations; the framed handle stops being serviced.
    pub async fn start(&mut self) -> Result<SessionExit> {
        let socket = match self.pending_socket.take() {
            Some(socket) => socket,
            None => self.establish().await?,
        };
        self.stats.mark_connected();
        self.set_state(ConnectionState::Handshaking);

        let mut socket = Framed::new(
            socket,
            PeerCodec::new(self.kind, self.conf.max_receive_buffer_bytes),
        );

        if let Some(init) = self.initial_message.take() {
            self.send_init_frame(&mut socket, init).await?;
        }
        if self.should_stop_receiving {
            // a file-transfer channel we initiated: no framed traffic will
            // ever follow our init
            self.enter_raw_mode(socket);
            return Ok(SessionExit::FileTransfer { token: self.token });
        }

        self.run(socket).await
    }

    /// Dials the peer. Transient socket errors keep the attempt pending
    /// until the connect deadline; definitive ones fail it immediately.
    async fn establish(&mut self) -> Result<TcpStream> {
        log::info!("Connecting to peer {}", self.addr);
        self.set_state(ConnectionState::Connecting);

        let deadline = Instant::now() + self.connect_timeout;
        loop {
            match timeout_at(deadline, TcpStream::connect(self.addr)).await {
                Ok(Ok(socket)) => {
                    log::info!("Connected to peer {}", self.addr);
                    return Ok(socket);
                }
                Ok(Err(e)) if is_definitive(&e) => {
                    log::info!("Connect to peer {} failed: {}", self.addr, e);
                    return Err(self.fail(e.into()));
                }
                Ok(Err(e)) => {
                    log::debug!(
                        "Transient connect error to peer {}: {}",
                        self.addr,
                        e
                    );
                    if timeout_at(deadline, sleep(CONNECT_RETRY_DELAY))
                        .await
                        .is_err()
                    {
                        return Err(self.fail(Error::Timeout));
                    }
                }
                Err(_) => return Err(self.fail(Error::Timeout)),
            }
        }
    }

    /// The main framed-mode loop: multiplexes socket frames with commands
    /// from the handle.
    async fn run(
        &mut self,
        mut socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<SessionExit> {
        let exit = loop {
            tokio::select! {
                maybe_frame = socket.next() => match maybe_frame {
                    Some(Ok(frame)) => {
                        if let Some(exit) =
                            self.handle_frame(socket.codec_mut(), frame)?
                        {
                            break exit;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Peer {} receive error: {}", self.addr, e);
                        return Err(self.fail(e));
                    }
                    None => {
                        log::info!("Peer {} closed the connection", self.addr);
                        self.set_state(ConnectionState::Disconnected);
                        return Ok(SessionExit::Closed);
                    }
                },
                cmd = self.cmd_port.recv() => match cmd {
                    Some(Command::Send(msg)) => {
                        self.send_message(&mut socket, msg).await?;
                    }
                    Some(Command::SendInit(init)) => {
                        self.send_init_frame(&mut socket, init).await?;
                        if self.should_stop_receiving {
                            break SessionExit::FileTransfer { token: self.token };
                        }
                    }
                    Some(Command::AwaitTransfer { token, chan }) => {
                        self.transfer_handlers.insert(token, chan);
                    }
                    Some(Command::StopReceiving) => {
                        self.should_stop_receiving = true;
                        break SessionExit::FileTransfer { token: self.token };
                    }
                    Some(Command::Disconnect) | None => {
                        log::info!("Shutting down peer {} connection", self.addr);
                        self.set_state(ConnectionState::Disconnected);
                        return Ok(SessionExit::Closed);
                    }
                },
            }
        };

        self.enter_raw_mode(socket);
        Ok(exit)
    }

    /// Handles one decoded frame. Returns the session exit if the frame
    /// switched the connection to raw mode.
    fn handle_frame(
        &mut self,
        codec: &mut PeerCodec,
        frame: PeerFrame,
    ) -> Result<Option<SessionExit>> {
        match frame {
            PeerFrame::Init { code, payload } => {
                self.stats.record_received(5 + payload.len() as u64);
                let init = match InitMessage::decode(code, payload) {
                    Ok(init) => init,
                    Err(e) => {
                        log::warn!("Peer {} handshake malformed: {}", self.addr, e);
                        return Err(self.fail(e));
                    }
                };
                Ok(self.handle_init(codec, init))
            }
            PeerFrame::Message { code, payload } => {
                self.stats.record_received(8 + payload.len() as u64);
                self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                match PeerMessage::decode(code, payload, &self.caps) {
                    Ok(msg) => self.dispatch_message(msg),
                    Err(e) => {
                        // a single unparseable message is logged and
                        // skipped; the stream stays framed and alive
                        log::warn!(
                            "Dropping malformed peer message {} from {}: {}",
                            code,
                            self.addr,
                            e
                        );
                    }
                }
                Ok(None)
            }
            PeerFrame::Distributed { code, payload } => {
                self.stats.record_received(5 + payload.len() as u64);
                self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                match DistributedMessage::decode(code, payload) {
                    Ok(msg) => self.emit(PeerEvent::Distributed(msg)),
                    Err(e) => log::warn!(
                        "Dropping malformed distributed message {} from {}: {}",
                        code,
                        self.addr,
                        e
                    ),
                }
                Ok(None)
            }
            PeerFrame::Raw(bytes) => {
                self.stats.record_received(bytes.len() as u64);
                self.file_transfer_buffer.extend_from_slice(&bytes);
                Ok(None)
            }
        }
    }

    /// Handles the peer's init message. File-transfer handshakes stop the
    /// framed parser right here, before anything else can observe the
    /// connection.
    fn handle_init(
        &mut self,
        codec: &mut PeerCodec,
        init: InitMessage,
    ) -> Option<SessionExit> {
        self.handshake_complete = true;
        self.peer_handshake_received = true;
        codec.handshake_complete = true;

        match init {
            InitMessage::PierceFirewall(token) => {
                log::info!(
                    "Peer {} pierced firewall with token {}",
                    self.addr,
                    token
                );
                self.token = token;
                self.should_stop_receiving = true;
                self.set_state(ConnectionState::Connected);
                Some(SessionExit::PierceFirewall { token })
            }
            InitMessage::PeerInit {
                username,
                kind,
                token,
            } => {
                log::info!(
                    "Peer {} init: {} over {} channel, token {}",
                    self.addr,
                    username,
                    kind,
                    token
                );
                self.kind = kind;
                self.token = token;
                codec.kind = kind;
                self.info.lock().unwrap().username = username.clone();
                self.set_state(ConnectionState::Connected);

                if kind == ConnectionType::FileTransfer {
                    self.should_stop_receiving = true;
                    Some(SessionExit::FileTransfer { token })
                } else {
                    self.emit(PeerEvent::Handshaked {
                        username,
                        kind,
                        token,
                    });
                    None
                }
            }
        }
    }

    /// Routes a decoded control message: a registered per-token transfer
    /// handler wins over the generic event and is consumed; everything
    /// else becomes an event.
    fn dispatch_message(&mut self, msg: PeerMessage) {
        let event = match msg {
            PeerMessage::SharesRequest => PeerEvent::SharesRequest,
            PeerMessage::SharesReply(shares) => PeerEvent::SharesReceived(shares),
            PeerMessage::SearchReply(reply) => PeerEvent::SearchReply(reply),
            PeerMessage::UserInfoRequest => PeerEvent::UserInfoRequest,
            PeerMessage::UserInfoReply(info) => PeerEvent::UserInfoReceived(info),
            PeerMessage::FolderContentsRequest { token, folder } => {
                PeerEvent::FolderContentsRequest { token, folder }
            }
            PeerMessage::FolderContentsReply {
                token,
                folder,
                directories,
            } => PeerEvent::FolderContentsReceived {
                token,
                folder,
                directories,
            },
            PeerMessage::TransferRequest(req) => {
                if let Some(chan) = self.transfer_handlers.remove(&req.token) {
                    log::debug!(
                        "Transfer request {} matched its registered handler",
                        req.token
                    );
                    let _ = chan.send(req);
                    return;
                }
                PeerEvent::TransferRequest(req)
            }
            PeerMessage::TransferReply(reply) => PeerEvent::TransferReply(reply),
            PeerMessage::QueueDownload { filename } => {
                PeerEvent::QueueDownload { filename }
            }
            PeerMessage::PlaceInQueueRequest { filename } => {
                PeerEvent::PlaceInQueueRequest { filename }
            }
            PeerMessage::PlaceInQueueReply { filename, place } => {
                PeerEvent::PlaceInQueueReply { filename, place }
            }
            PeerMessage::UploadFailed { filename } => {
                PeerEvent::UploadFailed { filename }
            }
            PeerMessage::UploadDenied { filename, reason } => {
                PeerEvent::UploadDenied { filename, reason }
            }
            PeerMessage::Unknown { code, .. } => {
                log::debug!(
                    "Ignoring unknown peer message {} from {}",
                    code,
                    self.addr
                );
                return;
            }
        };
        self.emit(event);
    }

    async fn send_message(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        msg: PeerMessage,
    ) -> Result<()> {
        if !self.handshake_complete {
            // the handshake phase only permits init traffic
            log::warn!(
                "Dropping message {} to peer {}: handshake not complete",
                msg.code(),
                self.addr
            );
            return Ok(());
        }
        let frame = msg.encode()?;
        let len = frame.len() as u64;
        log::debug!("Sending message {} to peer {}", msg.code(), self.addr);
        if let Err(e) = socket.send(frame).await {
            return Err(self.fail(e));
        }
        self.stats.record_sent(len);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn send_init_frame(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        init: InitMessage,
    ) -> Result<()> {
        let frame = init.encode();
        let len = frame.len() as u64;
        log::debug!("Sending init message to peer {}", self.addr);
        if let Err(e) = socket.send(frame).await {
            return Err(self.fail(e));
        }
        self.stats.record_sent(len);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        // writing our init completes the handshake from our side
        self.handshake_complete = true;
        socket.codec_mut().handshake_complete = true;
        self.set_state(ConnectionState::Connected);
        if self.kind == ConnectionType::FileTransfer {
            self.should_stop_receiving = true;
        }
        Ok(())
    }

    /// Leaves framed mode: whatever the parser had buffered moves, in
    /// order, to the head of the file-transfer buffer, and the socket is
    /// kept for the raw byte operations.
    fn enter_raw_mode(&mut self, socket: Framed<TcpStream, PeerCodec>) {
        self.should_stop_receiving = true;
        let parts = socket.into_parts();
        if !parts.read_buf.is_empty() {
            log::debug!(
                "Moving {} buffered bytes to the file-transfer buffer",
                parts.read_buf.len()
            );
            self.file_transfer_buffer.extend_from_slice(&parts.read_buf);
        }
        self.stream = Some(parts.io);
    }

    /// Blocks until exactly `count` bytes are available, draining the
    /// file-transfer buffer before reading from the socket.
    pub async fn receive_raw_bytes(
        &mut self,
        count: usize,
        timeout: Duration,
    ) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        while self.file_transfer_buffer.len() < count {
            if self.raw_eof {
                return Err(Error::ConnectionClosed);
            }
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            let read = timeout_at(
                deadline,
                stream.read_buf(&mut self.file_transfer_buffer),
            )
            .await;
            match read {
                Ok(Ok(0)) => {
                    self.raw_eof = true;
                    return Err(Error::ConnectionClosed);
                }
                Ok(Ok(n)) => self.stats.record_received(n as u64),
                Ok(Err(e)) => return Err(self.fail(e.into())),
                Err(_) => return Err(Error::Timeout),
            }
        }
        Ok(self.file_transfer_buffer.split_to(count).freeze())
    }

    /// Returns up to `max` bytes of file payload.
    ///
    /// Bytes buffered before a socket close are still surfaced: a closing
    /// peer's final chunk arrives as [`FileChunk::DataWithCompletion`],
    /// and only a clean EOF with nothing buffered yields
    /// [`FileChunk::Complete`].
    pub async fn receive_file_chunk(&mut self, max: usize) -> Result<FileChunk> {
        if self.file_transfer_buffer.is_empty() {
            if self.raw_eof {
                return Ok(FileChunk::Complete);
            }
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            match stream.read_buf(&mut self.file_transfer_buffer).await {
                Ok(0) => {
                    self.raw_eof = true;
                    return Ok(FileChunk::Complete);
                }
                Ok(n) => self.stats.record_received(n as u64),
                Err(e) => return Err(self.fail(e.into())),
            }
        }

        let take = max.min(self.file_transfer_buffer.len());
        let data = self.file_transfer_buffer.split_to(take).freeze();

        // probe for EOF so the final chunk can be flagged as final
        if self.file_transfer_buffer.is_empty() && !self.raw_eof {
            if let Some(stream) = self.stream.as_mut() {
                match stream.try_read_buf(&mut self.file_transfer_buffer) {
                    Ok(0) => self.raw_eof = true,
                    Ok(n) => self.stats.record_received(n as u64),
                    Err(_) => {}
                }
            }
        }

        if self.raw_eof && self.file_transfer_buffer.is_empty() {
            Ok(FileChunk::DataWithCompletion(data))
        } else {
            Ok(FileChunk::Data(data))
        }
    }

    /// Writes bytes without any framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        if let Err(e) = stream.write_all(bytes).await {
            return Err(self.fail(e.into()));
        }
        self.stats.record_sent(bytes.len() as u64);
        Ok(())
    }

    /// Best-effort drain of whatever arrives before the timeout, up to
    /// `max` bytes. For post-EOF cleanup; never fails on socket errors.
    pub async fn drain_available_data(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        while self.file_transfer_buffer.len() < max && !self.raw_eof {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => break,
            };
            match timeout_at(
                deadline,
                stream.read_buf(&mut self.file_transfer_buffer),
            )
            .await
            {
                Ok(Ok(0)) => self.raw_eof = true,
                Ok(Ok(n)) => self.stats.record_received(n as u64),
                Ok(Err(_)) | Err(_) => break,
            }
        }
        let take = max.min(self.file_transfer_buffer.len());
        Ok(self.file_transfer_buffer.split_to(take).freeze())
    }

    /// Sends the file-transfer init: the token and the offset to resume
    /// from, raw with no framing.
    pub async fn send_file_transfer_init(
        &mut self,
        token: Token,
        offset: u64,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32_le(token);
        buf.put_u64_le(offset);
        self.send_raw(&buf).await
    }

    /// Reads the downloader's file-transfer init from the raw stream.
    pub async fn receive_file_transfer_init(
        &mut self,
        timeout: Duration,
    ) -> Result<(Token, u64)> {
        let mut buf = self.receive_raw_bytes(12, timeout).await?;
        let token = buf.get_u32_le();
        let offset = buf.get_u64_le();
        Ok((token, offset))
    }

    /// Drops the socket and marks the connection disconnected.
    pub fn disconnect(&mut self) {
        self.stream = None;
        self.pending_socket = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        log::info!("Peer {} connection state: {:?}", self.addr, state);
        self.state = state.clone();
        self.emit(PeerEvent::StateChanged(state));
    }

    fn fail(&mut self, e: Error) -> Error {
        self.stream = None;
        self.pending_socket = None;
        self.set_state(ConnectionState::Failed((&e).into()));
        e
    }

    fn emit(&self, event: PeerEvent) {
        // a dropped receiver means the engine is shutting down; nothing
        // left to notify
        let _ = self.events.send((self.id.clone(), event));
    }
}
