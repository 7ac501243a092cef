//! The direct-then-indirect peer connect flow.
//!
//! Dials a peer's advertised address first; when the peer is unreachable
//! (usually NAT), asks the server to have the peer connect back to us with
//! a matching token and parks the attempt in the pool's pending table. The
//! pool completes the loop when an inbound handshake carries the token.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::peer::PeerHandle;
use crate::pool::{PendingConnection, PoolHandle};
use crate::wire::peer::InitMessage;
use crate::wire::server::ServerRequest;
use crate::{ConnectionType, Token, DIRECT_TOKEN};

/// The process-wide token source: monotonically increasing, wrapping,
/// never the reserved direct-connection token.
#[derive(Debug)]
pub struct TokenGenerator {
    next: AtomicU32,
}

impl TokenGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next(&self) -> Token {
        loop {
            let token = self.next.fetch_add(1, Ordering::Relaxed);
            if token != DIRECT_TOKEN {
                return token;
            }
        }
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// How a connect request was satisfied.
pub enum ConnectOutcome {
    /// We reached the peer directly.
    Direct(PeerHandle),
    /// The direct dial failed; the server was asked to have the peer
    /// connect back to us with this token. The pool surfaces the matched
    /// connection once the peer arrives.
    Indirect { token: Token },
}

pub struct PeerConnector {
    pool: PoolHandle,
    server_chan: mpsc::UnboundedSender<ServerRequest>,
    tokens: TokenGenerator,
}

impl PeerConnector {
    /// `server_chan` carries the requests the traversal flow must relay
    /// through the server connection.
    pub fn new(
        pool: PoolHandle,
        server_chan: mpsc::UnboundedSender<ServerRequest>,
    ) -> Self {
        Self {
            pool,
            server_chan,
            tokens: TokenGenerator::new(),
        }
    }

    /// A fresh token, guarded against colliding with a still-pending one.
    /// Wrap-around collisions are astronomically unlikely, but a token
    /// that matched the wrong attempt would hand a connection to the
    /// wrong requester.
    pub async fn next_token(&self) -> Result<Token> {
        loop {
            let token = self.tokens.next();
            if !self.pool.is_pending(token).await? {
                return Ok(token);
            }
        }
    }

    /// Connects to `username` at its advertised address, falling back to
    /// a server-brokered indirect connection when the peer is
    /// unreachable.
    ///
    /// Admission rejections (invalid address, caps) are reported to the
    /// caller as-is; only dial failures fall back.
    pub async fn connect_to_peer(
        &self,
        username: &str,
        addr: SocketAddr,
        kind: ConnectionType,
    ) -> Result<ConnectOutcome> {
        match self.dial(username, addr, kind, DIRECT_TOKEN, false).await {
            Ok(handle) => Ok(ConnectOutcome::Direct(handle)),
            Err(
                e @ Error::InvalidAddress(_)
                | e @ Error::InvalidPort(_)
                | e @ Error::GlobalLimit,
            ) => Err(e),
            Err(e) => {
                log::info!(
                    "Direct connection to {} failed ({}), requesting indirect",
                    username,
                    e
                );
                let token = self.next_token().await?;
                self.pool.pending(username, token)?;
                self.server_chan.send(ServerRequest::ConnectToPeer {
                    token,
                    username: username.into(),
                    kind,
                })?;
                Ok(ConnectOutcome::Indirect { token })
            }
        }
    }

    /// Acts on a server directive to connect to a peer that asked for us:
    /// dial them and acknowledge with their token. A file-transfer
    /// channel switches to raw mode right after the pierce and comes back
    /// through the pool's handoff event.
    pub async fn handle_connect_directive(
        &self,
        username: &str,
        kind: ConnectionType,
        addr: SocketAddr,
        token: Token,
    ) -> Result<()> {
        match self.dial(username, addr, kind, token, true).await {
            Ok(handle) => {
                handle.send_init(InitMessage::PierceFirewall(token))?;
                Ok(())
            }
            Err(e) => {
                log::info!(
                    "Cannot reach {} for token {}: {}",
                    username,
                    token,
                    e
                );
                self.server_chan.send(ServerRequest::CantConnectToPeer {
                    token,
                    username: username.into(),
                })?;
                Ok(())
            }
        }
    }

    /// The server reports that the peer could not connect back to us;
    /// abandons the pending attempt.
    pub async fn peer_cannot_connect(
        &self,
        token: Token,
    ) -> Result<Option<PendingConnection>> {
        self.pool.resolve_pending(token).await
    }

    async fn dial(
        &self,
        username: &str,
        addr: SocketAddr,
        kind: ConnectionType,
        token: Token,
        is_indirect: bool,
    ) -> Result<PeerHandle> {
        let (handle, ready) = self
            .pool
            .connect_to(username, addr, kind, token, is_indirect)
            .await?;
        match ready.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(cause)) => Err(cause.into_error()),
            Err(_) => Err(Error::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::conf::{PeerConf, PoolConf};
    use crate::pool::{Pool, PoolEvent, PoolEventReceiver};

    #[test]
    fn test_token_generator_skips_direct_token() {
        let tokens = TokenGenerator::new();
        assert_eq!(tokens.next(), 1);
        assert_eq!(tokens.next(), 2);

        let wrapping = TokenGenerator {
            next: AtomicU32::new(u32::MAX),
        };
        assert_eq!(wrapping.next(), u32::MAX);
        // wraps to 0, which is reserved and skipped
        assert_eq!(wrapping.next(), 1);
    }

    fn harness() -> (
        PeerConnector,
        PoolEventReceiver,
        mpsc::UnboundedReceiver<ServerRequest>,
    ) {
        let conf = PoolConf {
            validate_addresses: false,
            ..PoolConf::default()
        };
        let (pool, pool_handle, pool_events) =
            Pool::new(conf, PeerConf::default(), "alice");
        tokio::spawn(pool.start());
        let (server_chan, server_port) = mpsc::unbounded_channel();
        (
            PeerConnector::new(pool_handle, server_chan),
            pool_events,
            server_port,
        )
    }

    #[tokio::test]
    async fn test_direct_connect() {
        let (connector, _events, _server) = harness();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await });
        let outcome = connector
            .connect_to_peer("bob", addr, ConnectionType::Peer)
            .await
            .unwrap();
        match outcome {
            ConnectOutcome::Direct(handle) => assert_eq!(handle.id(), "bob-0"),
            ConnectOutcome::Indirect { .. } => {
                panic!("expected a direct connection")
            }
        }
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_peer_falls_back_to_indirect() {
        let (connector, _events, mut server) = harness();

        // grab a port with no listener behind it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = connector
            .connect_to_peer("bob", addr, ConnectionType::Peer)
            .await
            .unwrap();
        let token = match outcome {
            ConnectOutcome::Indirect { token } => token,
            ConnectOutcome::Direct(_) => panic!("expected indirect fallback"),
        };

        // the server was asked to have bob connect back with the token,
        // and the attempt is parked as pending
        match server.recv().await.unwrap() {
            ServerRequest::ConnectToPeer {
                token: t,
                username,
                kind,
            } => {
                assert_eq!(t, token);
                assert_eq!(username, "bob");
                assert_eq!(kind, ConnectionType::Peer);
            }
            other => panic!("unexpected server request: {:?}", other),
        }
        assert!(connector.pool.is_pending(token).await.unwrap());

        // the server later reports the peer unreachable
        let pending =
            connector.peer_cannot_connect(token).await.unwrap().unwrap();
        assert_eq!(pending.username, "bob");
        assert!(!connector.pool.is_pending(token).await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_directive_pierces_with_token() {
        let (connector, mut events, _server) = harness();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let reader = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 9];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        connector
            .handle_connect_directive(
                "bob",
                ConnectionType::FileTransfer,
                addr,
                4321,
            )
            .await
            .unwrap();

        // the peer sees the pierce acknowledgement with its own token
        let buf = reader.await.unwrap();
        assert_eq!(
            buf,
            [0x05, 0x00, 0x00, 0x00, 0x00, 0xe1, 0x10, 0x00, 0x00]
        );

        // a file channel switches to raw mode and is handed over
        loop {
            match events.recv().await.expect("pool event stream ended") {
                PoolEvent::FileTransferConnection { token, .. } => {
                    assert_eq!(token, 4321);
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_unreachable_directive_reports_back() {
        let (connector, _events, mut server) = harness();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        connector
            .handle_connect_directive("bob", ConnectionType::Peer, addr, 77)
            .await
            .unwrap();

        assert_eq!(
            server.recv().await.unwrap(),
            ServerRequest::CantConnectToPeer {
                token: 77,
                username: "bob".into(),
            }
        );
    }
}
