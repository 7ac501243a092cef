//! The long-lived control channel to the central server.
//!
//! One TCP connection carries every server message: login, peer discovery,
//! search, rooms and chat. Messages are length-prefixed frames decoded by
//! [`ServerCodec`] and surfaced as a lazy stream of [`ServerResponse`]s in
//! arrival order.

use bytes::{Buf, BufMut, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::conf::ServerConf;
use crate::error::{Error, Result};
use crate::wire::server::{OnlineStatus, ServerRequest, ServerResponse};
use crate::Token;

/// At any given time, the control channel is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

/// The framing codec of the server control channel.
///
/// Frames are `u32 length | u32 code | payload`; a buffer that outgrows the
/// configured cap tears the connection down rather than risk unbounded
/// growth against a misbehaving server.
pub(crate) struct ServerCodec {
    max_receive_buffer_bytes: usize,
}

impl ServerCodec {
    pub(crate) fn new(max_receive_buffer_bytes: usize) -> Self {
        Self {
            max_receive_buffer_bytes,
        }
    }
}

impl Decoder for ServerCodec {
    type Item = ServerResponse;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerResponse>> {
        if src.len() > self.max_receive_buffer_bytes {
            return Err(Error::BufferOverflow);
        }

        loop {
            if src.len() < 4 {
                return Ok(None);
            }
            let len =
                u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if len < 4 {
                return Err(Error::InvalidMessage("frame shorter than its code"));
            }
            if 4 + len > self.max_receive_buffer_bytes {
                return Err(Error::BufferOverflow);
            }
            if src.len() < 4 + len {
                src.reserve(4 + len - src.len());
                return Ok(None);
            }

            let mut frame = src.split_to(4 + len).freeze();
            frame.advance(4);
            let code = frame.get_u32_le();
            match ServerResponse::decode(code, frame) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    // a single garbled message is not worth the connection
                    log::warn!("Dropping malformed server message {}: {}", code, e);
                }
            }
        }
    }
}

impl Encoder<ServerRequest> for ServerCodec {
    type Error = Error;

    fn encode(&mut self, req: ServerRequest, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(&req.encode());
        Ok(())
    }
}

/// The connection to the central server.
pub struct ServerConnection {
    conf: ServerConf,
    state: State,
    socket: Option<Framed<TcpStream, ServerCodec>>,
}

impl ServerConnection {
    pub fn new(conf: ServerConf) -> Self {
        Self {
            conf,
            state: State::Disconnected,
            socket: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// Establishes the TCP connection to the configured server.
    ///
    /// Completes exactly once: with `Ok` when the socket is ready, or with
    /// the failure cause. Cancelling the returned future (dropping it)
    /// aborts the attempt and leaves the connection disconnected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        log::info!(
            "Connecting to server {}:{}",
            self.conf.host,
            self.conf.port
        );
        self.state = State::Connecting;

        let connect =
            TcpStream::connect((self.conf.host.as_str(), self.conf.port));
        let socket = match timeout(self.conf.connect_timeout, connect).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                self.state = State::Disconnected;
                return Err(e.into());
            }
            Err(_) => {
                self.state = State::Disconnected;
                return Err(Error::Timeout);
            }
        };

        log::info!("Connected to server {}:{}", self.conf.host, self.conf.port);
        self.socket = Some(Framed::new(
            socket,
            ServerCodec::new(self.conf.max_receive_buffer_bytes),
        ));
        self.state = State::Connected;
        Ok(())
    }

    /// Drops the socket. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if self.socket.take().is_some() {
            log::info!("Disconnected from server {}", self.conf.host);
        }
        self.state = State::Disconnected;
    }

    /// Sends a request; fails with [`Error::NotConnected`] unless the
    /// connection is established.
    pub async fn send(&mut self, req: ServerRequest) -> Result<()> {
        let socket = match (self.state, self.socket.as_mut()) {
            (State::Connected, Some(socket)) => socket,
            _ => return Err(Error::NotConnected),
        };
        log::debug!("Sending server message {}", req.code());
        if let Err(e) = socket.send(req).await {
            self.teardown();
            return Err(e);
        }
        Ok(())
    }

    /// Receives the next server message, in arrival order.
    ///
    /// Returns `Ok(None)` on clean close. On socket failure the connection
    /// transitions to disconnected and the cause is surfaced exactly once.
    pub async fn recv(&mut self) -> Result<Option<ServerResponse>> {
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Err(Error::NotConnected),
        };
        match socket.next().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => {
                self.teardown();
                Err(e)
            }
            None => {
                log::info!("Server {} closed the connection", self.conf.host);
                self.teardown();
                Ok(None)
            }
        }
    }

    /// Logs in and waits for the server's verdict, which is the first
    /// message the server sends.
    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<ServerResponse> {
        self.send(ServerRequest::Login {
            username: username.into(),
            password: password.into(),
        })
        .await?;
        match self.recv().await? {
            Some(msg @ ServerResponse::LoginOk { .. })
            | Some(msg @ ServerResponse::LoginFailure { .. }) => Ok(msg),
            Some(_) => Err(Error::InvalidMessage("expected login response")),
            None => Err(Error::ConnectionClosed),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.send(ServerRequest::Ping).await
    }

    pub async fn set_status(&mut self, status: OnlineStatus) -> Result<()> {
        self.send(ServerRequest::SetStatus(status)).await
    }

    pub async fn set_listen_port(&mut self, port: u16) -> Result<()> {
        self.send(ServerRequest::SetListenPort(port)).await
    }

    pub async fn set_shared_counts(
        &mut self,
        folder_count: u32,
        file_count: u32,
    ) -> Result<()> {
        self.send(ServerRequest::SharedFoldersFiles {
            folder_count,
            file_count,
        })
        .await
    }

    pub async fn search(&mut self, token: Token, query: &str) -> Result<()> {
        self.send(ServerRequest::FileSearch {
            token,
            query: query.into(),
        })
        .await
    }

    pub async fn join_room(&mut self, room: &str) -> Result<()> {
        self.send(ServerRequest::JoinRoom { room: room.into() }).await
    }

    pub async fn leave_room(&mut self, room: &str) -> Result<()> {
        self.send(ServerRequest::LeaveRoom { room: room.into() }).await
    }

    pub async fn say(&mut self, room: &str, message: &str) -> Result<()> {
        self.send(ServerRequest::SayChatroom {
            room: room.into(),
            message: message.into(),
        })
        .await
    }

    pub async fn ack_private_message(&mut self, message_id: u32) -> Result<()> {
        self.send(ServerRequest::MessageAcked { message_id }).await
    }

    /// Splits the connection into independently usable send and receive
    /// halves, for embedders that pump the message stream in a dedicated
    /// task while other tasks send.
    pub fn into_split(self) -> Result<(ServerWriter, ServerReader)> {
        match self.socket {
            Some(socket) => {
                let (sink, stream) = socket.split();
                Ok((ServerWriter { sink }, ServerReader { stream }))
            }
            None => Err(Error::NotConnected),
        }
    }

    fn teardown(&mut self) {
        self.socket = None;
        self.state = State::Disconnected;
    }
}

/// The send half of a split [`ServerConnection`].
pub struct ServerWriter {
    sink: SplitSink<Framed<TcpStream, ServerCodec>, ServerRequest>,
}

impl ServerWriter {
    pub async fn send(&mut self, req: ServerRequest) -> Result<()> {
        self.sink.send(req).await
    }
}

/// The receive half of a split [`ServerConnection`].
pub struct ServerReader {
    stream: SplitStream<Framed<TcpStream, ServerCodec>>,
}

impl ServerReader {
    pub async fn recv(&mut self) -> Result<Option<ServerResponse>> {
        match self.stream.next().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn decode_all(codec: &mut ServerCodec, src: &mut BytesMut) -> Vec<ServerResponse> {
        let mut out = Vec::new();
        while let Some(msg) = codec.decode(src).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_codec_emits_one_frame_per_message() {
        let mut codec = ServerCodec::new(1024);
        let mut src = BytesMut::new();

        // a ping frame: length 4, code 32
        src.extend_from_slice(&[4, 0, 0, 0, 32, 0, 0, 0]);
        assert_eq!(decode_all(&mut codec, &mut src), vec![ServerResponse::Ping]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_codec_handles_arbitrary_splits() {
        // the parser must produce the same single frame regardless of how
        // the bytes are chunked
        let frame: &[u8] = &[4, 0, 0, 0, 32, 0, 0, 0];
        for split in 0..frame.len() {
            let mut codec = ServerCodec::new(1024);
            let mut src = BytesMut::new();

            src.extend_from_slice(&frame[..split]);
            let first = decode_all(&mut codec, &mut src);
            src.extend_from_slice(&frame[split..]);
            let mut rest = decode_all(&mut codec, &mut src);

            let mut all = first;
            all.append(&mut rest);
            assert_eq!(all, vec![ServerResponse::Ping]);
        }
    }

    #[test]
    fn test_codec_rejects_oversized_frame() {
        let mut codec = ServerCodec::new(64);
        let mut src = BytesMut::new();
        src.extend_from_slice(&(1024u32).to_le_bytes());
        src.extend_from_slice(&[0; 16]);
        assert!(matches!(codec.decode(&mut src), Err(Error::BufferOverflow)));
    }

    #[test]
    fn test_codec_rejects_undersized_frame() {
        let mut codec = ServerCodec::new(64);
        let mut src = BytesMut::new();
        src.extend_from_slice(&(2u32).to_le_bytes());
        src.extend_from_slice(&[0, 0]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_send_requires_connected_state() {
        let mut conn =
            ServerConnection::new(ServerConf::new("127.0.0.1", 1));
        assert!(matches!(
            conn.send(ServerRequest::Ping).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(conn.recv().await, Err(Error::NotConnected)));
    }
}
