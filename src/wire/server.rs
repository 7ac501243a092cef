//! Message types exchanged with the central server over the control
//! channel.
//!
//! Every server message is framed as `u32 length | u32 code | payload`.
//! Requests and responses share code numbers; the direction disambiguates.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::conf::{PROTOCOL_MINOR_VERSION, PROTOCOL_VERSION};
use crate::error::Result;
use crate::wire::{WireRead, WireWrite};
use crate::{ConnectionType, Token};

/// Server message codes.
pub mod code {
    pub const LOGIN: u32 = 1;
    pub const SET_LISTEN_PORT: u32 = 2;
    pub const GET_PEER_ADDRESS: u32 = 3;
    pub const WATCH_USER: u32 = 5;
    pub const UNWATCH_USER: u32 = 6;
    pub const SAY_CHATROOM: u32 = 13;
    pub const JOIN_ROOM: u32 = 14;
    pub const LEAVE_ROOM: u32 = 15;
    pub const USER_JOINED_ROOM: u32 = 16;
    pub const USER_LEFT_ROOM: u32 = 17;
    pub const CONNECT_TO_PEER: u32 = 18;
    pub const MESSAGE_USER: u32 = 22;
    pub const MESSAGE_ACKED: u32 = 23;
    pub const FILE_SEARCH: u32 = 26;
    pub const SET_STATUS: u32 = 28;
    pub const PING: u32 = 32;
    pub const SHARED_FOLDERS_FILES: u32 = 35;
    pub const CANT_CONNECT_TO_PEER: u32 = 1001;
}

/// The away/online status advertised to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStatus {
    Offline = 0,
    Away = 1,
    Online = 2,
}

/// A message sent to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerRequest {
    /// Authenticates this client. The digest is derived from the
    /// credentials during encoding.
    Login {
        username: String,
        password: String,
    },
    /// Advertises the port we accept inbound peer connections on.
    SetListenPort(u16),
    GetPeerAddress {
        username: String,
    },
    WatchUser {
        username: String,
    },
    UnwatchUser {
        username: String,
    },
    SayChatroom {
        room: String,
        message: String,
    },
    JoinRoom {
        room: String,
    },
    LeaveRoom {
        room: String,
    },
    /// Asks the server to have `username` connect back to us with `token`,
    /// because our direct attempt failed.
    ConnectToPeer {
        token: Token,
        username: String,
        kind: ConnectionType,
    },
    /// Acknowledges receipt of a private message so the server stops
    /// redelivering it.
    MessageAcked {
        message_id: u32,
    },
    FileSearch {
        token: Token,
        query: String,
    },
    SetStatus(OnlineStatus),
    Ping,
    /// Reports how much we share, shown to other users.
    SharedFoldersFiles {
        folder_count: u32,
        file_count: u32,
    },
    /// Tells the server an indirect connection attempt it relayed to us
    /// could not be established.
    CantConnectToPeer {
        token: Token,
        username: String,
    },
}

impl ServerRequest {
    /// The wire code of the request.
    pub fn code(&self) -> u32 {
        match self {
            Self::Login { .. } => code::LOGIN,
            Self::SetListenPort(_) => code::SET_LISTEN_PORT,
            Self::GetPeerAddress { .. } => code::GET_PEER_ADDRESS,
            Self::WatchUser { .. } => code::WATCH_USER,
            Self::UnwatchUser { .. } => code::UNWATCH_USER,
            Self::SayChatroom { .. } => code::SAY_CHATROOM,
            Self::JoinRoom { .. } => code::JOIN_ROOM,
            Self::LeaveRoom { .. } => code::LEAVE_ROOM,
            Self::ConnectToPeer { .. } => code::CONNECT_TO_PEER,
            Self::MessageAcked { .. } => code::MESSAGE_ACKED,
            Self::FileSearch { .. } => code::FILE_SEARCH,
            Self::SetStatus(_) => code::SET_STATUS,
            Self::Ping => code::PING,
            Self::SharedFoldersFiles { .. } => code::SHARED_FOLDERS_FILES,
            Self::CantConnectToPeer { .. } => code::CANT_CONNECT_TO_PEER,
        }
    }

    /// Encodes the full frame, including the length prefix and code.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            Self::Login { username, password } => {
                payload.write_string(username);
                payload.write_string(password);
                payload.write_u32(PROTOCOL_VERSION);
                let digest =
                    md5::compute(format!("{}{}", username, password));
                payload.write_string(&format!("{:x}", digest));
                payload.write_u32(PROTOCOL_MINOR_VERSION);
            }
            Self::SetListenPort(port) => payload.write_u32(*port as u32),
            Self::GetPeerAddress { username }
            | Self::WatchUser { username }
            | Self::UnwatchUser { username } => payload.write_string(username),
            Self::SayChatroom { room, message } => {
                payload.write_string(room);
                payload.write_string(message);
            }
            Self::JoinRoom { room } | Self::LeaveRoom { room } => {
                payload.write_string(room)
            }
            Self::ConnectToPeer {
                token,
                username,
                kind,
            } => {
                payload.write_u32(*token);
                payload.write_string(username);
                payload.write_string(kind.as_str());
            }
            Self::MessageAcked { message_id } => payload.write_u32(*message_id),
            Self::FileSearch { token, query } => {
                payload.write_u32(*token);
                payload.write_string(query);
            }
            Self::SetStatus(status) => payload.write_u32(*status as u32),
            Self::Ping => {}
            Self::SharedFoldersFiles {
                folder_count,
                file_count,
            } => {
                payload.write_u32(*folder_count);
                payload.write_u32(*file_count);
            }
            Self::CantConnectToPeer { token, username } => {
                payload.write_u32(*token);
                payload.write_string(username);
            }
        }

        let mut frame = BytesMut::with_capacity(8 + payload.len());
        frame.write_u32(4 + payload.len() as u32);
        frame.write_u32(self.code());
        frame.put_slice(&payload);
        frame.freeze()
    }
}

/// A message received from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerResponse {
    LoginOk {
        greeting: String,
        /// Our externally visible address, as the server sees it.
        ip: Ipv4Addr,
    },
    LoginFailure {
        reason: String,
    },
    GetPeerAddressReply {
        username: String,
        ip: Ipv4Addr,
        port: u16,
    },
    /// A directive to connect to the given peer, either because we asked
    /// for its address or because the peer asked the server to broker a
    /// connection to us.
    ConnectToPeer {
        username: String,
        kind: ConnectionType,
        ip: Ipv4Addr,
        port: u16,
        token: Token,
        privileged: bool,
    },
    SayChatroom {
        room: String,
        username: String,
        message: String,
    },
    UserJoinedRoom {
        room: String,
        username: String,
    },
    UserLeftRoom {
        room: String,
        username: String,
    },
    MessageUser {
        message_id: u32,
        timestamp: u32,
        username: String,
        message: String,
    },
    Ping,
    /// The peer could not establish the indirect connection we asked the
    /// server to broker.
    CantConnectToPeer {
        token: Token,
        username: String,
    },
    /// A message we don't interpret.
    Unknown {
        code: u32,
        payload: Bytes,
    },
}

impl ServerResponse {
    /// Decodes a server message payload.
    pub fn decode(code: u32, mut payload: Bytes) -> Result<Self> {
        match code {
            code::LOGIN => {
                if payload.read_bool()? {
                    let greeting = payload.read_string()?;
                    let ip = read_ipv4(&mut payload)?;
                    Ok(Self::LoginOk { greeting, ip })
                } else {
                    Ok(Self::LoginFailure {
                        reason: payload.read_string()?,
                    })
                }
            }
            code::GET_PEER_ADDRESS => {
                let username = payload.read_string()?;
                let ip = read_ipv4(&mut payload)?;
                let port = payload.read_u32()? as u16;
                Ok(Self::GetPeerAddressReply { username, ip, port })
            }
            code::CONNECT_TO_PEER => {
                let username = payload.read_string()?;
                let kind = payload.read_string()?;
                let kind = ConnectionType::from_str(&kind)
                    .unwrap_or(ConnectionType::Peer);
                let ip = read_ipv4(&mut payload)?;
                let port = payload.read_u32()? as u16;
                let token = payload.read_u32()?;
                // older servers don't send the privileged flag
                let privileged = payload.read_bool().unwrap_or(false);
                Ok(Self::ConnectToPeer {
                    username,
                    kind,
                    ip,
                    port,
                    token,
                    privileged,
                })
            }
            code::SAY_CHATROOM => {
                let room = payload.read_string()?;
                let username = payload.read_string()?;
                let message = payload.read_string()?;
                Ok(Self::SayChatroom {
                    room,
                    username,
                    message,
                })
            }
            code::USER_JOINED_ROOM => {
                let room = payload.read_string()?;
                let username = payload.read_string()?;
                // trailing per-user stats are not interpreted here
                Ok(Self::UserJoinedRoom { room, username })
            }
            code::USER_LEFT_ROOM => {
                let room = payload.read_string()?;
                let username = payload.read_string()?;
                Ok(Self::UserLeftRoom { room, username })
            }
            code::MESSAGE_USER => {
                let message_id = payload.read_u32()?;
                let timestamp = payload.read_u32()?;
                let username = payload.read_string()?;
                let message = payload.read_string()?;
                Ok(Self::MessageUser {
                    message_id,
                    timestamp,
                    username,
                    message,
                })
            }
            code::PING => Ok(Self::Ping),
            code::CANT_CONNECT_TO_PEER => {
                let token = payload.read_u32()?;
                let username = payload.read_string()?;
                Ok(Self::CantConnectToPeer { token, username })
            }
            _ => Ok(Self::Unknown { code, payload }),
        }
    }
}

/// Addresses are sent as a `u32` whose most significant byte is the first
/// octet.
fn read_ipv4(buf: &mut Bytes) -> Result<Ipv4Addr> {
    Ok(Ipv4Addr::from(buf.read_u32()?))
}
