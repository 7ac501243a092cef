// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

pub mod conf;
pub mod connector;
pub mod error;
pub mod peer;
pub mod pool;
pub mod server;
pub mod wire;

use std::net::SocketAddr;

/// The token that links an indirect connection attempt to the socket that
/// eventually serves it.
///
/// Tokens are generated by the local client, monotonically increasing and
/// wrapping. Token `0` is reserved for direct connections and never matches
/// a pending entry.
pub type Token = u32;

/// The reserved token used on connections we dial directly.
pub const DIRECT_TOKEN: Token = 0;

/// The separator used in protocol file paths, regardless of the local
/// platform.
pub const PATH_SEPARATOR: char = '\\';

/// The channel type negotiated in the init handshake.
///
/// It is carried on the wire as a single ASCII character and determines how
/// all subsequent bytes on the connection are parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// A peer control channel ("P"): framed messages for shares, search
    /// replies, transfer negotiation.
    Peer,
    /// A file transfer channel ("F"): after the handshake all bytes are raw
    /// file payload.
    FileTransfer,
    /// A distributed network channel ("D"): search request distribution.
    Distributed,
}

impl ConnectionType {
    /// Returns the wire representation of the connection type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Peer => "P",
            Self::FileTransfer => "F",
            Self::Distributed => "D",
        }
    }

    /// Parses the wire representation. Unknown strings are rejected, as per
    /// the protocol there are only three channel types.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "P" => Some(Self::Peer),
            "F" => Some(Self::FileTransfer),
            "D" => Some(Self::Distributed),
            _ => None,
        }
    }
}

impl Default for ConnectionType {
    fn default() -> Self {
        Self::Peer
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information about a peer, assembled from the server, the handshake, and
/// the peer's own reports.
///
/// The username may be empty at inbound accept time; it is filled in once
/// the peer's init message arrives. The address may likewise be resolved
/// from the socket's remote endpoint when it isn't known up front.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's username on the network.
    pub username: String,
    /// The peer's remote address, if known.
    pub addr: Option<SocketAddr>,
    /// Stats the peer reported about itself, mostly via search replies.
    pub stats: PeerStats,
}

impl PeerInfo {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }
}

/// Peer-reported statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Average upload speed, in bytes per second.
    pub upload_speed: u32,
    /// The number of transfers waiting in the peer's upload queue.
    pub queue_length: u32,
    /// The number of files the peer shares.
    pub shared_file_count: u32,
    /// The number of folders the peer shares.
    pub shared_folder_count: u32,
    /// Whether the peer has a free upload slot.
    pub free_upload_slots: bool,
}
