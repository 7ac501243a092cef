//! Message types exchanged directly between peers: the init handshake, the
//! peer control channel, and the distributed network channel.
//!
//! Init messages are framed as `u32 length | u8 code | payload`, control
//! messages as `u32 length | u32 code | payload`, distributed messages as
//! `u32 length | u8 code | payload`. Shares, folder contents and (usually)
//! search replies carry their payload as a zlib stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::wire::compress;
use crate::wire::{WireRead, WireWrite};
use crate::{ConnectionType, Token, PATH_SEPARATOR};

/// Init message codes.
pub const PIERCE_FIREWALL: u8 = 0;
pub const PEER_INIT: u8 = 1;

/// Peer control message codes.
pub mod code {
    pub const SHARES_REQUEST: u32 = 4;
    pub const SHARES_REPLY: u32 = 5;
    pub const SEARCH_REPLY: u32 = 9;
    pub const USER_INFO_REQUEST: u32 = 15;
    pub const USER_INFO_REPLY: u32 = 16;
    pub const FOLDER_CONTENTS_REQUEST: u32 = 36;
    pub const FOLDER_CONTENTS_REPLY: u32 = 37;
    pub const TRANSFER_REQUEST: u32 = 40;
    pub const TRANSFER_REPLY: u32 = 41;
    pub const QUEUE_DOWNLOAD: u32 = 43;
    pub const PLACE_IN_QUEUE_REPLY: u32 = 44;
    pub const UPLOAD_FAILED: u32 = 46;
    pub const UPLOAD_DENIED: u32 = 50;
    pub const PLACE_IN_QUEUE_REQUEST: u32 = 51;
}

/// Distributed message codes.
pub mod dist_code {
    pub const PING: u8 = 0;
    pub const SEARCH_REQUEST: u8 = 3;
    pub const BRANCH_LEVEL: u8 = 4;
    pub const BRANCH_ROOT: u8 = 5;
    pub const EMBEDDED_MESSAGE: u8 = 93;
}

/// Caps applied while decoding untrusted payloads.
#[derive(Clone, Copy, Debug)]
pub struct DecodeCaps {
    /// Compressed payloads may not inflate beyond this.
    pub max_decompressed_bytes: usize,
    /// Compressed payloads may not inflate beyond this ratio.
    pub max_compression_ratio: u64,
}

impl Default for DecodeCaps {
    fn default() -> Self {
        Self {
            max_decompressed_bytes: 50 * 1024 * 1024,
            max_compression_ratio: 1000,
        }
    }
}

/// The most directories a shares or folder-contents reply may list.
const MAX_DIR_COUNT: usize = 100_000;
/// The most files a single directory or search reply may list.
const MAX_FILE_COUNT: usize = 100_000;
/// The most attributes a single file entry may carry.
const MAX_ATTR_COUNT: usize = 100;

/// The first bytes sent on a freshly established peer socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitMessage {
    /// Acknowledges an indirect connection request, carrying the matching
    /// token.
    PierceFirewall(Token),
    /// Identifies the initiating side and the channel type.
    PeerInit {
        username: String,
        kind: ConnectionType,
        token: Token,
    },
}

impl InitMessage {
    /// Encodes the full frame, including the length prefix.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        let code = match self {
            Self::PierceFirewall(token) => {
                payload.write_u32(*token);
                PIERCE_FIREWALL
            }
            Self::PeerInit {
                username,
                kind,
                token,
            } => {
                payload.write_string(username);
                payload.write_string(kind.as_str());
                payload.write_u32(*token);
                PEER_INIT
            }
        };
        let mut frame = BytesMut::with_capacity(5 + payload.len());
        frame.write_u32(1 + payload.len() as u32);
        frame.write_u8(code);
        frame.put_slice(&payload);
        frame.freeze()
    }

    /// Decodes the payload following the 1-byte init code.
    pub fn decode(code: u8, mut payload: Bytes) -> Result<Self> {
        match code {
            PIERCE_FIREWALL => Ok(Self::PierceFirewall(payload.read_u32()?)),
            PEER_INIT => {
                let username = payload.read_string()?;
                let kind = payload.read_string()?;
                let kind = ConnectionType::from_str(&kind)
                    .ok_or(Error::HandshakeFailed("unknown connection type"))?;
                let token = payload.read_u32()?;
                Ok(Self::PeerInit {
                    username,
                    kind,
                    token,
                })
            }
            _ => Err(Error::HandshakeFailed("unknown init code")),
        }
    }
}

/// A single file attribute, e.g. bitrate or duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub kind: u32,
    pub value: u32,
}

impl FileAttr {
    pub const BITRATE: u32 = 0;
    pub const DURATION: u32 = 1;
    pub const SAMPLE_RATE: u32 = 4;
    pub const BIT_DEPTH: u32 = 5;
}

/// A file listed in a shares, search or folder-contents reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub extension: String,
    pub attrs: Vec<FileAttr>,
}

impl FileEntry {
    fn attr(&self, kind: u32) -> Option<u32> {
        self.attrs.iter().find(|a| a.kind == kind).map(|a| a.value)
    }

    pub fn bitrate(&self) -> Option<u32> {
        self.attr(FileAttr::BITRATE)
    }

    pub fn duration(&self) -> Option<u32> {
        self.attr(FileAttr::DURATION)
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.attr(FileAttr::SAMPLE_RATE)
    }

    pub fn bit_depth(&self) -> Option<u32> {
        self.attr(FileAttr::BIT_DEPTH)
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.write_u8(1);
        buf.write_string(&self.filename);
        buf.write_u64(self.size);
        buf.write_string(&self.extension);
        buf.write_u32(self.attrs.len() as u32);
        for attr in &self.attrs {
            buf.write_u32(attr.kind);
            buf.write_u32(attr.value);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let _code = buf.read_u8()?;
        let filename = buf.read_string()?;
        let size = buf.read_u64()?;
        let extension = buf.read_string()?;
        let attr_count = buf.read_u32()? as usize;
        if attr_count > MAX_ATTR_COUNT {
            return Err(Error::InvalidMessage("attribute count cap exceeded"));
        }
        let mut attrs = Vec::with_capacity(attr_count);
        for _ in 0..attr_count {
            attrs.push(FileAttr {
                kind: buf.read_u32()?,
                value: buf.read_u32()?,
            });
        }
        Ok(Self {
            filename,
            size,
            extension,
            attrs,
        })
    }
}

/// A shared directory and the files directly inside it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Directory {
    pub name: String,
    pub files: Vec<FileEntry>,
}

impl Directory {
    fn encode(&self, buf: &mut BytesMut) {
        buf.write_string(&self.name);
        buf.write_u32(self.files.len() as u32);
        for file in &self.files {
            file.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let name = buf.read_string()?;
        let file_count = buf.read_u32()? as usize;
        if file_count > MAX_FILE_COUNT {
            return Err(Error::InvalidMessage("file count cap exceeded"));
        }
        let mut files = Vec::with_capacity(file_count.min(1024));
        for _ in 0..file_count {
            files.push(FileEntry::decode(buf)?);
        }
        Ok(Self { name, files })
    }
}

/// Joins a directory and a file name with the protocol's path separator.
pub fn full_filename(dir: &str, file: &str) -> String {
    let mut path = String::with_capacity(dir.len() + 1 + file.len());
    path.push_str(dir);
    path.push(PATH_SEPARATOR);
    path.push_str(file);
    path
}

/// The full listing of a peer's shared files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Shares {
    pub directories: Vec<Directory>,
    pub private_directories: Vec<Directory>,
}

impl Shares {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.write_u32(self.directories.len() as u32);
        for dir in &self.directories {
            dir.encode(&mut buf);
        }
        // an unused field carried for compatibility
        buf.write_u32(0);
        buf.write_u32(self.private_directories.len() as u32);
        for dir in &self.private_directories {
            dir.encode(&mut buf);
        }
        buf
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let dir_count = buf.read_u32()? as usize;
        if dir_count > MAX_DIR_COUNT {
            return Err(Error::InvalidMessage("directory count cap exceeded"));
        }
        let mut directories = Vec::with_capacity(dir_count.min(1024));
        for _ in 0..dir_count {
            directories.push(Directory::decode(buf)?);
        }

        // older clients end the payload here; the unused field and the
        // private section are both optional
        let mut private_directories = Vec::new();
        if buf.read_u32().is_ok() {
            if let Ok(private_count) = buf.read_u32() {
                let private_count = private_count as usize;
                if private_count > MAX_DIR_COUNT {
                    return Err(Error::InvalidMessage(
                        "private directory count cap exceeded",
                    ));
                }
                for _ in 0..private_count {
                    private_directories.push(Directory::decode(buf)?);
                }
            }
        }

        Ok(Self {
            directories,
            private_directories,
        })
    }
}

/// A peer's answer to one of our searches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchReply {
    pub username: String,
    pub token: Token,
    pub files: Vec<FileEntry>,
    pub free_upload_slots: bool,
    pub upload_speed: u32,
    pub queue_length: u32,
}

impl SearchReply {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.write_string(&self.username);
        buf.write_u32(self.token);
        buf.write_u32(self.files.len() as u32);
        for file in &self.files {
            file.encode(&mut buf);
        }
        buf.write_bool(self.free_upload_slots);
        buf.write_u32(self.upload_speed);
        buf.write_u32(self.queue_length);
        buf
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let username = buf.read_string()?;
        let token = buf.read_u32()?;
        let file_count = buf.read_u32()? as usize;
        if file_count > MAX_FILE_COUNT {
            return Err(Error::InvalidMessage("file count cap exceeded"));
        }
        let mut files = Vec::with_capacity(file_count.min(1024));
        for _ in 0..file_count {
            files.push(FileEntry::decode(buf)?);
        }
        let free_upload_slots = buf.read_bool()?;
        let upload_speed = buf.read_u32()?;
        let queue_length = buf.read_u32()?;
        Ok(Self {
            username,
            token,
            files,
            free_upload_slots,
            upload_speed,
            queue_length,
        })
    }
}

/// A peer's self description, sent in reply to a user info request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub description: String,
    pub picture: Option<Vec<u8>>,
    pub total_uploads: u32,
    pub queue_length: u32,
    pub free_upload_slots: bool,
}

impl UserInfo {
    fn encode(&self, buf: &mut BytesMut) {
        buf.write_string(&self.description);
        match &self.picture {
            Some(picture) => {
                buf.write_bool(true);
                buf.write_u32(picture.len() as u32);
                buf.put_slice(picture);
            }
            None => buf.write_bool(false),
        }
        buf.write_u32(self.total_uploads);
        buf.write_u32(self.queue_length);
        buf.write_bool(self.free_upload_slots);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let description = buf.read_string()?;
        let picture = if buf.read_bool()? {
            let len = buf.read_u32()? as usize;
            if buf.remaining() < len {
                return Err(Error::InvalidMessage("truncated picture"));
            }
            Some(buf.copy_to_bytes(len).to_vec())
        } else {
            None
        };
        let total_uploads = buf.read_u32()?;
        let queue_length = buf.read_u32()?;
        let free_upload_slots = buf.read_bool()?;
        Ok(Self {
            description,
            picture,
            total_uploads,
            queue_length,
            free_upload_slots,
        })
    }
}

/// The direction of a requested transfer, from the requester's point of
/// view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Download = 0,
    Upload = 1,
}

impl TransferDirection {
    fn from_wire(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::Download),
            1 => Ok(Self::Upload),
            _ => Err(Error::InvalidMessage("unknown transfer direction")),
        }
    }
}

/// A request to start a transfer over this control connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub token: Token,
    pub filename: String,
    /// Present when the sender is offering an upload.
    pub size: Option<u64>,
}

impl TransferRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.write_u32(self.direction as u32);
        buf.write_u32(self.token);
        buf.write_string(&self.filename);
        if self.direction == TransferDirection::Upload {
            buf.write_u64(self.size.unwrap_or(0));
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let direction = TransferDirection::from_wire(buf.read_u32()?)?;
        let token = buf.read_u32()?;
        let filename = buf.read_string()?;
        let size = if direction == TransferDirection::Upload {
            Some(buf.read_u64()?)
        } else {
            None
        };
        Ok(Self {
            direction,
            token,
            filename,
            size,
        })
    }
}

/// The answer to a [`TransferRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferReply {
    pub token: Token,
    pub allowed: bool,
    /// Present when the transfer is allowed.
    pub size: Option<u64>,
    /// Present when the transfer is refused.
    pub reason: Option<String>,
}

impl TransferReply {
    fn encode(&self, buf: &mut BytesMut) {
        buf.write_u32(self.token);
        buf.write_bool(self.allowed);
        if self.allowed {
            buf.write_u64(self.size.unwrap_or(0));
        } else if let Some(reason) = &self.reason {
            buf.write_string(reason);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        let token = buf.read_u32()?;
        let allowed = buf.read_bool()?;
        let (size, reason) = if allowed {
            // some clients omit the size on upload acks
            let size = if buf.remaining() >= 8 {
                Some(buf.read_u64()?)
            } else {
                None
            };
            (size, None)
        } else {
            let reason = if buf.has_remaining() {
                Some(buf.read_string()?)
            } else {
                None
            };
            (None, reason)
        };
        Ok(Self {
            token,
            allowed,
            size,
            reason,
        })
    }
}

/// A message on the peer control channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    /// Asks the peer for its full share listing.
    SharesRequest,
    /// The full share listing; zlib on the wire.
    SharesReply(Shares),
    /// A search result; zlib on the wire, though some clients send it raw.
    SearchReply(SearchReply),
    UserInfoRequest,
    UserInfoReply(UserInfo),
    FolderContentsRequest {
        token: Token,
        folder: String,
    },
    /// The contents of one folder; zlib on the wire.
    FolderContentsReply {
        token: Token,
        folder: String,
        directories: Vec<Directory>,
    },
    TransferRequest(TransferRequest),
    TransferReply(TransferReply),
    /// Asks the peer to queue an upload of the named file to us.
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
    /// A message we don't interpret; kept so unknown codes round-trip in
    /// logs without killing the connection.
    Unknown {
        code: u32,
        payload: Bytes,
    },
}

impl PeerMessage {
    /// The wire code of the message.
    pub fn code(&self) -> u32 {
        match self {
            Self::SharesRequest => code::SHARES_REQUEST,
            Self::SharesReply(_) => code::SHARES_REPLY,
            Self::SearchReply(_) => code::SEARCH_REPLY,
            Self::UserInfoRequest => code::USER_INFO_REQUEST,
            Self::UserInfoReply(_) => code::USER_INFO_REPLY,
            Self::FolderContentsRequest { .. } => code::FOLDER_CONTENTS_REQUEST,
            Self::FolderContentsReply { .. } => code::FOLDER_CONTENTS_REPLY,
            Self::TransferRequest(_) => code::TRANSFER_REQUEST,
            Self::TransferReply(_) => code::TRANSFER_REPLY,
            Self::QueueDownload { .. } => code::QUEUE_DOWNLOAD,
            Self::PlaceInQueueRequest { .. } => code::PLACE_IN_QUEUE_REQUEST,
            Self::PlaceInQueueReply { .. } => code::PLACE_IN_QUEUE_REPLY,
            Self::UploadFailed { .. } => code::UPLOAD_FAILED,
            Self::UploadDenied { .. } => code::UPLOAD_DENIED,
            Self::Unknown { code, .. } => *code,
        }
    }

    /// Encodes the full frame, including the length prefix and code.
    pub fn encode(&self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        match self {
            Self::SharesRequest | Self::UserInfoRequest => {}
            Self::SharesReply(shares) => {
                let compressed = compress::deflate(&shares.encode())?;
                payload.put_slice(&compressed);
            }
            Self::SearchReply(reply) => {
                let compressed = compress::deflate(&reply.encode())?;
                payload.put_slice(&compressed);
            }
            Self::UserInfoReply(info) => info.encode(&mut payload),
            Self::FolderContentsRequest { token, folder } => {
                payload.write_u32(*token);
                payload.write_string(folder);
            }
            Self::FolderContentsReply {
                token,
                folder,
                directories,
            } => {
                let mut inner = BytesMut::new();
                inner.write_u32(*token);
                inner.write_string(folder);
                inner.write_u32(directories.len() as u32);
                for dir in directories {
                    dir.encode(&mut inner);
                }
                let compressed = compress::deflate(&inner)?;
                payload.put_slice(&compressed);
            }
            Self::TransferRequest(req) => req.encode(&mut payload),
            Self::TransferReply(reply) => reply.encode(&mut payload),
            Self::QueueDownload { filename }
            | Self::PlaceInQueueRequest { filename }
            | Self::UploadFailed { filename } => {
                payload.write_string(filename);
            }
            Self::PlaceInQueueReply { filename, place } => {
                payload.write_string(filename);
                payload.write_u32(*place);
            }
            Self::UploadDenied { filename, reason } => {
                payload.write_string(filename);
                payload.write_string(reason);
            }
            Self::Unknown { payload: raw, .. } => payload.put_slice(raw),
        }

        let mut frame = BytesMut::with_capacity(8 + payload.len());
        frame.write_u32(4 + payload.len() as u32);
        frame.write_u32(self.code());
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decodes a control message payload.
    ///
    /// Decompression failures on the mandatory-compressed replies are
    /// recovered locally: the protocol requires compression there, so a
    /// peer that violates the caps gets its listing delivered empty rather
    /// than its connection dropped.
    pub fn decode(code: u32, mut payload: Bytes, caps: &DecodeCaps) -> Result<Self> {
        match code {
            code::SHARES_REQUEST => Ok(Self::SharesRequest),
            code::SHARES_REPLY => {
                let shares = match inflate_payload(&payload, caps) {
                    Ok(mut inner) => Shares::decode(&mut inner)?,
                    Err(e) => {
                        log::warn!("Failed to inflate shares reply: {}", e);
                        Shares::default()
                    }
                };
                Ok(Self::SharesReply(shares))
            }
            code::SEARCH_REPLY => {
                // most peers compress search replies, but a raw payload is
                // tolerated as some implementations send it uncompressed
                let reply = match inflate_payload(&payload, caps) {
                    Ok(mut inner) => SearchReply::decode(&mut inner)?,
                    Err(_) => SearchReply::decode(&mut payload)?,
                };
                Ok(Self::SearchReply(reply))
            }
            code::USER_INFO_REQUEST => Ok(Self::UserInfoRequest),
            code::USER_INFO_REPLY => {
                Ok(Self::UserInfoReply(UserInfo::decode(&mut payload)?))
            }
            code::FOLDER_CONTENTS_REQUEST => {
                let token = payload.read_u32()?;
                let folder = payload.read_string()?;
                Ok(Self::FolderContentsRequest { token, folder })
            }
            code::FOLDER_CONTENTS_REPLY => match inflate_payload(&payload, caps) {
                Ok(mut inner) => {
                    let token = inner.read_u32()?;
                    let folder = inner.read_string()?;
                    let dir_count = inner.read_u32()? as usize;
                    if dir_count > MAX_DIR_COUNT {
                        return Err(Error::InvalidMessage(
                            "directory count cap exceeded",
                        ));
                    }
                    let mut directories = Vec::with_capacity(dir_count.min(1024));
                    for _ in 0..dir_count {
                        directories.push(Directory::decode(&mut inner)?);
                    }
                    Ok(Self::FolderContentsReply {
                        token,
                        folder,
                        directories,
                    })
                }
                Err(e) => {
                    log::warn!("Failed to inflate folder contents reply: {}", e);
                    Ok(Self::FolderContentsReply {
                        token: 0,
                        folder: String::new(),
                        directories: Vec::new(),
                    })
                }
            },
            code::TRANSFER_REQUEST => Ok(Self::TransferRequest(
                TransferRequest::decode(&mut payload)?,
            )),
            code::TRANSFER_REPLY => {
                Ok(Self::TransferReply(TransferReply::decode(&mut payload)?))
            }
            code::QUEUE_DOWNLOAD => Ok(Self::QueueDownload {
                filename: payload.read_string()?,
            }),
            code::PLACE_IN_QUEUE_REQUEST => Ok(Self::PlaceInQueueRequest {
                filename: payload.read_string()?,
            }),
            code::PLACE_IN_QUEUE_REPLY => Ok(Self::PlaceInQueueReply {
                filename: payload.read_string()?,
                place: payload.read_u32()?,
            }),
            code::UPLOAD_FAILED => Ok(Self::UploadFailed {
                filename: payload.read_string()?,
            }),
            code::UPLOAD_DENIED => Ok(Self::UploadDenied {
                filename: payload.read_string()?,
                reason: payload.read_string()?,
            }),
            _ => Ok(Self::Unknown { code, payload }),
        }
    }
}

fn inflate_payload(payload: &[u8], caps: &DecodeCaps) -> Result<Bytes> {
    compress::inflate(
        payload,
        caps.max_decompressed_bytes,
        caps.max_compression_ratio,
    )
    .map(Bytes::from)
}

/// A message on a distributed network channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DistributedMessage {
    Ping,
    /// A search request forwarded down the distributed tree.
    SearchRequest {
        username: String,
        token: Token,
        query: String,
    },
    BranchLevel(u32),
    BranchRoot(String),
    /// A server message relayed through the tree root.
    EmbeddedMessage {
        code: u8,
        payload: Bytes,
    },
    Unknown {
        code: u8,
        payload: Bytes,
    },
}

impl DistributedMessage {
    /// Decodes the payload following the 1-byte distributed code.
    pub fn decode(code: u8, mut payload: Bytes) -> Result<Self> {
        match code {
            dist_code::PING => Ok(Self::Ping),
            dist_code::SEARCH_REQUEST => {
                // leading unknown field carried by current servers
                let _ = payload.read_u32()?;
                let username = payload.read_string()?;
                let token = payload.read_u32()?;
                let query = payload.read_string()?;
                Ok(Self::SearchRequest {
                    username,
                    token,
                    query,
                })
            }
            dist_code::BRANCH_LEVEL => Ok(Self::BranchLevel(payload.read_u32()?)),
            dist_code::BRANCH_ROOT => Ok(Self::BranchRoot(payload.read_string()?)),
            dist_code::EMBEDDED_MESSAGE => {
                let inner_code = payload.read_u8()?;
                Ok(Self::EmbeddedMessage {
                    code: inner_code,
                    payload,
                })
            }
            _ => Ok(Self::Unknown { code, payload }),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn caps() -> DecodeCaps {
        DecodeCaps::default()
    }

    #[test]
    fn test_peer_init_exact_bytes() {
        let frame = InitMessage::PeerInit {
            username: "alice".into(),
            kind: ConnectionType::Peer,
            token: 0,
        }
        .encode();
        assert_eq!(
            &frame[..],
            &[
                0x13, 0x00, 0x00, 0x00, // length = 19
                0x01, // code = PeerInit
                0x05, 0x00, 0x00, 0x00, b'a', b'l', b'i', b'c', b'e',
                0x01, 0x00, 0x00, 0x00, b'P', // type
                0x00, 0x00, 0x00, 0x00, // token
            ][..]
        );
    }

    #[test]
    fn test_pierce_firewall_exact_bytes() {
        let frame = InitMessage::PierceFirewall(1234).encode();
        assert_eq!(
            &frame[..],
            &[0x05, 0x00, 0x00, 0x00, 0x00, 0xd2, 0x04, 0x00, 0x00][..]
        );
    }

    #[test]
    fn test_init_round_trip() {
        for msg in [
            InitMessage::PierceFirewall(0xdead_beef),
            InitMessage::PeerInit {
                username: "bob".into(),
                kind: ConnectionType::FileTransfer,
                token: 42,
            },
        ]
        .iter()
        {
            let frame = msg.encode();
            let mut buf = Bytes::copy_from_slice(&frame);
            let _len = buf.read_u32().unwrap();
            let code = buf.read_u8().unwrap();
            assert_eq!(&InitMessage::decode(code, buf).unwrap(), msg);
        }
    }

    fn round_trip(msg: PeerMessage) -> PeerMessage {
        let frame = msg.encode().unwrap();
        let mut buf = Bytes::copy_from_slice(&frame);
        let len = buf.read_u32().unwrap() as usize;
        assert_eq!(buf.remaining(), len);
        let code = buf.read_u32().unwrap();
        PeerMessage::decode(code, buf, &caps()).unwrap()
    }

    fn sample_file() -> FileEntry {
        FileEntry {
            filename: "music\\album\\01 - intro.flac".into(),
            size: 31_337_420,
            extension: "flac".into(),
            attrs: vec![
                FileAttr {
                    kind: FileAttr::BITRATE,
                    value: 1411,
                },
                FileAttr {
                    kind: FileAttr::DURATION,
                    value: 184,
                },
                FileAttr {
                    kind: FileAttr::SAMPLE_RATE,
                    value: 44_100,
                },
            ],
        }
    }

    #[test]
    fn test_shares_reply_round_trip() {
        let msg = PeerMessage::SharesReply(Shares {
            directories: vec![
                Directory {
                    name: "music\\album".into(),
                    files: vec![sample_file()],
                },
                Directory {
                    name: "music\\empty".into(),
                    files: vec![],
                },
            ],
            private_directories: vec![Directory {
                name: "private".into(),
                files: vec![sample_file()],
            }],
        });
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_search_reply_round_trip_and_attrs() {
        let msg = PeerMessage::SearchReply(SearchReply {
            username: "carol".into(),
            token: 99,
            files: vec![sample_file()],
            free_upload_slots: true,
            upload_speed: 125_000,
            queue_length: 3,
        });
        let decoded = round_trip(msg.clone());
        assert_eq!(decoded, msg);
        if let PeerMessage::SearchReply(reply) = decoded {
            assert_eq!(reply.files[0].bitrate(), Some(1411));
            assert_eq!(reply.files[0].duration(), Some(184));
            assert_eq!(reply.files[0].sample_rate(), Some(44_100));
            assert_eq!(reply.files[0].bit_depth(), None);
        }
    }

    #[test]
    fn test_search_reply_raw_fallback() {
        // an uncompressed search reply payload must still parse
        let reply = SearchReply {
            username: "dave".into(),
            token: 7,
            files: vec![sample_file()],
            free_upload_slots: false,
            upload_speed: 0,
            queue_length: 12,
        };
        let raw = reply.encode().freeze();
        let decoded =
            PeerMessage::decode(code::SEARCH_REPLY, raw, &caps()).unwrap();
        assert_eq!(decoded, PeerMessage::SearchReply(reply));
    }

    #[test]
    fn test_shares_reply_bomb_delivers_empty() {
        // inflates to 2 MiB against a 1 MiB cap
        let inner = vec![0u8; 2 * 1024 * 1024];
        let payload = compress::deflate(&inner).unwrap();
        let caps = DecodeCaps {
            max_decompressed_bytes: 1024 * 1024,
            max_compression_ratio: u64::MAX,
        };
        let decoded =
            PeerMessage::decode(code::SHARES_REPLY, payload.into(), &caps).unwrap();
        assert_eq!(decoded, PeerMessage::SharesReply(Shares::default()));
    }

    #[test]
    fn test_transfer_request_round_trip() {
        let download = PeerMessage::TransferRequest(TransferRequest {
            direction: TransferDirection::Download,
            token: 55,
            filename: "a\\b.mp3".into(),
            size: None,
        });
        let upload = PeerMessage::TransferRequest(TransferRequest {
            direction: TransferDirection::Upload,
            token: 56,
            filename: "a\\b.mp3".into(),
            size: Some(1024),
        });
        assert_eq!(round_trip(download.clone()), download);
        assert_eq!(round_trip(upload.clone()), upload);
    }

    #[test]
    fn test_transfer_reply_round_trip() {
        let allowed = PeerMessage::TransferReply(TransferReply {
            token: 1,
            allowed: true,
            size: Some(4096),
            reason: None,
        });
        let refused = PeerMessage::TransferReply(TransferReply {
            token: 2,
            allowed: false,
            size: None,
            reason: Some("Queued".into()),
        });
        assert_eq!(round_trip(allowed.clone()), allowed);
        assert_eq!(round_trip(refused.clone()), refused);
    }

    #[test]
    fn test_folder_contents_round_trip() {
        let request = PeerMessage::FolderContentsRequest {
            token: 17,
            folder: "music\\album".into(),
        };
        let reply = PeerMessage::FolderContentsReply {
            token: 17,
            folder: "music\\album".into(),
            directories: vec![Directory {
                name: "music\\album".into(),
                files: vec![sample_file()],
            }],
        };
        assert_eq!(round_trip(request.clone()), request);
        assert_eq!(round_trip(reply.clone()), reply);
    }

    #[test]
    fn test_queue_messages_round_trip() {
        for msg in [
            PeerMessage::QueueDownload {
                filename: "x\\y.ogg".into(),
            },
            PeerMessage::PlaceInQueueRequest {
                filename: "x\\y.ogg".into(),
            },
            PeerMessage::PlaceInQueueReply {
                filename: "x\\y.ogg".into(),
                place: 4,
            },
            PeerMessage::UploadFailed {
                filename: "x\\y.ogg".into(),
            },
            PeerMessage::UploadDenied {
                filename: "x\\y.ogg".into(),
                reason: "Banned".into(),
            },
        ]
        .iter()
        {
            assert_eq!(&round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_user_info_round_trip() {
        let with_picture = PeerMessage::UserInfoReply(UserInfo {
            description: "hi".into(),
            picture: Some(vec![1, 2, 3]),
            total_uploads: 9,
            queue_length: 2,
            free_upload_slots: true,
        });
        let without_picture = PeerMessage::UserInfoReply(UserInfo {
            description: String::new(),
            picture: None,
            total_uploads: 0,
            queue_length: 0,
            free_upload_slots: false,
        });
        assert_eq!(round_trip(with_picture.clone()), with_picture);
        assert_eq!(round_trip(without_picture.clone()), without_picture);
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let payload = Bytes::from_static(&[1, 2, 3, 4]);
        let decoded =
            PeerMessage::decode(9999, payload.clone(), &caps()).unwrap();
        assert_eq!(
            decoded,
            PeerMessage::Unknown {
                code: 9999,
                payload
            }
        );
    }

    #[test]
    fn test_file_count_cap_aborts_parse() {
        let mut inner = BytesMut::new();
        inner.write_u32(1); // one directory
        inner.write_string("dir");
        inner.write_u32(u32::MAX); // absurd file count
        let payload = compress::deflate(&inner).unwrap();
        assert!(
            PeerMessage::decode(code::SHARES_REPLY, payload.into(), &caps())
                .is_err()
        );
    }

    #[test]
    fn test_distributed_round_trip() {
        let mut payload = BytesMut::new();
        payload.write_u32(0);
        payload.write_string("erin");
        payload.write_u32(31);
        payload.write_string("artist - title");
        let decoded =
            DistributedMessage::decode(dist_code::SEARCH_REQUEST, payload.freeze())
                .unwrap();
        assert_eq!(
            decoded,
            DistributedMessage::SearchRequest {
                username: "erin".into(),
                token: 31,
                query: "artist - title".into(),
            }
        );

        assert_eq!(
            DistributedMessage::decode(dist_code::PING, Bytes::new()).unwrap(),
            DistributedMessage::Ping
        );
    }

    #[test]
    fn test_full_filename_uses_backslash() {
        assert_eq!(full_filename("music\\album", "01.flac"), "music\\album\\01.flac");
    }
}
