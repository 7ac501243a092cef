//! The dual-framing codec of peer sockets.
//!
//! A peer connection speaks up to three framings on one socket: init
//! messages (`u32 length | u8 code`), peer control messages
//! (`u32 length | u32 code`) and distributed messages
//! (`u32 length | u8 code`). Which one applies to the next frame depends
//! on connection state the decoder carries: whether the init handshake has
//! completed and which channel type was negotiated.
//!
//! Bytes that cannot be a frame at all — a length field far beyond any
//! real message, or a control frame too short to hold its code — are
//! surfaced as [`PeerFrame::Raw`] instead of an error: they are in all
//! likelihood file bytes arriving around a raw-mode switch, and the
//! session moves them to the file-transfer buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::ConnectionType;

/// Frames longer than this cannot be real control messages; they are
/// almost certainly file bytes routed at the wrong layer.
pub(crate) const MAX_FRAME_LEN: usize = 100 * 1000 * 1000;

/// An item produced by the peer frame decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PeerFrame {
    /// An init handshake message.
    Init { code: u8, payload: Bytes },
    /// A peer control message.
    Message { code: u32, payload: Bytes },
    /// A distributed network message.
    Distributed { code: u8, payload: Bytes },
    /// Bytes that belong to the file-transfer buffer, not the framed
    /// stream.
    Raw(Bytes),
}

pub(crate) struct PeerCodec {
    /// The negotiated channel type; updated by the session once the peer's
    /// init message arrives.
    pub kind: ConnectionType,
    /// Set once either side's init message has been processed. Init codes
    /// are only recognized before this.
    pub handshake_complete: bool,
    /// The receive buffer cap; exceeding it is a protocol violation that
    /// tears the connection down.
    pub max_receive_buffer_bytes: usize,
}

impl PeerCodec {
    pub(crate) fn new(kind: ConnectionType, max_receive_buffer_bytes: usize) -> Self {
        Self {
            kind,
            handshake_complete: false,
            max_receive_buffer_bytes,
        }
    }
}

impl Decoder for PeerCodec {
    type Item = PeerFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PeerFrame>> {
        if src.len() > self.max_receive_buffer_bytes {
            return Err(Error::BufferOverflow);
        }

        loop {
            // the length prefix plus at least a 1-byte code
            if src.len() < 5 {
                return Ok(None);
            }

            let len =
                u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;

            if len == 0 {
                // an empty frame carries no code; skip it
                src.advance(4);
                continue;
            }

            if len > MAX_FRAME_LEN {
                // not a frame: hand everything buffered to the raw path
                log::warn!(
                    "Frame length {} exceeds cap, treating {} buffered bytes as raw",
                    len,
                    src.len()
                );
                return Ok(Some(PeerFrame::Raw(src.split().freeze())));
            }

            if src.len() < 4 + len {
                src.reserve(4 + len - src.len());
                return Ok(None);
            }

            let code_byte = src[4];
            if !self.handshake_complete && code_byte <= 1 {
                let mut frame = src.split_to(4 + len).freeze();
                frame.advance(4);
                let code = frame.get_u8();
                return Ok(Some(PeerFrame::Init {
                    code,
                    payload: frame,
                }));
            }

            if self.kind == ConnectionType::Distributed {
                let mut frame = src.split_to(4 + len).freeze();
                frame.advance(4);
                let code = frame.get_u8();
                return Ok(Some(PeerFrame::Distributed {
                    code,
                    payload: frame,
                }));
            }

            if len < 4 {
                // too short for a control code: these are file-transfer
                // bytes that raced the mode switch
                return Ok(Some(PeerFrame::Raw(src.split().freeze())));
            }

            let mut frame = src.split_to(4 + len).freeze();
            frame.advance(4);
            let code = frame.get_u32_le();
            return Ok(Some(PeerFrame::Message {
                code,
                payload: frame,
            }));
        }
    }
}

/// Frames are encoded by the message types themselves; the encoder only
/// copies the finished bytes out.
impl Encoder<Bytes> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(&frame);
        Ok(())
    }
}
