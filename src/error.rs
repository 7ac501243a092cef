//! The error taxonomy observable at the engine boundary.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An operation was attempted while the connection was in neither the
    /// connected nor the handshaking state.
    #[error("not connected")]
    NotConnected,

    /// The remote end closed the connection, or the operation was cancelled
    /// by a local disconnect.
    #[error("connection closed")]
    ConnectionClosed,

    /// An admission-time rejection of a nonsensical port.
    #[error("invalid port {0}")]
    InvalidPort(u32),

    /// An admission-time rejection of a loopback, multicast, broadcast,
    /// unspecified or reserved address.
    #[error("invalid address {0}")]
    InvalidAddress(IpAddr),

    /// A connect or raw-receive deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// The init handshake bytes were malformed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),

    /// A compressed payload hit the safety caps or the stream is corrupt.
    #[error("decompression failed: {0}")]
    DecompressionFailed(&'static str),

    /// A receive buffer exceeded its configured cap.
    #[error("receive buffer overflow")]
    BufferOverflow,

    /// An inbound connection was rejected by the per-IP rate limiter.
    #[error("rate limited")]
    RateLimited,

    /// An inbound connection was rejected by the per-IP connection cap.
    #[error("per-IP connection limit reached")]
    PerIpLimit,

    /// A connection was rejected by the global connection cap.
    #[error("global connection limit reached")]
    GlobalLimit,

    /// A frame or payload could not be decoded.
    #[error("malformed message: {0}")]
    InvalidMessage(&'static str),

    /// The engine component servicing this request has shut down.
    #[error("engine channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error terminates its connection, as opposed to being
    /// recovered locally or reported synchronously to the caller.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::DecompressionFailed(_)
                | Error::RateLimited
                | Error::PerIpLimit
                | Error::GlobalLimit
                | Error::InvalidPort(_)
                | Error::InvalidAddress(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

/// Whether an IO error on a socket that is still waiting to become ready is
/// definitive, i.e. there is no point in keeping the attempt pending.
///
/// Anything else (interrupts, transient resource shortage) leaves the
/// attempt pending.
pub(crate) fn is_definitive(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::OutOfMemory
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::HostUnreachable
    )
}
