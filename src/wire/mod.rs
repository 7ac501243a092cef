//! Binary wire codec primitives shared by the server, init, peer-control
//! and distributed message encodings.
//!
//! All integers on the wire are little-endian. Strings are a `u32` byte
//! length followed by that many bytes of UTF-8, with no terminator. Path
//! separators inside protocol strings are backslashes regardless of
//! platform.

pub mod compress;
pub mod peer;
pub mod server;

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Checked decoding of wire primitives over any [`Buf`].
///
/// The unchecked `bytes` getters panic on underflow; messages come from the
/// network, so every read here verifies the remaining length first and
/// surfaces truncation as a decode error.
pub trait WireRead: Buf {
    fn read_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(Error::InvalidMessage("truncated u8"));
        }
        Ok(self.get_u8())
    }

    fn read_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(Error::InvalidMessage("truncated u32"));
        }
        Ok(self.get_u32_le())
    }

    fn read_u64(&mut self) -> Result<u64> {
        if self.remaining() < 8 {
            return Err(Error::InvalidMessage("truncated u64"));
        }
        Ok(self.get_u64_le())
    }

    /// A wire bool is a single byte; anything nonzero is true.
    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a length-prefixed string.
    ///
    /// Invalid UTF-8 is replaced rather than rejected: some clients on the
    /// network send filenames in legacy encodings and a lossy decode keeps
    /// the rest of the message usable.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if self.remaining() < len {
            return Err(Error::InvalidMessage("truncated string"));
        }
        let bytes = self.copy_to_bytes(len);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl<B: Buf> WireRead for B {}

/// Encoding of wire primitives over any [`BufMut`].
pub trait WireWrite: BufMut {
    fn write_u8(&mut self, v: u8) {
        self.put_u8(v);
    }

    fn write_u32(&mut self, v: u32) {
        self.put_u32_le(v);
    }

    fn write_u64(&mut self, v: u64) {
        self.put_u64_le(v);
    }

    fn write_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    fn write_string(&mut self, s: &str) {
        self.put_u32_le(s.len() as u32);
        self.put_slice(s.as_bytes());
    }
}

impl<B: BufMut> WireWrite for B {}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let mut buf = BytesMut::new();
        buf.write_u8(0xab);
        buf.write_u32(0xdead_beef);
        buf.write_u64(0x0102_0304_0506_0708);
        buf.write_bool(true);
        buf.write_string("alice");

        let mut buf = buf.freeze();
        assert_eq!(buf.read_u8().unwrap(), 0xab);
        assert_eq!(buf.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(buf.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(buf.read_bool().unwrap(), true);
        assert_eq!(buf.read_string().unwrap(), "alice");
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_strings_are_little_endian_length_prefixed() {
        let mut buf = BytesMut::new();
        buf.write_string("alice");
        assert_eq!(
            &buf[..],
            &[0x05, 0x00, 0x00, 0x00, b'a', b'l', b'i', b'c', b'e']
        );
    }

    #[test]
    fn test_truncated_reads_are_errors() {
        let mut buf = Bytes::from_static(&[0x01, 0x02]);
        assert!(buf.read_u32().is_err());

        // a string length prefix promising more bytes than available
        let mut buf = Bytes::from_static(&[0x0a, 0x00, 0x00, 0x00, b'a']);
        assert!(buf.read_string().is_err());
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_rejected() {
        let mut buf = BytesMut::new();
        buf.write_u32(2);
        buf.put_slice(&[0xff, 0xfe]);
        let s = buf.freeze().read_string().unwrap();
        assert_eq!(s.chars().count(), 2);
    }
}
