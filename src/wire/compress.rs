//! Capped zlib compression for the message payloads the protocol mandates
//! compression for.
//!
//! Payloads are RFC 1950 streams. Inflation enforces both an absolute output
//! cap and a compression-ratio cap *while* decompressing, so a compression
//! bomb is refused after producing at most one spill chunk past the cap,
//! never after materializing the whole output.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// The decompressor's spill buffer size. One protocol message rarely
/// inflates in fewer than a handful of these.
const INFLATE_CHUNK_LEN: usize = 64 * 1024;

/// Compresses a payload into a zlib stream.
pub fn deflate(input: &[u8]) -> Result<Vec<u8>> {
    let mut encoder =
        ZlibEncoder::new(Vec::with_capacity(input.len() / 2), Compression::default());
    encoder.write_all(input)?;
    Ok(encoder.finish()?)
}

/// Decompresses a zlib stream, enforcing the safety caps during decode.
///
/// Fails with [`Error::DecompressionFailed`] if the stream is corrupt or
/// truncated, if the output would exceed `max_out` bytes, or if the
/// decompressed-to-compressed ratio exceeds `max_ratio`.
pub fn inflate(input: &[u8], max_out: usize, max_ratio: u64) -> Result<Vec<u8>> {
    let mut decoder = Decompress::new(true);
    let mut out = Vec::new();
    let mut chunk = [0u8; INFLATE_CHUNK_LEN];

    loop {
        let consumed = decoder.total_in() as usize;
        if consumed > input.len() {
            return Err(Error::DecompressionFailed("corrupt stream"));
        }
        let before_in = decoder.total_in();
        let before_out = decoder.total_out();

        let status = decoder
            .decompress(&input[consumed..], &mut chunk, FlushDecompress::None)
            .map_err(|_| Error::DecompressionFailed("corrupt stream"))?;

        let produced = (decoder.total_out() - before_out) as usize;
        out.extend_from_slice(&chunk[..produced]);

        if out.len() > max_out {
            return Err(Error::DecompressionFailed("output size cap exceeded"));
        }
        if decoder.total_out() > max_ratio.saturating_mul(decoder.total_in().max(1)) {
            return Err(Error::DecompressionFailed("compression ratio cap exceeded"));
        }

        match status {
            Status::StreamEnd => return Ok(out),
            Status::Ok | Status::BufError => {
                // neither consumed nor produced anything: the input ran out
                // before the stream ended
                if produced == 0 && decoder.total_in() == before_in {
                    return Err(Error::DecompressionFailed("truncated stream"));
                }
            }
        }
    }
}
