//! Payload compression using DEFLATE via `miniz_oxide`.
//!
//! Applied per channel when its policy is [`Compression::Deflate`]: only to
//! payloads above a minimum size, and only when the compressed output is
//! actually smaller (incompressible data goes out as-is with the
//! `compressed` flag cleared).

use log::{debug, warn};
use miniz_oxide::deflate::compress_to_vec;
use miniz_oxide::inflate::decompress_to_vec_with_limit;

use super::channel::Compression;
use super::events::Payload;
use crate::error::{BridgeError, Result};

/// Minimum payload size worth compressing (overhead outweighs benefit below).
const COMPRESS_THRESHOLD: usize = 128;

/// DEFLATE compression level (1-10, higher = better ratio, slower).
const COMPRESSION_LEVEL: u8 = 6;

/// Compress a payload using DEFLATE.
///
/// Returns `Some(compressed_bytes)` if compression is beneficial
/// (output < input), or `None` if compression should be skipped.
pub fn compress(input: &[u8]) -> Option<Vec<u8>> {
    if input.len() < COMPRESS_THRESHOLD {
        return None;
    }

    let compressed = compress_to_vec(input, COMPRESSION_LEVEL);

    if compressed.len() >= input.len() {
        return None;
    }

    Some(compressed)
}

/// Inflate a DEFLATE stream, refusing output larger than `max_len`.
pub fn decompress(input: &[u8], max_len: usize) -> Result<Vec<u8>> {
    decompress_to_vec_with_limit(input, max_len).map_err(|e| {
        warn!("decompress: DEFLATE error: {:?}", e.status);
        BridgeError::malformed(format!("bad compressed payload: {:?}", e.status))
    })
}

/// Wrap encoded message bytes for the wire under `policy`.
pub fn pack(encoded: Vec<u8>, policy: Compression) -> Payload {
    if policy == Compression::Deflate {
        if let Some(bytes) = compress(&encoded) {
            debug!("compress: {} -> {} bytes", encoded.len(), bytes.len());
            return Payload {
                bytes,
                compressed: true,
            };
        }
    }
    Payload::plain(encoded)
}

/// Recover encoded message bytes from an inbound payload.
pub fn unpack(payload: Payload, max_len: usize) -> Result<Vec<u8>> {
    if payload.compressed {
        decompress(&payload.bytes, max_len)
    } else {
        Ok(payload.bytes)
    }
}

// ── Tests ────────────────────────────────────────────────────
