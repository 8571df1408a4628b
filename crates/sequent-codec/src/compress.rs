//! Payload compression, applied before encryption when both are configured.

use std::io::Write;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::CodecError;

/// Compression of serialized payloads.
pub trait Compressor: Send + Sync {
    /// Compress payload bytes.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Reverse [`Compressor::compress`].
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Zlib (deflate) compressor.
pub struct ZlibCompressor {
    level: Compression,
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self::new(6)
    }
}

impl ZlibCompressor {
    /// Create a compressor with an explicit level (0–9).
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| CodecError::Serialization(format!("compression failed: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut decoder = ZlibDecoder::new(Vec::new());
        decoder
            .write_all(data)
            .and_then(|_| decoder.finish())
            .map_err(|e| CodecError::Integrity(format!("decompression failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let compressor = ZlibCompressor::default();
        let data = b"abcabcabcabcabcabcabcabcabcabc".repeat(20);
        let packed = compressor.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(compressor.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn garbage_is_rejected() {
        let compressor = ZlibCompressor::default();
        match compressor.decompress(b"definitely not zlib") {
            Err(CodecError::Integrity(_)) => {}
            other => panic!("expected Integrity, got {other:?}"),
        }
    }
}
