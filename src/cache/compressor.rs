//! Compression for the compressed tier.
//!
//! Pages are compressed whole with zstd. Decompression is told the size it
//! must produce; any other size means the in-memory bytes are corrupt.

use crate::config::CompressionConfig;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Decompressed {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// The compression engine used for Resident ↔ Compressed transitions.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Configured zstd level.
    pub fn level(&self) -> i32 {
        self.config.level
    }

    /// Compress a page buffer.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let compressed = zstd::encode_all(data, self.config.level)?;
        Ok(compressed)
    }

    /// Decompress a page buffer that must expand to exactly `expected_size` bytes.
    pub fn decompress(
        &self,
        data: &[u8],
        expected_size: usize,
    ) -> Result<Vec<u8>, CompressionError> {
        let decompressed = zstd::decode_all(data)?;
        if decompressed.len() != expected_size {
            return Err(CompressionError::SizeMismatch {
                expected: expected_size,
                actual: decompressed.len(),
            });
        }
        Ok(decompressed)
    }
}
