//! Payload compression.
//!
//! Outbound frames are gzip-compressed when the [`CompressionDecision`] says
//! so; inbound binary frames are always gzip and are inflated up to a size
//! limit.

use std::fmt;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use thiserror::Error;

use crate::core::{DEFAULT_COMPRESSION_LEVEL, DEFAULT_COMPRESSION_THRESHOLD};

/// Errors from compression operations.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// Gzip compression failed.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// Gzip decompression failed.
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// Decompressed size exceeds safety limit.
    #[error("decompressed size exceeded limit: {size} > {limit}")]
    SizeExceeded {
        /// Bytes inflated before giving up.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },
}

/// Policy deciding whether an outbound payload is compressed.
///
/// Must be pure: it is consulted exactly once per transmitted packet.
pub trait CompressionDecision: Send + Sync + fmt::Debug {
    /// `encoded` is the serialized frame, `original` the call parameters.
    fn should_compress(&self, encoded: &[u8], original: &Value) -> bool;
}

/// Compress payloads whose encoded length exceeds a fixed threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeThreshold {
    threshold: usize,
}

impl SizeThreshold {
    /// Compress anything longer than `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Get the threshold.
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl Default for SizeThreshold {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl CompressionDecision for SizeThreshold {
    fn should_compress(&self, encoded: &[u8], _original: &Value) -> bool {
        encoded.len() > self.threshold
    }
}

/// Gzip compressor for frame payloads.
#[derive(Debug, Clone)]
pub struct Compressor {
    level: Compression,
}

impl Compressor {
    /// Create a compressor with the default gzip level.
    pub fn new() -> Self {
        Self {
            level: Compression::new(DEFAULT_COMPRESSION_LEVEL),
        }
    }

    /// Set compression level (0-9).
    pub fn set_level(&mut self, level: u32) {
        self.level = Compression::new(level.min(9));
    }

    /// Get compression level.
    pub fn level(&self) -> u32 {
        self.level.level()
    }

    /// Gzip `data`.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder
            .write_all(data)
            .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CompressionError::CompressionFailed(e.to_string()))
    }

    /// Gunzip `data`, refusing to inflate past `max_size` bytes.
    pub fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>, CompressionError> {
        let limit = u64::try_from(max_size).unwrap_or(u64::MAX).saturating_add(1);
        let mut decoder = GzDecoder::new(data).take(limit);

        let mut output = Vec::new();
        decoder
            .read_to_end(&mut output)
            .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

        if output.len() > max_size {
            return Err(CompressionError::SizeExceeded {
                size: output.len(),
                limit: max_size,
            });
        }

        Ok(output)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}
