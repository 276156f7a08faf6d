/*!
Compression adapters for memento blobs.

Blobs are gzip-compressed by default. Decoding sniffs the gzip magic bytes, so a
store may hold a mix of compressed and uncompressed blobs (for example after
the compression setting was changed between runs).
*/

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::{PersistError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression abstraction for memento blobs
///
/// Implementations are shared between the persistence worker and rebind
/// threads, hence `Send + Sync`.
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Compression selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    Gzip,
    None,
}

impl CompressionKind {
    pub fn adapter(&self) -> Box<dyn CompressionAdapter> {
        match self {
            CompressionKind::Gzip => Box::new(GzipCompressor::new()),
            CompressionKind::None => Box::new(NoCompression),
        }
    }
}

/// Whether `data` starts with the gzip magic number.
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

/// Decompress `data` if it is gzip, otherwise return it unchanged.
pub fn decompress_auto(data: &[u8]) -> Result<Vec<u8>> {
    if is_gzip(data) {
        GzipCompressor::new().decompress(data)
    } else {
        Ok(data.to_vec())
    }
}

/// Gzip compression adapter
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level),
        }
    }

    /// Fast compression (level 1), used for the frequent incremental flushes
    pub fn fast() -> Self {
        Self::with_level(1)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            PersistError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| PersistError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| PersistError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Pass-through adapter, handy when inspecting a store by hand
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_compression_roundtrip() {
        let compressor = GzipCompressor::new();
        let original_data = br#"{"id":"e1","type":"web.Server","config":{}}"#.repeat(10);

        let compressed = compressor.compress(&original_data).unwrap();
        assert!(compressed.len() < original_data.len());
        assert!(is_gzip(&compressed));

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(original_data, decompressed);
    }

    #[test]
    fn test_decompress_auto_handles_both() {
        let raw = b"{\"plain\":true}".to_vec();
        assert_eq!(decompress_auto(&raw).unwrap(), raw);

        let compressed = GzipCompressor::fast().compress(&raw).unwrap();
        assert_eq!(decompress_auto(&compressed).unwrap(), raw);
    }

    #[test]
    fn test_kind_selects_adapter() {
        assert_eq!(CompressionKind::Gzip.adapter().algorithm_name(), "gzip");
        assert_eq!(CompressionKind::None.adapter().algorithm_name(), "none");
        assert_eq!(CompressionKind::default(), CompressionKind::Gzip);
    }

    #[test]
    fn test_gzip_invalid_compressed_data() {
        let compressor = GzipCompressor::new();
        let invalid_data = [0x1f, 0x8b, 0x00, 0x01, 0x02];

        assert!(compressor.decompress(&invalid_data).is_err());
        assert!(decompress_auto(&invalid_data).is_err());
    }
}
