/*!
Blob codec for mementos.

Each blob is a JSON envelope holding the memento body together with its kind,
id, format version and a SHA-256 hash of the normalized body, optionally
gzip-compressed. Decoding checks every one of these so that a corrupt or
misplaced blob surfaces as a load failure for that id alone.
*/

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Memento, ObjectKind};
use crate::compression::{decompress_auto, CompressionAdapter, CompressionKind, GzipCompressor};
use crate::{PersistError, Result};

/// Current blob format version
pub const MEMENTO_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct MementoEnvelope {
    format_version: u32,
    kind: ObjectKind,
    id: String,
    content_hash: String,
    memento: serde_json::Value,
}

fn content_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// Encodes mementos into blobs and decodes them back.
pub struct MementoCodec {
    compressor: Box<dyn CompressionAdapter>,
}

impl MementoCodec {
    pub fn new(compressor: Box<dyn CompressionAdapter>) -> Self {
        Self { compressor }
    }

    pub fn from_kind(kind: CompressionKind) -> Self {
        Self::new(kind.adapter())
    }

    pub fn uncompressed() -> Self {
        Self::from_kind(CompressionKind::None)
    }

    pub fn compression(&self) -> &str {
        self.compressor.algorithm_name()
    }

    /// Serialize a memento into a blob.
    pub fn encode(&self, memento: &Memento) -> Result<Bytes> {
        let body = memento.to_value()?;
        let normalized = serde_json::to_vec(&body)?;

        let envelope = MementoEnvelope {
            format_version: MEMENTO_FORMAT_VERSION,
            kind: memento.kind(),
            id: memento.id().to_string(),
            content_hash: content_hash(&normalized),
            memento: body,
        };

        let json = serde_json::to_vec(&envelope)?;
        Ok(Bytes::from(self.compressor.compress(&json)?))
    }

    /// Decode a blob that was stored under `(kind, id)`.
    pub fn decode(&self, kind: ObjectKind, id: &str, blob: &[u8]) -> Result<Memento> {
        let memento = self.decode_unchecked(blob)?;

        if memento.kind() != kind {
            return Err(PersistError::invalid_format(format!(
                "blob stored as {kind} holds a {} memento",
                memento.kind()
            )));
        }
        if memento.id() != id {
            return Err(PersistError::invalid_format(format!(
                "blob stored under id {id} holds memento {}",
                memento.id()
            )));
        }
        Ok(memento)
    }

    /// Decode and verify a blob without checking where it was stored.
    pub fn decode_unchecked(&self, blob: &[u8]) -> Result<Memento> {
        let json = decompress_auto(blob)?;
        let envelope: MementoEnvelope = serde_json::from_slice(&json)?;

        if envelope.format_version > MEMENTO_FORMAT_VERSION {
            return Err(PersistError::invalid_format(format!(
                "Incompatible memento format version: {} (current: {})",
                envelope.format_version, MEMENTO_FORMAT_VERSION
            )));
        }

        let actual = content_hash(&serde_json::to_vec(&envelope.memento)?);
        if actual != envelope.content_hash {
            return Err(PersistError::IntegrityCheckFailed {
                expected: envelope.content_hash,
                actual,
            });
        }

        let memento = Memento::from_value(envelope.kind, envelope.memento)?;
        if memento.id() != envelope.id {
            return Err(PersistError::invalid_format(format!(
                "envelope id {} does not match memento id {}",
                envelope.id,
                memento.id()
            )));
        }
        Ok(memento)
    }
}

impl Default for MementoCodec {
    fn default() -> Self {
        Self::new(Box::new(GzipCompressor::fast()))
    }
}
