//! Bundle-level metadata stored beside the per-kind namespaces.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ObjectKind, MEMENTO_FORMAT_VERSION};
use crate::Result;

/// Written on every flush; read by the CLI and logged at rebind start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub format_version: u32,
    pub last_written: DateTime<Utc>,
    pub writer_node_id: String,
    /// Unique id of the flush that produced this manifest.
    pub write_id: Uuid,
    /// Number of blobs per kind after the flush, keyed by `ObjectKind::as_str`.
    #[serde(default)]
    pub counts: BTreeMap<String, usize>,
}

impl BundleManifest {
    pub fn new(writer_node_id: impl Into<String>) -> Self {
        Self {
            format_version: MEMENTO_FORMAT_VERSION,
            last_written: Utc::now(),
            writer_node_id: writer_node_id.into(),
            write_id: Uuid::new_v4(),
            counts: BTreeMap::new(),
        }
    }

    pub fn with_count(mut self, kind: ObjectKind, count: usize) -> Self {
        self.counts.insert(kind.as_str().to_string(), count);
        self
    }

    pub fn count(&self, kind: ObjectKind) -> usize {
        self.counts.get(kind.as_str()).copied().unwrap_or(0)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_bytes_round_trip() {
        let manifest = BundleManifest::new("node-a")
            .with_count(ObjectKind::Entity, 4)
            .with_count(ObjectKind::Location, 1);

        let back = BundleManifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(back, manifest);
        assert_eq!(back.count(ObjectKind::Entity), 4);
        assert_eq!(back.count(ObjectKind::Feed), 0);
    }

    #[test]
    fn test_each_manifest_has_fresh_write_id() {
        let first = BundleManifest::new("node-a");
        let second = BundleManifest::new("node-a");
        assert_ne!(first.write_id, second.write_id);
    }
}
