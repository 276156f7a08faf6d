/*!
Raw store adapters for memento blobs.

The store is a durable key/value blob store keyed by (object kind, id), with one
namespace per kind plus a small manifest. This module defines the port
([`RawStore`]) and the [`RawDataBundle`] exchanged with it; the adapters live in
the submodules.
*/

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use rebind_retry::RetryError;
use tracing::{debug, warn};

use crate::config::{StorageBackend, StorageConfig};
use crate::memento::{BundleManifest, ObjectKind};
use crate::{PersistError, Result};

pub use local::LocalFileStore;
pub use memory::MemoryStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

/// A blob that was listed but could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReadFailure {
    pub kind: ObjectKind,
    pub id: String,
    pub reason: String,
}

/// Everything stored under one kind namespace.
#[derive(Debug, Clone, Default)]
pub struct KindContents {
    pub blobs: BTreeMap<String, Bytes>,
    pub failures: Vec<BlobReadFailure>,
}

/// Storage port for memento blobs
///
/// Reads happen on the rebind thread and writes on the persistence worker, so
/// implementations must be shareable across threads.
#[cfg_attr(test, mockall::automock)]
pub trait RawStore: Send + Sync {
    /// Human readable location of the store, for logs
    fn describe(&self) -> String;

    /// Ids present under a kind namespace
    fn list_ids(&self, kind: ObjectKind) -> Result<Vec<String>>;

    fn read(&self, kind: ObjectKind, id: &str) -> Result<Bytes>;

    /// Create or replace the blob for `(kind, id)`
    fn write(&self, kind: ObjectKind, id: &str, data: &[u8]) -> Result<()>;

    /// Remove the blob for `(kind, id)`; removing an absent blob is not an error
    fn delete(&self, kind: ObjectKind, id: &str) -> Result<()>;

    fn read_manifest(&self) -> Result<Option<Vec<u8>>>;

    fn write_manifest(&self, data: &[u8]) -> Result<()>;

    /// Read every blob of a kind. A blob that cannot be read is reported in
    /// [`KindContents::failures`] and does not prevent reading the rest.
    fn read_all(&self, kind: ObjectKind) -> Result<KindContents> {
        read_all_tolerant(self, kind)
    }

    /// Delete every memento blob. Adapters that can also drop the manifest do so.
    fn clear(&self) -> Result<()> {
        for kind in ObjectKind::ALL {
            for id in self.list_ids(kind)? {
                self.delete(kind, &id)?;
            }
        }
        Ok(())
    }
}

/// Read every listed blob of `kind` one by one, recording unreadable blobs
/// instead of failing.
pub fn read_all_tolerant<S: RawStore + ?Sized>(store: &S, kind: ObjectKind) -> Result<KindContents> {
    let mut contents = KindContents::default();
    for id in store.list_ids(kind)? {
        match store.read(kind, &id) {
            Ok(data) => {
                contents.blobs.insert(id, data);
            }
            Err(e) => {
                warn!(kind = kind.as_str(), id = %id, error = %e, "unreadable memento blob");
                contents.failures.push(BlobReadFailure {
                    kind,
                    id,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(contents)
}

/// The per-kind map of id to serialized memento consumed by one rebind.
#[derive(Debug, Clone, Default)]
pub struct RawDataBundle {
    pub manifest: Option<BundleManifest>,
    blobs: BTreeMap<ObjectKind, BTreeMap<String, Bytes>>,
    read_failures: Vec<BlobReadFailure>,
}

impl RawDataBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: ObjectKind, id: impl Into<String>, data: impl Into<Bytes>) {
        self.blobs
            .entry(kind)
            .or_default()
            .insert(id.into(), data.into());
    }

    pub fn remove(&mut self, kind: ObjectKind, id: &str) -> Option<Bytes> {
        self.blobs.get_mut(&kind)?.remove(id)
    }

    pub fn get(&self, kind: ObjectKind, id: &str) -> Option<&Bytes> {
        self.blobs.get(&kind)?.get(id)
    }

    /// Blobs of one kind, in stable id order
    pub fn blobs(&self, kind: ObjectKind) -> impl Iterator<Item = (&String, &Bytes)> {
        self.blobs.get(&kind).into_iter().flat_map(|m| m.iter())
    }

    pub fn len(&self, kind: ObjectKind) -> usize {
        self.blobs.get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn total(&self) -> usize {
        self.blobs.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0 && self.read_failures.is_empty()
    }

    pub fn read_failures(&self) -> &[BlobReadFailure] {
        &self.read_failures
    }
}

/// Read the manifest and every kind namespace into one bundle.
pub fn load_bundle(store: &dyn RawStore) -> Result<RawDataBundle> {
    let mut bundle = RawDataBundle::new();

    bundle.manifest = match store.read_manifest() {
        Ok(Some(data)) => match BundleManifest::from_bytes(&data) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(store = %store.describe(), error = %e, "ignoring unreadable bundle manifest");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(store = %store.describe(), error = %e, "failed to read bundle manifest");
            None
        }
    };

    for kind in ObjectKind::ALL {
        let contents = store.read_all(kind)?;
        bundle.blobs.insert(kind, contents.blobs);
        bundle.read_failures.extend(contents.failures);
    }

    debug!(
        store = %store.describe(),
        blobs = bundle.total(),
        failures = bundle.read_failures.len(),
        "loaded raw data bundle"
    );
    Ok(bundle)
}

/// Build the store selected by `config`.
pub fn create_store_from_config(config: &StorageConfig) -> Result<Arc<dyn RawStore>> {
    config.validate()?;

    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Local => {
            let base = config
                .local_base_path
                .as_ref()
                .ok_or_else(|| PersistError::validation("Local backend requires a base path"))?;
            Ok(Arc::new(LocalFileStore::new(base)?))
        }
        StorageBackend::S3 => {
            #[cfg(feature = "s3")]
            {
                let bucket = config.s3_bucket.clone().unwrap_or_default();
                Ok(Arc::new(S3Store::new(
                    bucket,
                    config.s3_prefix.clone(),
                    config.s3_region.clone(),
                )?))
            }
            #[cfg(not(feature = "s3"))]
            {
                Err(PersistError::validation(
                    "S3 backend requested but rebind-core was built without the `s3` feature",
                ))
            }
        }
    }
}

/// Ids become file names and object keys, so they must be a single safe path
/// segment.
pub fn validate_id(id: &str) -> Result<()> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\', '\0'])
        || id.len() > 255;
    if bad {
        return Err(PersistError::validation(format!("Invalid memento id: {id:?}")));
    }
    Ok(())
}

pub(crate) fn from_retry(err: RetryError) -> PersistError {
    PersistError::storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("abc-123_X").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../escape").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id(".tmpXYZ").is_err());
    }

    #[test]
    fn test_default_read_all_tolerates_single_failure() {
        let mut store = MockRawStore::new();
        store
            .expect_list_ids()
            .returning(|_| Ok(vec!["good".to_string(), "bad".to_string()]));
        store.expect_read().returning(|_, id| {
            if id == "bad" {
                Err(PersistError::storage("checksum mismatch"))
            } else {
                Ok(Bytes::from_static(b"{}"))
            }
        });

        let contents = read_all_tolerant(&store, ObjectKind::Entity).unwrap();
        assert_eq!(contents.blobs.len(), 1);
        assert_eq!(contents.failures.len(), 1);
        assert_eq!(contents.failures[0].id, "bad");
    }

    #[test]
    fn test_load_bundle_collects_kinds_and_manifest() {
        let store = MemoryStore::new();
        store.write(ObjectKind::Entity, "e1", b"one").unwrap();
        store.write(ObjectKind::Location, "l1", b"two").unwrap();
        store
            .write_manifest(&BundleManifest::new("node-a").to_bytes().unwrap())
            .unwrap();

        let bundle = load_bundle(&store).unwrap();
        assert_eq!(bundle.total(), 2);
        assert_eq!(bundle.len(ObjectKind::Entity), 1);
        assert_eq!(bundle.manifest.unwrap().writer_node_id, "node-a");
    }

    #[test]
    fn test_load_bundle_ignores_corrupt_manifest() {
        let store = MemoryStore::new();
        store.write_manifest(b"not json").unwrap();

        let bundle = load_bundle(&store).unwrap();
        assert!(bundle.manifest.is_none());
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_create_store_from_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = create_store_from_config(&StorageConfig::local(dir.path())).unwrap();
        assert!(store.describe().contains(&dir.path().display().to_string()));

        assert!(create_store_from_config(&StorageConfig::memory()).is_ok());
    }
}
