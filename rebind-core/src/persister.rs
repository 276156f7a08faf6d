/*!
Memento persister: the codec bound to a raw store.

The persister is what the persistence driver writes through and what the
rebind engine loads from. Write access can be revoked so that a node mirroring
another master's state can never write to the shared store.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::handler::PersistenceExceptionHandler;
use crate::memento::{BundleManifest, Memento, MementoCodec, ObjectKind};
use crate::store::{self, RawDataBundle, RawStore};
use crate::{PersistError, Result};

pub struct MementoPersister {
    store: Arc<dyn RawStore>,
    codec: MementoCodec,
    writable: AtomicBool,
}

impl MementoPersister {
    /// Create a writable persister over `store`
    ///
    /// # Arguments
    /// * `store` - The raw store holding the memento blobs
    /// * `codec` - Envelope codec used for every blob
    pub fn new(store: Arc<dyn RawStore>, codec: MementoCodec) -> Self {
        Self {
            store,
            codec,
            writable: AtomicBool::new(true),
        }
    }

    /// Build the store and codec selected by `config`
    ///
    /// # Errors
    /// * `PersistError::Validation` - If the storage configuration is invalid
    /// * `PersistError::Storage` - If the backing store cannot be opened
    pub fn from_config(config: &PersistenceConfig) -> Result<Self> {
        let store = store::create_store_from_config(&config.storage)?;
        info!(store = %store.describe(), compression = ?config.compression, "opened memento store");
        Ok(Self::new(store, MementoCodec::from_kind(config.compression)))
    }

    pub fn store(&self) -> &Arc<dyn RawStore> {
        &self.store
    }

    pub fn codec(&self) -> &MementoCodec {
        &self.codec
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    pub fn enable_write_access(&self) {
        if !self.writable.swap(true, Ordering::AcqRel) {
            debug!(store = %self.store.describe(), "write access enabled");
        }
    }

    pub fn disable_write_access(&self) {
        if self.writable.swap(false, Ordering::AcqRel) {
            debug!(store = %self.store.describe(), "write access disabled");
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.is_writable() {
            return Err(PersistError::invalid_state(format!(
                "write access to {} is disabled",
                self.store.describe()
            )));
        }
        Ok(())
    }

    /// Encode and write a memento, returning the number of bytes stored
    ///
    /// # Errors
    /// * `PersistError::InvalidState` - If write access is disabled
    /// * `PersistError::Compression` - If compression fails
    /// * `PersistError::Storage` - If the store rejects the write
    pub fn persist_memento(&self, memento: &Memento) -> Result<usize> {
        self.ensure_writable()?;
        let blob = self.codec.encode(memento)?;
        self.store.write(memento.kind(), memento.id(), &blob)?;
        Ok(blob.len())
    }

    /// Read and decode one memento
    ///
    /// # Errors
    /// * `PersistError::Storage` - If the blob cannot be read
    /// * `PersistError::InvalidFormat` - If the envelope is for another object or version
    /// * `PersistError::IntegrityCheckFailed` - If the content hash does not match
    pub fn load_memento(&self, kind: ObjectKind, id: &str) -> Result<Memento> {
        let blob = self.store.read(kind, id)?;
        self.codec.decode(kind, id, &blob)
    }

    /// Check that a stored blob decodes and passes its integrity check
    pub fn verify(&self, kind: ObjectKind, id: &str) -> Result<()> {
        self.load_memento(kind, id).map(|_| ())
    }

    pub fn delete(&self, kind: ObjectKind, id: &str) -> Result<()> {
        self.ensure_writable()?;
        self.store.delete(kind, id)
    }

    /// Read every blob and the manifest for a rebind pass
    pub fn load_bundle(&self) -> Result<RawDataBundle> {
        store::load_bundle(self.store.as_ref())
    }

    pub fn manifest(&self) -> Result<Option<BundleManifest>> {
        self.store
            .read_manifest()?
            .map(|data| BundleManifest::from_bytes(&data))
            .transpose()
    }

    pub fn write_manifest(&self, manifest: &BundleManifest) -> Result<()> {
        self.ensure_writable()?;
        self.store.write_manifest(&manifest.to_bytes()?)
    }

    /// Delete all persisted state
    pub fn clear(&self) -> Result<()> {
        self.ensure_writable()?;
        info!(store = %self.store.describe(), "clearing persisted state");
        self.store.clear()
    }
}

impl std::fmt::Debug for MementoPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MementoPersister")
            .field("store", &self.store.describe())
            .field("compression", &self.codec.compression())
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Holder for a persister that may be configured after its users start
#[derive(Debug, Clone, Default)]
pub struct PersisterSlot {
    inner: Arc<RwLock<Option<Arc<MementoPersister>>>>,
}

impl PersisterSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, persister: Arc<MementoPersister>) {
        *self.inner.write() = Some(persister);
    }

    pub fn get(&self) -> Option<Arc<MementoPersister>> {
        self.inner.read().clone()
    }

    /// The configured persister, or `InvalidState` if there is none yet
    pub fn require(&self) -> Result<Arc<MementoPersister>> {
        self.get()
            .ok_or_else(|| PersistError::invalid_state("no persistence store is configured"))
    }
}

/// Outcome of [`copy_state`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub copied: usize,
    pub failed: usize,
}

/// Copy every blob and the manifest from one store to another verbatim
///
/// Blobs are not decoded, so a copy preserves whatever compression and format
/// version the source holds. Unreadable or unwritable blobs are reported to
/// `handler`; an `Err` from the handler stops the copy.
pub fn copy_state(
    source: &dyn RawStore,
    target: &dyn RawStore,
    handler: &dyn PersistenceExceptionHandler,
) -> Result<CopySummary> {
    let mut summary = CopySummary::default();

    for kind in ObjectKind::ALL {
        let contents = source.read_all(kind)?;
        for failure in &contents.failures {
            summary.failed += 1;
            handler.on_raw_persist_failed(
                &format!("{}/{}", kind.dir_name(), failure.id),
                &failure.reason,
            )?;
        }
        for (id, data) in &contents.blobs {
            match target.write(kind, id, data) {
                Ok(()) => summary.copied += 1,
                Err(e) => {
                    summary.failed += 1;
                    handler.on_raw_persist_failed(&format!("{}/{id}", kind.dir_name()), &e.to_string())?;
                }
            }
        }
    }

    if let Some(manifest) = source.read_manifest()? {
        if let Err(e) = target.write_manifest(&manifest) {
            handler.on_raw_persist_failed("manifest", &e.to_string())?;
        }
    }
    handler.stop()?;

    info!(
        source = %source.describe(),
        target = %target.describe(),
        copied = summary.copied,
        failed = summary.failed,
        "copied persisted state"
    );
    Ok(summary)
}
