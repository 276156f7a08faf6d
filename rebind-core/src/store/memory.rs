/*!
In-memory raw store, for tests and embedded use.
*/

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use super::{validate_id, RawStore};
use crate::memento::ObjectKind;
use crate::{PersistError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    blobs: HashMap<ObjectKind, BTreeMap<String, Bytes>>,
    manifest: Option<Vec<u8>>,
    failing_ids: HashSet<String>,
    write_count: u64,
}

/// Raw store held in process memory
///
/// Clones share the same contents, so a test can keep a handle to the store
/// it hands to a persister.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes verbatim, bypassing id checks (used to plant corrupt blobs)
    pub fn put_raw(&self, kind: ObjectKind, id: &str, data: impl Into<Bytes>) {
        self.state
            .write()
            .blobs
            .entry(kind)
            .or_default()
            .insert(id.to_string(), data.into());
    }

    /// Make every subsequent write or delete of `id` fail
    pub fn fail_writes_for(&self, id: &str) {
        self.state.write().failing_ids.insert(id.to_string());
    }

    pub fn contains(&self, kind: ObjectKind, id: &str) -> bool {
        self.state
            .read()
            .blobs
            .get(&kind)
            .is_some_and(|m| m.contains_key(id))
    }

    pub fn count(&self, kind: ObjectKind) -> usize {
        self.state.read().blobs.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Number of successful blob writes so far
    pub fn write_count(&self) -> u64 {
        self.state.read().write_count
    }

    fn check_writable(state: &MemoryState, id: &str) -> Result<()> {
        if state.failing_ids.contains(id) {
            return Err(PersistError::storage(format!("simulated write failure for {id}")));
        }
        Ok(())
    }
}

impl RawStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn list_ids(&self, kind: ObjectKind) -> Result<Vec<String>> {
        Ok(self
            .state
            .read()
            .blobs
            .get(&kind)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn read(&self, kind: ObjectKind, id: &str) -> Result<Bytes> {
        self.state
            .read()
            .blobs
            .get(&kind)
            .and_then(|m| m.get(id).cloned())
            .ok_or_else(|| PersistError::storage(format!("No {kind} blob with id {id}")))
    }

    fn write(&self, kind: ObjectKind, id: &str, data: &[u8]) -> Result<()> {
        validate_id(id)?;
        let mut state = self.state.write();
        Self::check_writable(&state, id)?;
        state
            .blobs
            .entry(kind)
            .or_default()
            .insert(id.to_string(), Bytes::copy_from_slice(data));
        state.write_count += 1;
        Ok(())
    }

    fn delete(&self, kind: ObjectKind, id: &str) -> Result<()> {
        let mut state = self.state.write();
        Self::check_writable(&state, id)?;
        if let Some(m) = state.blobs.get_mut(&kind) {
            m.remove(id);
        }
        Ok(())
    }

    fn read_manifest(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().manifest.clone())
    }

    fn write_manifest(&self, data: &[u8]) -> Result<()> {
        self.state.write().manifest = Some(data.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        state.blobs.clear();
        state.manifest = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_contents() {
        let store = MemoryStore::new();
        let handle = store.clone();

        store.write(ObjectKind::Entity, "e1", b"data").unwrap();
        assert!(handle.contains(ObjectKind::Entity, "e1"));
        assert_eq!(handle.read(ObjectKind::Entity, "e1").unwrap(), Bytes::from_static(b"data"));
        assert_eq!(handle.write_count(), 1);
    }

    #[test]
    fn test_delete_absent_is_ok() {
        let store = MemoryStore::new();
        assert!(store.delete(ObjectKind::Feed, "missing").is_ok());
    }

    #[test]
    fn test_simulated_failures() {
        let store = MemoryStore::new();
        store.fail_writes_for("e1");
        assert!(store.write(ObjectKind::Entity, "e1", b"x").is_err());
        assert!(store.write(ObjectKind::Entity, "e2", b"x").is_ok());
    }

    #[test]
    fn test_clear_drops_manifest() {
        let store = MemoryStore::new();
        store.write(ObjectKind::Location, "l1", b"x").unwrap();
        store.write_manifest(b"{}").unwrap();

        store.clear().unwrap();
        assert_eq!(store.count(ObjectKind::Location), 0);
        assert!(store.read_manifest().unwrap().is_none());
    }
}
