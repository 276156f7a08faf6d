/*!
Local filesystem raw store.

Layout under the base directory:

```text
<base>/manifest.json
<base>/entities/<id>
<base>/locations/<id>
...
```

Writes go to a temporary file in the target directory which is then renamed
over the blob, so a crash mid-write never leaves a truncated memento behind.
*/

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use rebind_retry::{classify, local_store_backoff_policy, retry_blocking};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{from_retry, validate_id, RawStore};
use crate::memento::ObjectKind;
use crate::{PersistError, Result};

const MANIFEST_FILE: &str = "manifest.json";

/// Raw store backed by one directory per object kind
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    base_dir: PathBuf,
}

impl LocalFileStore {
    /// Open (creating if necessary) a store rooted at `base_dir`
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| {
            PersistError::storage(format!(
                "Failed to create store directory {}: {e}",
                base_dir.display()
            ))
        })?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn kind_dir(&self, kind: ObjectKind) -> PathBuf {
        self.base_dir.join(kind.dir_name())
    }

    fn blob_path(&self, kind: ObjectKind, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.kind_dir(kind).join(id))
    }

    fn write_atomic(dir: &Path, target: &Path, data: &[u8]) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_data()?;
        tmp.persist(target).map_err(|e| e.error)?;
        Ok(())
    }
}

impl RawStore for LocalFileStore {
    fn describe(&self) -> String {
        format!("file://{}", self.base_dir.display())
    }

    fn list_ids(&self, kind: ObjectKind) -> Result<Vec<String>> {
        let dir = self.kind_dir(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PersistError::storage(format!(
                    "Failed to list {}: {e}",
                    dir.display()
                )))
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Temporary files from an interrupted write start with a dot.
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn read(&self, kind: ObjectKind, id: &str) -> Result<Bytes> {
        let path = self.blob_path(kind, id)?;
        let data = retry_blocking("read_blob", local_store_backoff_policy(), |_| {
            fs::read(&path).map_err(|e| classify("read_blob", e))
        })
        .map_err(from_retry)?;
        Ok(Bytes::from(data))
    }

    fn write(&self, kind: ObjectKind, id: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(kind, id)?;
        let dir = self.kind_dir(kind);
        retry_blocking("write_blob", local_store_backoff_policy(), |_| {
            Self::write_atomic(&dir, &path, data).map_err(|e| classify("write_blob", e))
        })
        .map_err(from_retry)?;
        debug!(kind = kind.as_str(), id, size = data.len(), "wrote memento blob");
        Ok(())
    }

    fn delete(&self, kind: ObjectKind, id: &str) -> Result<()> {
        let path = self.blob_path(kind, id)?;
        retry_blocking("delete_blob", local_store_backoff_policy(), |_| {
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(classify("delete_blob", e)),
            }
        })
        .map_err(from_retry)
    }

    fn read_manifest(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(self.base_dir.join(MANIFEST_FILE)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistError::storage(format!("Failed to read manifest: {e}"))),
        }
    }

    fn write_manifest(&self, data: &[u8]) -> Result<()> {
        let target = self.base_dir.join(MANIFEST_FILE);
        retry_blocking("write_manifest", local_store_backoff_policy(), |_| {
            Self::write_atomic(&self.base_dir, &target, data)
                .map_err(|e| classify("write_manifest", e))
        })
        .map_err(from_retry)
    }

    fn clear(&self) -> Result<()> {
        for kind in ObjectKind::ALL {
            match fs::remove_dir_all(self.kind_dir(kind)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(PersistError::storage(format!(
                        "Failed to clear {} namespace: {e}",
                        kind.dir_name()
                    )))
                }
            }
        }
        match fs::remove_file(self.base_dir.join(MANIFEST_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistError::storage(format!("Failed to remove manifest: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path()).unwrap();

        store.write(ObjectKind::Entity, "e1", b"blob one").unwrap();
        assert!(temp_dir.path().join("entities").join("e1").exists());

        assert_eq!(store.list_ids(ObjectKind::Entity).unwrap(), vec!["e1"]);
        assert_eq!(store.read(ObjectKind::Entity, "e1").unwrap(), Bytes::from_static(b"blob one"));

        store.write(ObjectKind::Entity, "e1", b"blob two").unwrap();
        assert_eq!(store.read(ObjectKind::Entity, "e1").unwrap(), Bytes::from_static(b"blob two"));

        store.delete(ObjectKind::Entity, "e1").unwrap();
        assert!(store.list_ids(ObjectKind::Entity).unwrap().is_empty());
        store.delete(ObjectKind::Entity, "e1").unwrap();
    }

    #[test]
    fn test_list_missing_namespace_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path()).unwrap();
        assert!(store.list_ids(ObjectKind::Feed).unwrap().is_empty());
    }

    #[test]
    fn test_list_skips_temporary_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path()).unwrap();
        store.write(ObjectKind::Policy, "p1", b"x").unwrap();
        fs::write(temp_dir.path().join("policies").join(".tmpABC"), b"partial").unwrap();

        assert_eq!(store.list_ids(ObjectKind::Policy).unwrap(), vec!["p1"]);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path()).unwrap();
        assert!(store.write(ObjectKind::Entity, "../outside", b"x").is_err());
    }

    #[test]
    fn test_manifest_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::new(temp_dir.path()).unwrap();
        assert!(store.read_manifest().unwrap().is_none());

        store.write_manifest(b"{\"v\":1}").unwrap();
        store.write(ObjectKind::Location, "l1", b"x").unwrap();
        assert_eq!(store.read_manifest().unwrap().unwrap(), b"{\"v\":1}");

        store.clear().unwrap();
        assert!(store.read_manifest().unwrap().is_none());
        assert!(store.list_ids(ObjectKind::Location).unwrap().is_empty());
    }
}
