//! Configuration for the memento store and the persistence subsystem
//!
//! [`StorageConfig`] selects the raw store backend (local filesystem, memory
//! or S3). [`PersistenceConfig`] carries everything else: flush and mirror
//! periods, which adjunct kinds are persisted, the rebind failure modes, blob
//! compression and where master transition backups go.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compression::CompressionKind;
use crate::handler::RebindFailureMode;
use crate::memento::ObjectKind;
use crate::{PersistError, Result};

/// Enumeration of supported storage backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    /// Local filesystem storage, one directory per object kind
    Local,
    /// Process-local store, lost on exit
    Memory,
    /// Amazon S3 (or compatible) object storage
    S3,
}

/// Configuration structure for storage backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// The storage backend to use
    pub backend: StorageBackend,
    /// S3 bucket name (required for S3 backend)
    #[serde(default)]
    pub s3_bucket: Option<String>,
    /// AWS region for S3 operations (optional, defaults to environment)
    #[serde(default)]
    pub s3_region: Option<String>,
    /// Key prefix under which the kind namespaces live
    #[serde(default)]
    pub s3_prefix: Option<String>,
    /// Root directory for local storage
    #[serde(default)]
    pub local_base_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        StorageConfig {
            backend: StorageBackend::Local,
            s3_bucket: None,
            s3_region: None,
            s3_prefix: None,
            local_base_path: Some(path.into()),
        }
    }

    pub fn memory() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            s3_bucket: None,
            s3_region: None,
            s3_prefix: None,
            local_base_path: None,
        }
    }

    /// Create an S3 configuration with specified bucket and key prefix
    pub fn s3(bucket: impl Into<String>, prefix: Option<String>) -> Self {
        StorageConfig {
            backend: StorageBackend::S3,
            s3_bucket: Some(bucket.into()),
            s3_region: None,
            s3_prefix: prefix.filter(|p| !p.is_empty()),
            local_base_path: None,
        }
    }

    /// Parse a store URI
    ///
    /// Supports formats:
    /// - `s3://bucket-name/prefix` for S3 storage
    /// - `mem://` for an in-memory store
    /// - `/local/path` or `./relative/path` for local storage
    pub fn from_uri(uri: &str) -> Result<StorageConfig> {
        if let Some(s3_part) = uri.strip_prefix("s3://") {
            let mut parts = s3_part.splitn(2, '/');
            let bucket = parts.next().unwrap_or_default();
            if bucket.is_empty() {
                return Err(PersistError::validation(
                    "Invalid S3 URI: missing bucket name",
                ));
            }
            let prefix = parts
                .next()
                .map(|p| p.trim_end_matches('/').to_string());
            Ok(StorageConfig::s3(bucket, prefix))
        } else if uri.starts_with("mem://") {
            Ok(StorageConfig::memory())
        } else if uri.is_empty() {
            Err(PersistError::validation("Empty store URI"))
        } else {
            Ok(StorageConfig::local(uri))
        }
    }

    /// The same backend rooted at `label` below this location
    ///
    /// An in-memory store has no location, so it is returned unchanged.
    pub fn sub_location(&self, label: &str) -> StorageConfig {
        let mut config = self.clone();
        match self.backend {
            StorageBackend::Local => {
                config.local_base_path = self.local_base_path.as_ref().map(|base| base.join(label));
            }
            StorageBackend::S3 => {
                config.s3_prefix = Some(match self.s3_prefix.as_deref() {
                    Some(prefix) => format!("{prefix}/{label}"),
                    None => label.to_string(),
                });
            }
            StorageBackend::Memory => {}
        }
        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            StorageBackend::S3 => {
                if self.s3_bucket.as_deref().map_or(true, str::is_empty) {
                    return Err(PersistError::validation(
                        "S3 backend requires a valid bucket name",
                    ));
                }
            }
            StorageBackend::Local => {
                if self.local_base_path.is_none() {
                    return Err(PersistError::validation(
                        "Local backend requires a base path",
                    ));
                }
            }
            StorageBackend::Memory => {}
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::local("rebind-store")
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn default_period() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_node_id() -> String {
    format!("node-{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Settings for the persistence driver, rebind engine and mirroring loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Identifier of this management node, recorded in the bundle manifest
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Interval between incremental flushes
    #[serde(with = "duration_ms", default = "default_period")]
    pub persist_period: Duration,
    /// Interval between read-only mirror rebinds
    #[serde(with = "duration_ms", default = "default_period")]
    pub mirror_period: Duration,
    #[serde(default = "default_true")]
    pub persist_policies: bool,
    #[serde(default = "default_true")]
    pub persist_enrichers: bool,
    #[serde(default = "default_true")]
    pub persist_feeds: bool,
    #[serde(default = "default_true")]
    pub persist_catalog_items: bool,
    #[serde(default = "RebindFailureMode::default_dangling_ref")]
    pub dangling_ref_failure_mode: RebindFailureMode,
    #[serde(default = "RebindFailureMode::default_rebind")]
    pub rebind_failure_mode: RebindFailureMode,
    #[serde(default = "RebindFailureMode::default_add_policy")]
    pub add_policy_failure_mode: RebindFailureMode,
    #[serde(default = "RebindFailureMode::default_load_policy")]
    pub load_policy_failure_mode: RebindFailureMode,
    #[serde(default)]
    pub compression: CompressionKind,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Where snapshots are taken on promotion to and demotion from master
    #[serde(default)]
    pub backup_storage: Option<StorageConfig>,
}

impl PersistenceConfig {
    pub fn with_storage(storage: StorageConfig) -> Self {
        Self {
            storage,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: PersistenceConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Whether mementos of `kind` are written and rebound
    pub fn persists(&self, kind: ObjectKind) -> bool {
        match kind {
            ObjectKind::Policy => self.persist_policies,
            ObjectKind::Enricher => self.persist_enrichers,
            ObjectKind::Feed => self.persist_feeds,
            ObjectKind::CatalogItem => self.persist_catalog_items,
            ObjectKind::Entity | ObjectKind::Location => true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.persist_period.is_zero() {
            return Err(PersistError::validation("persist_period must be non-zero"));
        }
        if self.mirror_period.is_zero() {
            return Err(PersistError::validation("mirror_period must be non-zero"));
        }
        if self.node_id.trim().is_empty() {
            return Err(PersistError::validation("node_id must not be empty"));
        }
        if let Some(backup) = &self.backup_storage {
            if backup.backend == StorageBackend::Memory {
                return Err(PersistError::validation(
                    "backup_storage cannot be an in-memory store",
                ));
            }
            backup.validate()?;
        }
        self.storage.validate()
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            persist_period: default_period(),
            mirror_period: default_period(),
            persist_policies: true,
            persist_enrichers: true,
            persist_feeds: true,
            persist_catalog_items: true,
            dangling_ref_failure_mode: RebindFailureMode::default_dangling_ref(),
            rebind_failure_mode: RebindFailureMode::default_rebind(),
            add_policy_failure_mode: RebindFailureMode::default_add_policy(),
            load_policy_failure_mode: RebindFailureMode::default_load_policy(),
            compression: CompressionKind::default(),
            storage: StorageConfig::default(),
            backup_storage: None,
        }
    }
}
