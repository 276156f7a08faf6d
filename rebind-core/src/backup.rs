/*!
Snapshots of the persisted state taken around master transitions.

When `backup_storage` is configured, a node copies the shared store into a
fresh location under it just before it rebinds as master, and again after its
final flush when it stops being master. Each snapshot lands in its own
`<timestamp>-<node>-<mode>-<suffix>` location so earlier snapshots are never
overwritten. A failed snapshot is logged and never blocks the transition.
*/

use std::fmt;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{PersistenceConfig, StorageConfig};
use crate::handler::{DefaultPersistenceExceptionHandler, RebindFailureMode};
use crate::persister::{copy_state, CopySummary};
use crate::store::{self, RawStore};
use crate::Result;

/// Transition a snapshot is taken for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Promotion,
    Demotion,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Promotion => "promotion",
            BackupMode::Demotion => "demotion",
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the sub-location a snapshot is written to
pub fn backup_label(node_id: &str, mode: BackupMode) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{node_id}-{mode}-{}",
        Utc::now().format("%Y-%m-%d-%H%M%S"),
        &suffix[..4]
    )
}

/// Copy `source` into a new location under `backup`
///
/// # Errors
/// * `PersistError::Validation` - If the backup location is invalid
/// * `PersistError::Storage` - If the backup store cannot be opened or read
pub fn create_backup(
    source: &dyn RawStore,
    backup: &StorageConfig,
    node_id: &str,
    mode: BackupMode,
) -> Result<CopySummary> {
    let target_config = backup.sub_location(&backup_label(node_id, mode));
    let target = store::create_store_from_config(&target_config)?;
    let handler = DefaultPersistenceExceptionHandler::new(RebindFailureMode::Continue);
    let summary = copy_state(source, target.as_ref(), &handler)?;
    info!(%mode, target = %target.describe(), copied = summary.copied, "backed up persisted state");
    Ok(summary)
}

/// Take a snapshot if `config` names a backup location; failures are logged
pub fn backup_if_configured(source: &dyn RawStore, config: &PersistenceConfig, mode: BackupMode) {
    let Some(backup) = config.backup_storage.as_ref() else {
        return;
    };
    if let Err(e) = create_backup(source, backup, &config.node_id, mode) {
        warn!(%mode, error = %e, "backup of persisted state failed; continuing");
    }
}
