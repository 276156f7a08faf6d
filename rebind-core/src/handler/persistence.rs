use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::RebindFailureMode;
use crate::error::{Failure, RebindError};
use crate::memento::ObjectKind;
use crate::{PersistError, Result};

/// Policy hooks consulted by a persistence flush
///
/// A hook returning `Err` aborts the rest of the flush. `stop` runs once at
/// the end of the flush and raises any failures collected for the end.
pub trait PersistenceExceptionHandler: Send + Sync {
    fn on_generate_memento_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()>;
    fn on_persist_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()>;
    /// Raw writes such as the bundle manifest or copied blobs
    fn on_raw_persist_failed(&self, target: &str, reason: &str) -> Result<()>;
    fn on_delete_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn failures(&self) -> Vec<Failure>;
}

/// Ids already warned about, shared by the handlers of successive flushes
pub type WarnedIds = Arc<Mutex<HashSet<String>>>;

/// Logs each failing id once at warn level and later repeats at debug
#[derive(Debug)]
pub struct DefaultPersistenceExceptionHandler {
    mode: RebindFailureMode,
    warned: WarnedIds,
    failures: Mutex<Vec<Failure>>,
}

impl Default for DefaultPersistenceExceptionHandler {
    fn default() -> Self {
        Self::new(RebindFailureMode::Continue)
    }
}

impl DefaultPersistenceExceptionHandler {
    pub fn new(mode: RebindFailureMode) -> Self {
        Self::with_history(mode, WarnedIds::default())
    }

    pub fn with_history(mode: RebindFailureMode, warned: WarnedIds) -> Self {
        Self {
            mode,
            warned,
            failures: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, failure: Failure) -> Result<()> {
        let first_time = self.warned.lock().insert(failure.id().to_string());
        if first_time {
            warn!(category = failure.category(), "persistence problem: {failure}");
        } else {
            debug!(category = failure.category(), "repeated persistence problem: {failure}");
        }
        self.failures.lock().push(failure.clone());

        match self.mode {
            RebindFailureMode::FailFast => Err(PersistError::Persistence(format!(
                "Persistence aborted: {failure}"
            ))),
            RebindFailureMode::FailAtEnd | RebindFailureMode::Continue => Ok(()),
        }
    }
}

impl PersistenceExceptionHandler for DefaultPersistenceExceptionHandler {
    fn on_generate_memento_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()> {
        self.record(Failure::GenerateMemento {
            kind,
            id: id.to_string(),
            reason: reason.to_string(),
        })
    }

    fn on_persist_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()> {
        self.record(Failure::Persist {
            kind,
            id: id.to_string(),
            reason: reason.to_string(),
        })
    }

    fn on_raw_persist_failed(&self, target: &str, reason: &str) -> Result<()> {
        self.record(Failure::RawPersist {
            target: target.to_string(),
            reason: reason.to_string(),
        })
    }

    fn on_delete_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()> {
        self.record(Failure::Delete {
            kind,
            id: id.to_string(),
            reason: reason.to_string(),
        })
    }

    fn stop(&self) -> Result<()> {
        let failures = self.failures.lock().clone();
        if self.mode == RebindFailureMode::FailAtEnd && !failures.is_empty() {
            let count = failures.len();
            let detail = RebindError::new("Problems persisting", failures);
            return Err(PersistError::Persistence(format!("{count} failure(s): {detail}")));
        }
        Ok(())
    }

    fn failures(&self) -> Vec<Failure> {
        self.failures.lock().clone()
    }
}
