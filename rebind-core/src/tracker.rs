/*!
Change tracking between persistence flushes.

Live objects report lifecycle events to a [`ChangeListener`]. The
[`ChangeTracker`] folds them into a pending [`PersistenceDelta`] which the
persistence driver drains on every flush. An id is either dirty or removed,
never both: the most recent event wins.
*/

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tracing::trace;

use crate::memento::ObjectKind;

/// Receiver of live-object lifecycle events
pub trait ChangeListener: Send + Sync {
    fn on_managed(&self, kind: ObjectKind, id: &str);
    fn on_changed(&self, kind: ObjectKind, id: &str);
    fn on_unmanaged(&self, kind: ObjectKind, id: &str);
}

/// Listener for objects whose changes are never persisted
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ChangeListener for NoopListener {
    fn on_managed(&self, _kind: ObjectKind, _id: &str) {}
    fn on_changed(&self, _kind: ObjectKind, _id: &str) {}
    fn on_unmanaged(&self, _kind: ObjectKind, _id: &str) {}
}

/// Ids to write and ids to delete, per kind, in stable order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceDelta {
    changed: BTreeMap<ObjectKind, BTreeSet<String>>,
    removed: BTreeMap<ObjectKind, BTreeSet<String>>,
}

impl PersistenceDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_changed(&mut self, kind: ObjectKind, id: &str) {
        if let Some(removed) = self.removed.get_mut(&kind) {
            removed.remove(id);
        }
        self.changed.entry(kind).or_default().insert(id.to_string());
    }

    pub fn mark_removed(&mut self, kind: ObjectKind, id: &str) {
        if let Some(changed) = self.changed.get_mut(&kind) {
            changed.remove(id);
        }
        self.removed.entry(kind).or_default().insert(id.to_string());
    }

    pub fn changed(&self, kind: ObjectKind) -> impl Iterator<Item = &String> {
        self.changed.get(&kind).into_iter().flatten()
    }

    pub fn removed(&self, kind: ObjectKind) -> impl Iterator<Item = &String> {
        self.removed.get(&kind).into_iter().flatten()
    }

    pub fn is_changed(&self, kind: ObjectKind, id: &str) -> bool {
        self.changed.get(&kind).is_some_and(|s| s.contains(id))
    }

    pub fn is_removed(&self, kind: ObjectKind, id: &str) -> bool {
        self.removed.get(&kind).is_some_and(|s| s.contains(id))
    }

    pub fn changed_count(&self) -> usize {
        self.changed.values().map(BTreeSet::len).sum()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.changed_count() == 0 && self.removed_count() == 0
    }
}

/// Collects changes from the live plane until the next flush
#[derive(Debug, Default)]
pub struct ChangeTracker {
    pending: Mutex<PersistenceDelta>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the pending delta, leaving an empty one behind
    pub fn drain(&self) -> PersistenceDelta {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn is_dirty(&self, kind: ObjectKind, id: &str) -> bool {
        self.pending.lock().is_changed(kind, id)
    }

    pub fn is_removed(&self, kind: ObjectKind, id: &str) -> bool {
        self.pending.lock().is_removed(kind, id)
    }

    /// Put back a drained delta that could not be written
    ///
    /// Events recorded since the drain are newer and win over the requeued
    /// ones.
    pub fn requeue(&self, delta: PersistenceDelta) {
        let mut pending = self.pending.lock();
        for (kind, ids) in delta.changed {
            for id in ids {
                if !pending.is_changed(kind, &id) && !pending.is_removed(kind, &id) {
                    pending.mark_changed(kind, &id);
                }
            }
        }
        for (kind, ids) in delta.removed {
            for id in ids {
                if !pending.is_changed(kind, &id) {
                    pending.mark_removed(kind, &id);
                }
            }
        }
    }

    /// Discard pending changes
    pub fn clear(&self) {
        *self.pending.lock() = PersistenceDelta::default();
    }
}

impl ChangeListener for ChangeTracker {
    fn on_managed(&self, kind: ObjectKind, id: &str) {
        trace!(kind = kind.as_str(), id, "managed");
        self.pending.lock().mark_changed(kind, id);
    }

    fn on_changed(&self, kind: ObjectKind, id: &str) {
        self.pending.lock().mark_changed(kind, id);
    }

    fn on_unmanaged(&self, kind: ObjectKind, id: &str) {
        trace!(kind = kind.as_str(), id, "unmanaged");
        self.pending.lock().mark_removed(kind, id);
    }
}
