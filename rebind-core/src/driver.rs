/*!
Periodic persistence driver.

A background worker wakes every `persist_period`, drains the change tracker
and writes the affected mementos through the configured persister. Flushes
are serialised: the worker, `force_persist_now` and the final flush on stop
never overlap.

Lifecycle: `Init -> Running -> Stopping -> Stopped`, and `Stopped -> Running`
again on restart. Flushes only happen while `Running`, apart from the final
flush `stop` runs while `Stopping`. Starting before a store is configured is
allowed; the worker simply skips flushes until one is set.
*/

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rayon::prelude::*;
use tracing::{debug, info, trace, warn};

use crate::config::PersistenceConfig;
use crate::handler::{
    DefaultPersistenceExceptionHandler, PersistenceExceptionHandler, RebindFailureMode, WarnedIds,
};
use crate::memento::{BundleManifest, ObjectKind};
use crate::model::{Identifiable, Lookup, ManagementContext, Rebindable, Registry};
use crate::observability::RebindMetrics;
use crate::persister::{MementoPersister, PersisterSlot};
use crate::tracker::PersistenceDelta;
use crate::{PersistError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Init,
    Running,
    Stopping,
    Stopped,
}

pub type PersistenceHandlerFactory =
    Arc<dyn Fn() -> Box<dyn PersistenceExceptionHandler> + Send + Sync>;

/// What one flush wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub written: usize,
    pub deleted: usize,
    pub bytes: usize,
    pub failed: usize,
}

pub struct PersistenceDriver {
    inner: Arc<DriverInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct DriverInner {
    context: Arc<ManagementContext>,
    persister: PersisterSlot,
    config: Arc<PersistenceConfig>,
    metrics: Arc<RebindMetrics>,
    handler_factory: RwLock<PersistenceHandlerFactory>,
    state: Mutex<ListenerState>,
    state_changed: Condvar,
    flush_lock: Mutex<()>,
    completed: Mutex<u64>,
    flush_done: Condvar,
}

enum WriteOutcome {
    Written(usize),
    GenerateFailed(String),
    PersistFailed(String),
}

impl PersistenceDriver {
    pub fn new(
        context: Arc<ManagementContext>,
        persister: PersisterSlot,
        config: Arc<PersistenceConfig>,
        metrics: Arc<RebindMetrics>,
    ) -> Self {
        let warned = WarnedIds::default();
        let factory: PersistenceHandlerFactory = Arc::new(move || {
            Box::new(DefaultPersistenceExceptionHandler::with_history(
                RebindFailureMode::Continue,
                warned.clone(),
            ))
        });

        Self {
            inner: Arc::new(DriverInner {
                context,
                persister,
                config,
                metrics,
                handler_factory: RwLock::new(factory),
                state: Mutex::new(ListenerState::Init),
                state_changed: Condvar::new(),
                flush_lock: Mutex::new(()),
                completed: Mutex::new(0),
                flush_done: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Replace the factory that builds a handler for each periodic flush
    pub fn set_handler_factory(&self, factory: PersistenceHandlerFactory) {
        *self.inner.handler_factory.write() = factory;
    }

    pub fn state(&self) -> ListenerState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ListenerState::Running
    }

    /// Number of flushes that have finished, successfully or not
    pub fn completed_flushes(&self) -> u64 {
        *self.inner.completed.lock()
    }

    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ListenerState::Running => return Ok(()),
                ListenerState::Stopping => {
                    return Err(PersistError::invalid_state("persistence driver is stopping"))
                }
                ListenerState::Init | ListenerState::Stopped => *state = ListenerState::Running,
            }
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("rebind-persister".to_string())
            .spawn(move || inner.run_worker());
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                info!(
                    period_ms = self.inner.config.persist_period.as_millis() as u64,
                    "persistence started"
                );
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = ListenerState::Stopped;
                Err(PersistError::Persistence(format!(
                    "failed to spawn persistence worker: {e}"
                )))
            }
        }
    }

    /// Stop the worker, run one final flush, then discard whatever is still
    /// pending. Blocks until any in-flight flush has completed.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ListenerState::Running {
                return Ok(());
            }
            *state = ListenerState::Stopping;
            self.inner.state_changed.notify_all();
        }

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("persistence worker panicked");
            }
        }

        let writable = self
            .inner
            .persister
            .get()
            .is_some_and(|p| p.is_writable());
        let result = if writable {
            self.inner.flush(false, None, true).map(|_| ())
        } else {
            Ok(())
        };
        self.inner.context.tracker().clear();

        *self.inner.state.lock() = ListenerState::Stopped;
        self.inner.state_changed.notify_all();
        info!("persistence stopped");
        result
    }

    /// Flush immediately on the calling thread
    ///
    /// With `full`, every live object is written whether dirty or not; ids in
    /// the store with no live object are left alone. `handler` overrides the
    /// handler built by the factory.
    ///
    /// # Errors
    /// * `PersistError::InvalidState` - If the driver is not running or write
    ///   access is disabled
    pub fn force_persist_now(
        &self,
        full: bool,
        handler: Option<Box<dyn PersistenceExceptionHandler>>,
    ) -> Result<FlushSummary> {
        self.inner.flush(full, handler, false)
    }

    /// Wait until every change recorded so far has been written
    ///
    /// With `can_trigger` the flush runs on the calling thread. Otherwise this
    /// waits for the worker and raises `Timeout` if `timeout` elapses first.
    /// Returns at once when the driver is not running, as nothing will be
    /// written.
    pub fn wait_for_pending_complete(&self, timeout: Duration, can_trigger: bool) -> Result<()> {
        match self.state() {
            ListenerState::Init | ListenerState::Stopped => return Ok(()),
            ListenerState::Running if can_trigger => {
                let summary = {
                    let Some(_guard) = self.inner.flush_lock.try_lock_for(timeout) else {
                        return Err(PersistError::timeout("pending writes", timeout));
                    };
                    self.inner.flush_locked(false, None, false)
                };
                self.inner.note_completed();
                return summary.map(|_| ());
            }
            ListenerState::Running | ListenerState::Stopping => {}
        }

        let deadline = Instant::now() + timeout;
        let tracker = self.inner.context.tracker();
        let mut completed = self.inner.completed.lock();
        loop {
            if tracker.is_empty() && !self.inner.flush_lock.is_locked() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PersistError::timeout("pending writes", timeout));
            }
            self.inner.flush_done.wait_for(&mut completed, remaining);
        }
    }
}

impl Drop for PersistenceDriver {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "final flush failed while dropping persistence driver");
            }
        }
    }
}

impl DriverInner {
    fn run_worker(self: Arc<Self>) {
        debug!("persistence worker started");
        loop {
            {
                let mut state = self.state.lock();
                if *state != ListenerState::Running {
                    break;
                }
                self.state_changed
                    .wait_for(&mut state, self.config.persist_period);
                if *state != ListenerState::Running {
                    break;
                }
            }

            if self.persister.get().is_none() {
                trace!("no persistence store configured yet; deferring flush");
                continue;
            }
            match self.flush(false, None, false) {
                Ok(_) => {}
                Err(PersistError::InvalidState(reason)) => {
                    debug!(%reason, "periodic persistence skipped");
                }
                Err(e) => warn!(error = %e, "periodic persistence failed"),
            }
        }
        debug!("persistence worker exiting");
    }

    fn flush(
        &self,
        full: bool,
        handler: Option<Box<dyn PersistenceExceptionHandler>>,
        final_flush: bool,
    ) -> Result<FlushSummary> {
        let result = {
            let _guard = self.flush_lock.lock();
            self.flush_locked(full, handler, final_flush)
        };
        self.note_completed();
        result
    }

    fn note_completed(&self) {
        *self.completed.lock() += 1;
        self.flush_done.notify_all();
    }

    /// Callers hold `flush_lock`, so `stop` cannot move the state on while
    /// a flush is writing.
    fn flush_locked(
        &self,
        full: bool,
        handler: Option<Box<dyn PersistenceExceptionHandler>>,
        final_flush: bool,
    ) -> Result<FlushSummary> {
        match *self.state.lock() {
            ListenerState::Running => {}
            ListenerState::Stopping if final_flush => {}
            state => {
                return Err(PersistError::invalid_state(format!(
                    "persistence driver is not running ({state:?})"
                )))
            }
        }

        let persister = self.persister.require()?;
        if !persister.is_writable() {
            return Err(PersistError::invalid_state(format!(
                "write access to {} is disabled",
                persister.describe()
            )));
        }

        let delta = if full {
            None
        } else {
            let delta = self.context.tracker().drain();
            if delta.is_empty() {
                return Ok(FlushSummary::default());
            }
            Some(delta)
        };

        let handler = handler.unwrap_or_else(|| {
            let factory = self.handler_factory.read().clone();
            factory()
        });
        let started = Instant::now();
        let result = self
            .write(&persister, delta.as_ref(), handler.as_ref())
            .and_then(|summary| handler.stop().map(|_| summary));
        let elapsed = started.elapsed();

        let failures = handler.failures();
        for failure in &failures {
            self.metrics.note_failure(failure);
        }
        match &result {
            Ok(summary) if failures.is_empty() => {
                self.metrics.note_persist_success(elapsed);
                debug!(
                    full,
                    written = summary.written,
                    deleted = summary.deleted,
                    bytes = summary.bytes,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "persisted mementos"
                );
            }
            Ok(_) => self.metrics.note_persist_failure(
                elapsed,
                format!("{} problem(s) persisting mementos", failures.len()),
            ),
            Err(e) => self.metrics.note_persist_failure(elapsed, e.to_string()),
        }
        result
    }

    fn write(
        &self,
        persister: &MementoPersister,
        delta: Option<&PersistenceDelta>,
        handler: &dyn PersistenceExceptionHandler,
    ) -> Result<FlushSummary> {
        let (objects, removed, manifest) = {
            let registry = self.context.registry();
            let objects = match delta {
                Some(delta) => self.dirty_objects(&registry, delta),
                None => self.live_objects(&registry),
            };
            let removed: Vec<(ObjectKind, String)> = delta
                .map(|delta| {
                    ObjectKind::ALL
                        .into_iter()
                        .filter(|kind| self.config.persists(*kind))
                        .flat_map(|kind| delta.removed(kind).map(move |id| (kind, id.clone())))
                        .collect()
                })
                .unwrap_or_default();
            let manifest = ObjectKind::ALL
                .into_iter()
                .filter(|kind| self.config.persists(*kind))
                .fold(BundleManifest::new(self.context.node_id()), |m, kind| {
                    m.with_count(kind, registry.len(kind))
                });
            (objects, removed, manifest)
        };

        let outcomes: Vec<WriteOutcome> = objects
            .par_iter()
            .map(|object| match object.memento() {
                Err(e) => WriteOutcome::GenerateFailed(e.to_string()),
                Ok(memento) => match persister.persist_memento(&memento) {
                    Ok(bytes) => WriteOutcome::Written(bytes),
                    Err(e) => WriteOutcome::PersistFailed(e.to_string()),
                },
            })
            .collect();

        let mut summary = FlushSummary::default();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let object = &objects[index];
            let reported = match outcome {
                WriteOutcome::Written(bytes) => {
                    summary.written += 1;
                    summary.bytes += bytes;
                    Ok(())
                }
                WriteOutcome::GenerateFailed(reason) => {
                    summary.failed += 1;
                    handler.on_generate_memento_failed(object.kind(), object.id(), &reason)
                }
                WriteOutcome::PersistFailed(reason) => {
                    summary.failed += 1;
                    handler.on_persist_failed(object.kind(), object.id(), &reason)
                }
            };
            if let Err(e) = reported {
                self.requeue_unwritten(&objects[index..], &removed);
                return Err(e);
            }
        }

        for (index, (kind, id)) in removed.iter().enumerate() {
            match persister.delete(*kind, id) {
                Ok(()) => summary.deleted += 1,
                Err(e) => {
                    summary.failed += 1;
                    if let Err(e) = handler.on_delete_failed(*kind, id, &e.to_string()) {
                        self.requeue_unwritten(&[], &removed[index..]);
                        return Err(e);
                    }
                }
            }
        }

        if let Err(e) = persister.write_manifest(&manifest) {
            summary.failed += 1;
            handler.on_raw_persist_failed("manifest", &e.to_string())?;
        }
        Ok(summary)
    }

    /// Hand what an aborted flush did not get to back to the tracker
    fn requeue_unwritten(&self, objects: &[Arc<dyn Rebindable>], removed: &[(ObjectKind, String)]) {
        let mut remainder = PersistenceDelta::new();
        for object in objects {
            remainder.mark_changed(object.kind(), object.id());
        }
        for (kind, id) in removed {
            remainder.mark_removed(*kind, id);
        }
        debug!(
            changed = remainder.changed_count(),
            removed = remainder.removed_count(),
            "requeueing changes after aborted flush"
        );
        self.context.tracker().requeue(remainder);
    }

    fn live_objects(&self, registry: &Registry) -> Vec<Arc<dyn Rebindable>> {
        ObjectKind::ALL
            .into_iter()
            .filter(|kind| self.config.persists(*kind))
            .flat_map(|kind| registry.all_of(kind))
            .map(|object| object.as_rebindable())
            .collect()
    }

    /// Dirty objects plus what a dirty entity references: its locations with
    /// their ancestors, and its adjuncts.
    fn dirty_objects(&self, registry: &Registry, delta: &PersistenceDelta) -> Vec<Arc<dyn Rebindable>> {
        let mut wanted: BTreeSet<(ObjectKind, String)> = BTreeSet::new();
        for kind in ObjectKind::ALL {
            for id in delta.changed(kind) {
                wanted.insert((kind, id.clone()));
                if kind != ObjectKind::Entity {
                    continue;
                }
                let Some(entity) = registry.entity(id) else {
                    continue;
                };
                let detail = entity.detail();
                for location_id in &detail.location_ids {
                    let mut next = Some(location_id.clone());
                    while let Some(lid) = next.take() {
                        if !wanted.insert((ObjectKind::Location, lid.clone())) {
                            break;
                        }
                        next = registry.location(&lid).and_then(|l| l.parent_id());
                    }
                }
                for adjunct_kind in [ObjectKind::Policy, ObjectKind::Enricher, ObjectKind::Feed] {
                    for adjunct_id in detail.adjunct_ids(adjunct_kind) {
                        wanted.insert((adjunct_kind, adjunct_id.clone()));
                    }
                }
            }
        }

        wanted
            .into_iter()
            .filter(|(kind, _)| self.config.persists(*kind))
            .filter_map(|(kind, id)| registry.rebindable(kind, &id))
            .collect()
    }
}

impl std::fmt::Debug for PersistenceDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceDriver")
            .field("state", &self.state())
            .field("completed_flushes", &self.completed_flushes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memento::MementoCodec;
    use crate::model::{Configurable, ObjectSpec, TypeRegistry};
    use crate::store::{MemoryStore, RawStore};
    use serde_json::json;

    struct Fixture {
        context: Arc<ManagementContext>,
        store: MemoryStore,
        driver: PersistenceDriver,
        metrics: Arc<RebindMetrics>,
    }

    fn fixture(config: PersistenceConfig) -> Fixture {
        let types = Arc::new(TypeRegistry::new());
        types.register_plain(ObjectKind::Entity, "app");
        types.register_plain(ObjectKind::Location, "region");
        types.register_plain(ObjectKind::Policy, "restarter");
        let context = Arc::new(ManagementContext::new("node-a", types));
        context.init();

        let store = MemoryStore::new();
        let slot = PersisterSlot::new();
        slot.set(Arc::new(MementoPersister::new(
            Arc::new(store.clone()),
            MementoCodec::default(),
        )));
        let metrics = Arc::new(RebindMetrics::new());
        let driver = PersistenceDriver::new(context.clone(), slot, Arc::new(config), metrics.clone());
        driver.start().unwrap();
        Fixture {
            context,
            store,
            driver,
            metrics,
        }
    }

    /// The worker never fires within a test; flushes are forced.
    fn manual() -> PersistenceConfig {
        PersistenceConfig {
            persist_period: Duration::from_secs(3600),
            ..PersistenceConfig::default()
        }
    }

    #[test]
    fn test_flush_writes_dirty_and_referenced() {
        let f = fixture(manual());
        f.context.create_location(ObjectSpec::new("region").with_id("eu")).unwrap();
        f.context
            .create_location(ObjectSpec::new("region").with_id("eu-west").child_of("eu"))
            .unwrap();
        f.context.create_entity(ObjectSpec::new("app").with_id("a1")).unwrap();
        f.context
            .add_adjunct("a1", ObjectKind::Policy, ObjectSpec::new("restarter").with_id("p1"))
            .unwrap();
        f.context.add_location_to_entity("a1", "eu-west").unwrap();
        f.driver.force_persist_now(false, None).unwrap();

        // Only the entity is dirty now, but its location chain and policy follow.
        f.store.clear().unwrap();
        f.context.entity("a1").unwrap().set_config("x", json!(1)).unwrap();
        let summary = f.driver.force_persist_now(false, None).unwrap();

        assert_eq!(summary.written, 4);
        assert!(f.store.contains(ObjectKind::Location, "eu"));
        assert!(f.store.contains(ObjectKind::Policy, "p1"));
        assert!(f.store.read_manifest().unwrap().is_some());
    }

    #[test]
    fn test_unmanage_deletes_blob() {
        let f = fixture(manual());
        f.context.create_entity(ObjectSpec::new("app").with_id("a1")).unwrap();
        f.driver.force_persist_now(false, None).unwrap();
        assert!(f.store.contains(ObjectKind::Entity, "a1"));

        f.context.unmanage(ObjectKind::Entity, "a1").unwrap();
        let summary = f.driver.force_persist_now(false, None).unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(!f.store.contains(ObjectKind::Entity, "a1"));
    }

    #[test]
    fn test_empty_delta_writes_nothing() {
        let f = fixture(manual());
        let summary = f.driver.force_persist_now(false, None).unwrap();
        assert_eq!(summary, FlushSummary::default());
        assert!(f.store.read_manifest().unwrap().is_none());
    }

    #[test]
    fn test_disabled_kind_is_skipped() {
        let config = PersistenceConfig {
            persist_policies: false,
            ..manual()
        };
        let f = fixture(config);
        f.context.create_entity(ObjectSpec::new("app").with_id("a1")).unwrap();
        f.context
            .add_adjunct("a1", ObjectKind::Policy, ObjectSpec::new("restarter").with_id("p1"))
            .unwrap();
        f.driver.force_persist_now(false, None).unwrap();

        assert!(f.store.contains(ObjectKind::Entity, "a1"));
        assert!(!f.store.contains(ObjectKind::Policy, "p1"));
    }

    #[test]
    fn test_write_failure_goes_to_handler_and_metrics() {
        let f = fixture(manual());
        f.context.create_entity(ObjectSpec::new("app").with_id("a1")).unwrap();
        f.context.create_entity(ObjectSpec::new("app").with_id("a2")).unwrap();
        f.store.fail_writes_for("a1");

        let summary = f.driver.force_persist_now(false, None).unwrap();
        assert_eq!(summary.written, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(f.metrics.failure_count("persist"), 1);
        assert_eq!(f.metrics.persist().failure_count, 1);
    }

    #[test]
    fn test_start_stop_final_flush() {
        let f = fixture(manual());
        assert!(f.driver.is_running());

        f.context.create_entity(ObjectSpec::new("app").with_id("a1")).unwrap();
        f.driver.stop().unwrap();

        assert_eq!(f.driver.state(), ListenerState::Stopped);
        assert!(f.store.contains(ObjectKind::Entity, "a1"));

        // Changes made while stopped are picked up by the next run.
        f.context.create_entity(ObjectSpec::new("app").with_id("a2")).unwrap();
        f.driver.start().unwrap();
        f.driver.stop().unwrap();
        assert!(f.store.contains(ObjectKind::Entity, "a2"));
        assert!(f.context.tracker().is_empty());
    }

    #[test]
    fn test_wait_for_pending_times_out_without_trigger() {
        let f = fixture(manual());
        f.context.create_entity(ObjectSpec::new("app").with_id("a1")).unwrap();

        let err = f
            .driver
            .wait_for_pending_complete(Duration::from_millis(50), false)
            .unwrap_err();
        assert!(matches!(err, PersistError::Timeout { .. }));

        f.driver
            .wait_for_pending_complete(Duration::from_secs(5), true)
            .unwrap();
        assert!(f.store.contains(ObjectKind::Entity, "a1"));
        f.driver.stop().unwrap();
    }

    #[test]
    fn test_periodic_worker_flushes() {
        let mut config = PersistenceConfig::default();
        config.persist_period = Duration::from_millis(20);
        let f = fixture(config);
        f.context.create_entity(ObjectSpec::new("app").with_id("a1")).unwrap();

        f.driver
            .wait_for_pending_complete(Duration::from_secs(5), false)
            .unwrap();
        assert!(f.store.contains(ObjectKind::Entity, "a1"));
        f.driver.stop().unwrap();
    }

    #[test]
    fn test_read_only_persister_refuses_flush() {
        let f = fixture(manual());
        f.context.create_entity(ObjectSpec::new("app").with_id("a1")).unwrap();
        f.driver
            .inner
            .persister
            .require()
            .unwrap()
            .disable_write_access();

        assert!(matches!(
            f.driver.force_persist_now(false, None),
            Err(PersistError::InvalidState(_))
        ));
        assert!(!f.context.tracker().is_empty());
    }

    #[test]
    fn test_stopped_driver_refuses_flushes() {
        let f = fixture(manual());
        f.driver.stop().unwrap();

        f.context.create_entity(ObjectSpec::new("app").with_id("late")).unwrap();
        assert!(matches!(
            f.driver.force_persist_now(false, None),
            Err(PersistError::InvalidState(_))
        ));
        assert!(matches!(
            f.driver.force_persist_now(true, None),
            Err(PersistError::InvalidState(_))
        ));
        f.driver
            .wait_for_pending_complete(Duration::from_secs(1), true)
            .unwrap();
        assert!(!f.store.contains(ObjectKind::Entity, "late"));
        assert_eq!(f.store.write_count(), 0);

        // A restart picks the change up again.
        f.driver.start().unwrap();
        f.driver.force_persist_now(false, None).unwrap();
        assert!(f.store.contains(ObjectKind::Entity, "late"));
    }

    #[test]
    fn test_aborted_flush_requeues_unwritten_changes() {
        let f = fixture(manual());
        f.context.create_entity(ObjectSpec::new("app").with_id("a1")).unwrap();
        f.context.create_entity(ObjectSpec::new("app").with_id("a2")).unwrap();
        f.driver.force_persist_now(false, None).unwrap();

        f.context.entity("a1").unwrap().set_config("x", json!(1)).unwrap();
        f.context.unmanage(ObjectKind::Entity, "a2").unwrap();
        f.store.fail_writes_for("a1");
        let fail_fast = DefaultPersistenceExceptionHandler::new(RebindFailureMode::FailFast);
        let err = f
            .driver
            .force_persist_now(false, Some(Box::new(fail_fast)))
            .unwrap_err();
        assert!(err.to_string().contains("a1"));
        assert!(f.store.contains(ObjectKind::Entity, "a2"));
        assert!(f.context.tracker().is_dirty(ObjectKind::Entity, "a1"));
        assert!(f.context.tracker().is_removed(ObjectKind::Entity, "a2"));

        // The next flush still deletes a2; a1 keeps failing under the default handler.
        let summary = f.driver.force_persist_now(false, None).unwrap();
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.failed, 1);
        assert!(!f.store.contains(ObjectKind::Entity, "a2"));
    }
}
