/*!
Node-state controller.

Leader election happens elsewhere; this module only reacts to the
[`ManagementNodeState`] it is handed. A master rebinds once and then runs the
persistence driver. A hot standby or hot backup never writes: it runs a
mirroring loop that periodically rebinds the latest bundle into a read-only
graph. The two loops are never active at the same time.

With `backup_storage` configured, the store is snapshotted before a node
becomes master and after it stops being master (see [`crate::backup`]).
*/

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backup::{self, BackupMode};
use crate::config::PersistenceConfig;
use crate::driver::PersistenceDriver;
use crate::handler::{
    DefaultRebindExceptionHandler, RebindExceptionHandler, RebindFailureMode, RebindHandlerBuilder,
};
use crate::model::Entity;
use crate::persister::PersisterSlot;
use crate::rebind::RebindEngine;
use crate::{PersistError, Result};

/// Role assigned to this node by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagementNodeState {
    Initializing,
    Standby,
    HotStandby,
    HotBackup,
    Master,
    Failed,
    Terminated,
}

impl ManagementNodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagementNodeState::Initializing => "INITIALIZING",
            ManagementNodeState::Standby => "STANDBY",
            ManagementNodeState::HotStandby => "HOT_STANDBY",
            ManagementNodeState::HotBackup => "HOT_BACKUP",
            ManagementNodeState::Master => "MASTER",
            ManagementNodeState::Failed => "FAILED",
            ManagementNodeState::Terminated => "TERMINATED",
        }
    }

    /// States that keep a read-only mirror of the master's graph
    pub fn is_hot_proxy(&self) -> bool {
        matches!(self, ManagementNodeState::HotStandby | ManagementNodeState::HotBackup)
    }
}

impl fmt::Display for ManagementNodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    NotStarted,
    PersistingAsMaster,
    MirroringReadOnly,
    Stopped,
}

/// Cancellation and wake-up for one mirroring thread
#[derive(Default)]
struct MirrorSignal {
    cancelled: AtomicBool,
    sleep: Mutex<()>,
    wake: Condvar,
}

impl MirrorSignal {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let _guard = self.sleep.lock();
        self.wake.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct MirrorWorker {
    mode: ManagementNodeState,
    signal: Arc<MirrorSignal>,
    handle: JoinHandle<()>,
}

pub struct NodeStateController {
    inner: Arc<ControllerInner>,
    driver: Arc<PersistenceDriver>,
    mirror: Mutex<Option<MirrorWorker>>,
    state: Mutex<ControllerState>,
}

struct ControllerInner {
    engine: Arc<RebindEngine>,
    persister: PersisterSlot,
    config: Arc<PersistenceConfig>,
    node_state: Mutex<ManagementNodeState>,
    rebound_as_master: AtomicBool,
    awaiting_initial_rebind: AtomicBool,
}

impl NodeStateController {
    pub fn new(
        engine: Arc<RebindEngine>,
        driver: Arc<PersistenceDriver>,
        persister: PersisterSlot,
        config: Arc<PersistenceConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                engine,
                persister,
                config,
                node_state: Mutex::new(ManagementNodeState::Initializing),
                rebound_as_master: AtomicBool::new(false),
                awaiting_initial_rebind: AtomicBool::new(false),
            }),
            driver,
            mirror: Mutex::new(None),
            state: Mutex::new(ControllerState::NotStarted),
        }
    }

    pub fn node_state(&self) -> ManagementNodeState {
        *self.inner.node_state.lock()
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    /// True from the moment the node becomes master or a hot proxy until the
    /// first rebind under that state has completed
    pub fn is_awaiting_initial_rebind(&self) -> bool {
        self.inner.awaiting_initial_rebind.load(Ordering::Acquire)
    }

    pub fn is_mirroring(&self) -> bool {
        self.mirror.lock().is_some()
    }

    pub fn is_persisting(&self) -> bool {
        self.driver.is_running()
    }

    /// Start as master
    pub fn start(&self) -> Result<()> {
        self.set_node_state(ManagementNodeState::Master)
    }

    /// Stop whichever loop is running
    pub fn stop(&self) -> Result<()> {
        self.stop_read_only();
        let result = self.driver.stop();
        *self.state.lock() = ControllerState::Stopped;
        result
    }

    /// React to a role change decided by the cluster
    ///
    /// # Errors
    /// * `PersistError::Rebind` - If the master's initial rebind fails; the
    ///   node state becomes `Failed`
    /// * `PersistError::InvalidState` - If a loop cannot be switched
    pub fn set_node_state(&self, new_state: ManagementNodeState) -> Result<()> {
        let previous = std::mem::replace(&mut *self.inner.node_state.lock(), new_state);
        if previous != new_state {
            info!(from = %previous, to = %new_state, "management node state changed");
        }

        match new_state {
            ManagementNodeState::Master => {
                let needs_rebind = !self.inner.rebound_as_master.load(Ordering::Acquire);
                self.inner
                    .awaiting_initial_rebind
                    .store(needs_rebind, Ordering::Release);
                self.stop_read_only();
                if previous != ManagementNodeState::Master {
                    self.inner.backup(BackupMode::Promotion);
                }

                if needs_rebind {
                    if let Err(e) = self.rebind_as_master(None) {
                        warn!(error = %e, "rebind as master failed");
                        *self.inner.node_state.lock() = ManagementNodeState::Failed;
                        self.inner
                            .awaiting_initial_rebind
                            .store(false, Ordering::Release);
                        return Err(e);
                    }
                }
                self.start_persistence()
            }
            mode if mode.is_hot_proxy() => {
                self.inner.rebound_as_master.store(false, Ordering::Release);
                let switching = self
                    .mirror
                    .lock()
                    .as_ref()
                    .map_or(true, |worker| worker.mode != mode);
                if switching {
                    self.inner
                        .awaiting_initial_rebind
                        .store(true, Ordering::Release);
                }
                self.stop_persistence()?;
                if previous == ManagementNodeState::Master {
                    self.inner.backup(BackupMode::Demotion);
                }
                self.start_read_only(mode)
            }
            _ => {
                self.inner
                    .awaiting_initial_rebind
                    .store(false, Ordering::Release);
                self.stop_read_only();
                let result = self.stop_persistence();
                if previous == ManagementNodeState::Master {
                    self.inner.backup(BackupMode::Demotion);
                }
                result
            }
        }
    }

    /// Rebind the stored graph as a writable master graph
    ///
    /// Uses `handler` or, without one, a handler built from the configured
    /// failure modes. Without a configured store there is nothing to load and
    /// the rebind is skipped.
    pub fn rebind_as_master(
        &self,
        handler: Option<&dyn RebindExceptionHandler>,
    ) -> Result<Vec<Arc<Entity>>> {
        let roots = match self.inner.persister.get() {
            Some(_) => match handler {
                Some(handler) => self.inner.rebind(handler, ManagementNodeState::Master, None)?,
                None => {
                    let handler = DefaultRebindExceptionHandler::from_config(&self.inner.config);
                    self.inner.rebind(&handler, ManagementNodeState::Master, None)?
                }
            },
            None => {
                info!("no persistence store configured; starting with an empty graph");
                Vec::new()
            }
        };
        self.inner.rebound_as_master.store(true, Ordering::Release);
        self.inner
            .awaiting_initial_rebind
            .store(false, Ordering::Release);
        Ok(roots)
    }

    /// Grant write access and start the persistence driver
    ///
    /// # Errors
    /// * `PersistError::InvalidState` - If read-only mirroring is still running
    pub fn start_persistence(&self) -> Result<()> {
        if self.is_mirroring() {
            return Err(PersistError::invalid_state(
                "cannot start persistence while read-only mirroring is running",
            ));
        }
        if let Some(persister) = self.inner.persister.get() {
            persister.enable_write_access();
        }
        self.driver.start()?;
        *self.state.lock() = ControllerState::PersistingAsMaster;
        Ok(())
    }

    pub fn stop_persistence(&self) -> Result<()> {
        let result = self.driver.stop();
        let mut state = self.state.lock();
        if *state == ControllerState::PersistingAsMaster {
            *state = ControllerState::Stopped;
        }
        result
    }

    /// Revoke write access and start the mirroring loop in `mode`
    ///
    /// The first pass runs immediately, then one every `mirror_period`.
    ///
    /// # Errors
    /// * `PersistError::InvalidState` - If `mode` is not a hot proxy state or
    ///   persistence is still running
    pub fn start_read_only(&self, mode: ManagementNodeState) -> Result<()> {
        if !mode.is_hot_proxy() {
            return Err(PersistError::invalid_state(format!(
                "cannot mirror in node state {mode}"
            )));
        }
        if self.driver.is_running() {
            return Err(PersistError::invalid_state(
                "cannot start read-only mirroring while persistence is running",
            ));
        }

        let mut mirror = self.mirror.lock();
        if let Some(worker) = mirror.as_ref() {
            if worker.mode == mode {
                return Ok(());
            }
        }
        if let Some(worker) = mirror.take() {
            worker.stop();
        }

        if let Some(persister) = self.inner.persister.get() {
            persister.disable_write_access();
        }

        let signal = Arc::new(MirrorSignal::default());
        let inner = Arc::clone(&self.inner);
        let worker_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("rebind-mirror".to_string())
            .spawn(move || inner.run_mirror(mode, &worker_signal))
            .map_err(|e| {
                PersistError::invalid_state(format!("failed to spawn mirroring worker: {e}"))
            })?;

        *mirror = Some(MirrorWorker {
            mode,
            signal,
            handle,
        });
        *self.state.lock() = ControllerState::MirroringReadOnly;
        info!(
            mode = %mode,
            period_ms = self.inner.config.mirror_period.as_millis() as u64,
            "read-only mirroring started"
        );
        Ok(())
    }

    /// Cancel any in-flight mirroring pass and wait for the worker to exit
    pub fn stop_read_only(&self) {
        let Some(worker) = self.mirror.lock().take() else {
            return;
        };
        worker.stop();

        let mut state = self.state.lock();
        if *state == ControllerState::MirroringReadOnly {
            *state = ControllerState::Stopped;
        }
        info!("read-only mirroring stopped");
    }
}

impl Drop for NodeStateController {
    fn drop(&mut self) {
        self.stop_read_only();
    }
}

impl fmt::Debug for NodeStateController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeStateController")
            .field("node_state", &self.node_state())
            .field("state", &self.state())
            .field("awaiting_initial_rebind", &self.is_awaiting_initial_rebind())
            .finish()
    }
}

impl MirrorWorker {
    fn stop(self) {
        self.signal.cancel();
        if self.handle.join().is_err() {
            warn!("mirroring worker panicked");
        }
    }
}

impl ControllerInner {
    fn rebind(
        &self,
        handler: &dyn RebindExceptionHandler,
        mode: ManagementNodeState,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<Arc<Entity>>> {
        let persister = self.persister.require()?;
        let bundle = persister.load_bundle()?;
        self.engine
            .rebind(&bundle, persister.codec(), handler, mode, cancel)
    }

    fn backup(&self, mode: BackupMode) {
        if let Some(persister) = self.persister.get() {
            backup::backup_if_configured(persister.store().as_ref(), &self.config, mode);
        }
    }

    fn run_mirror(&self, mode: ManagementNodeState, signal: &MirrorSignal) {
        debug!(mode = %mode, "mirroring worker started");
        while !signal.is_cancelled() {
            let started = Instant::now();
            if self.persister.get().is_some() {
                let handler = RebindHandlerBuilder::uniform(RebindFailureMode::Continue).build();
                match self.rebind(&handler, mode, Some(&signal.cancelled)) {
                    Ok(_) => {
                        self.awaiting_initial_rebind.store(false, Ordering::Release);
                    }
                    Err(e) if e.is_interrupted() => break,
                    Err(e) => warn!(error = %e, mode = %mode, "read-only rebind failed"),
                }
            }

            let mut guard = signal.sleep.lock();
            if signal.is_cancelled() {
                break;
            }
            let wait = self
                .config
                .mirror_period
                .saturating_sub(started.elapsed());
            if !wait.is_zero() {
                signal.wake.wait_for(&mut guard, wait);
            }
        }
        debug!("mirroring worker exiting");
    }
}
