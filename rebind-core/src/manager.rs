/*!
Control surface of the rebind subsystem for the management-context layer.

[`RebindManager`] wires one [`ManagementContext`] to a persistence driver, a
rebind engine and a node-state controller that all share the same persister
slot, configuration and metrics.
*/

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::info;

use crate::config::PersistenceConfig;
use crate::driver::{FlushSummary, PersistenceDriver, PersistenceHandlerFactory};
use crate::ha::{ManagementNodeState, NodeStateController};
use crate::handler::{
    DefaultRebindExceptionHandler, PersistenceExceptionHandler, RebindExceptionHandler,
};
use crate::memento::MementoCodec;
use crate::model::{Entity, ManagementContext};
use crate::observability::RebindMetrics;
use crate::persister::{MementoPersister, PersisterSlot};
use crate::rebind::RebindEngine;
use crate::store::RawStore;
use crate::Result;

pub struct RebindManager {
    context: Arc<ManagementContext>,
    config: Arc<PersistenceConfig>,
    metrics: Arc<RebindMetrics>,
    persister: PersisterSlot,
    engine: Arc<RebindEngine>,
    driver: Arc<PersistenceDriver>,
    controller: NodeStateController,
}

impl RebindManager {
    /// Create a manager with no store configured yet
    pub fn new(context: Arc<ManagementContext>, config: PersistenceConfig) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(RebindMetrics::new());
        let persister = PersisterSlot::new();
        let engine = Arc::new(RebindEngine::new(
            context.clone(),
            config.clone(),
            metrics.clone(),
        ));
        let driver = Arc::new(PersistenceDriver::new(
            context.clone(),
            persister.clone(),
            config.clone(),
            metrics.clone(),
        ));
        let controller = NodeStateController::new(
            engine.clone(),
            driver.clone(),
            persister.clone(),
            config.clone(),
        );

        Self {
            context,
            config,
            metrics,
            persister,
            engine,
            driver,
            controller,
        }
    }

    /// Create a manager and open the store named by `config.storage`
    ///
    /// # Errors
    /// * `PersistError::Validation` - If the configuration is invalid
    /// * `PersistError::Storage` - If the store cannot be opened
    pub fn from_config(context: Arc<ManagementContext>, config: PersistenceConfig) -> Result<Self> {
        config.validate()?;
        let persister = MementoPersister::from_config(&config)?;
        let manager = Self::new(context, config);
        manager.set_persister(Arc::new(persister));
        Ok(manager)
    }

    pub fn context(&self) -> &Arc<ManagementContext> {
        &self.context
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn persister(&self) -> Option<Arc<MementoPersister>> {
        self.persister.get()
    }

    /// Configure the store to persist to and rebind from
    pub fn set_persister(&self, persister: Arc<MementoPersister>) {
        info!(store = %persister.describe(), "persistence store configured");
        self.persister.set(persister);
    }

    /// Configure a raw store with the configured compression
    pub fn set_store(&self, store: Arc<dyn RawStore>) {
        let codec = MementoCodec::from_kind(self.config.compression);
        self.set_persister(Arc::new(MementoPersister::new(store, codec)));
    }

    /// A rebind handler using the configured failure modes
    pub fn new_rebind_handler(&self) -> DefaultRebindExceptionHandler {
        DefaultRebindExceptionHandler::from_config(&self.config)
    }

    /// Rebind the stored graph in `mode` with an explicit handler
    ///
    /// `Master` produces a writable graph; `HotStandby` and `HotBackup`
    /// produce a read-only one.
    pub fn rebind(
        &self,
        handler: &dyn RebindExceptionHandler,
        mode: ManagementNodeState,
    ) -> Result<Vec<Arc<Entity>>> {
        if mode == ManagementNodeState::Master {
            return self.controller.rebind_as_master(Some(handler));
        }
        let persister = self.persister.require()?;
        let bundle = persister.load_bundle()?;
        self.engine
            .rebind(&bundle, persister.codec(), handler, mode, None)
    }

    pub fn start(&self) -> Result<()> {
        self.controller.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.controller.stop()
    }

    pub fn set_node_state(&self, state: ManagementNodeState) -> Result<()> {
        self.controller.set_node_state(state)
    }

    pub fn node_state(&self) -> ManagementNodeState {
        self.controller.node_state()
    }

    pub fn start_persistence(&self) -> Result<()> {
        self.controller.start_persistence()
    }

    pub fn stop_persistence(&self) -> Result<()> {
        self.controller.stop_persistence()
    }

    pub fn start_read_only(&self, mode: ManagementNodeState) -> Result<()> {
        self.controller.start_read_only(mode)
    }

    pub fn stop_read_only(&self) {
        self.controller.stop_read_only()
    }

    pub fn is_awaiting_initial_rebind(&self) -> bool {
        self.controller.is_awaiting_initial_rebind()
    }

    pub fn is_persisting(&self) -> bool {
        self.controller.is_persisting()
    }

    pub fn is_mirroring(&self) -> bool {
        self.controller.is_mirroring()
    }

    /// Replace the handler factory used by periodic flushes
    pub fn set_persistence_handler_factory(&self, factory: PersistenceHandlerFactory) {
        self.driver.set_handler_factory(factory);
    }

    pub fn force_persist_now(
        &self,
        full: bool,
        handler: Option<Box<dyn PersistenceExceptionHandler>>,
    ) -> Result<FlushSummary> {
        self.driver.force_persist_now(full, handler)
    }

    pub fn wait_for_pending_complete(&self, timeout: Duration, can_trigger: bool) -> Result<()> {
        self.driver.wait_for_pending_complete(timeout, can_trigger)
    }

    /// Delete everything in the store. A full persist afterwards writes a
    /// store holding exactly the live graph.
    pub fn clear_store(&self) -> Result<()> {
        self.persister.require()?.clear()
    }

    pub fn metrics(&self) -> Map<String, Value> {
        self.metrics.snapshot()
    }

    pub fn metrics_handle(&self) -> &Arc<RebindMetrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for RebindManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebindManager")
            .field("node_id", &self.context.node_id())
            .field("controller", &self.controller)
            .field("persister", &self.persister.get())
            .finish()
    }
}
