use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::RebindFailureMode;
use crate::config::PersistenceConfig;
use crate::error::{Failure, RebindError};
use crate::memento::ObjectKind;
use crate::model::{Adjunct, CatalogItem, Entity, LiveRef, Location};
use crate::{PersistError, Result};

/// Facts about the pass a handler is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebindPass {
    pub node_id: String,
    pub read_only: bool,
}

/// Policy hooks consulted by the rebind engine
///
/// A hook returning `Err` aborts the pass. Dangling-reference hooks may return
/// a substitute object whose id is used in place of the missing one; `None`
/// drops the reference. Implementations are single-use: `on_start` and the
/// completion hooks may only run once.
pub trait RebindExceptionHandler: Send + Sync {
    fn on_start(&self, pass: &RebindPass) -> Result<()>;

    fn on_load_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()>;
    fn on_create_failed(&self, kind: ObjectKind, id: &str, type_name: &str, reason: &str)
        -> Result<()>;
    fn on_not_found(&self, kind: ObjectKind, id: &str) -> Result<()>;

    fn on_dangling_entity_ref(&self, id: &str) -> Result<Option<Arc<Entity>>>;
    fn on_dangling_location_ref(&self, id: &str) -> Result<Option<Arc<Location>>>;
    fn on_dangling_policy_ref(&self, id: &str) -> Result<Option<Arc<Adjunct>>>;
    fn on_dangling_enricher_ref(&self, id: &str) -> Result<Option<Arc<Adjunct>>>;
    fn on_dangling_feed_ref(&self, id: &str) -> Result<Option<Arc<Adjunct>>>;
    fn on_dangling_catalog_item_ref(&self, id: &str) -> Result<Option<Arc<CatalogItem>>>;
    /// A config reference that did not name a kind
    fn on_dangling_untyped_ref(&self, id: &str) -> Result<Option<LiveRef>>;

    fn on_add_config_failed(&self, kind: ObjectKind, id: &str, key: &str, reason: &str)
        -> Result<()>;
    fn on_add_policy_failed(&self, entity_id: &str, policy_id: &str, reason: &str) -> Result<()>;
    fn on_add_enricher_failed(&self, entity_id: &str, enricher_id: &str, reason: &str)
        -> Result<()>;
    fn on_add_feed_failed(&self, entity_id: &str, feed_id: &str, reason: &str) -> Result<()>;
    fn on_rebind_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()>;
    fn on_manage_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()>;

    /// Called after the last phase; raises if collected failures must fail the pass
    fn on_done(&self) -> Result<()>;

    /// Called instead of `on_done` when the pass aborted with `error`
    fn on_failed(&self, error: PersistError) -> PersistError;

    /// Failures that fail the pass at the end
    fn exceptions(&self) -> Vec<Failure>;

    /// Failures that were only logged
    fn warnings(&self) -> Vec<Failure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebindHandlerBuilder {
    dangling_ref: RebindFailureMode,
    rebind: RebindFailureMode,
    add_policy: RebindFailureMode,
    load_policy: RebindFailureMode,
}

impl Default for RebindHandlerBuilder {
    fn default() -> Self {
        Self {
            dangling_ref: RebindFailureMode::default_dangling_ref(),
            rebind: RebindFailureMode::default_rebind(),
            add_policy: RebindFailureMode::default_add_policy(),
            load_policy: RebindFailureMode::default_load_policy(),
        }
    }
}

impl RebindHandlerBuilder {
    pub fn from_config(config: &PersistenceConfig) -> Self {
        Self {
            dangling_ref: config.dangling_ref_failure_mode,
            rebind: config.rebind_failure_mode,
            add_policy: config.add_policy_failure_mode,
            load_policy: config.load_policy_failure_mode,
        }
    }

    /// Every category set to `mode`
    pub fn uniform(mode: RebindFailureMode) -> Self {
        Self {
            dangling_ref: mode,
            rebind: mode,
            add_policy: mode,
            load_policy: mode,
        }
    }

    pub fn dangling_ref_failure_mode(mut self, mode: RebindFailureMode) -> Self {
        self.dangling_ref = mode;
        self
    }

    pub fn rebind_failure_mode(mut self, mode: RebindFailureMode) -> Self {
        self.rebind = mode;
        self
    }

    pub fn add_policy_failure_mode(mut self, mode: RebindFailureMode) -> Self {
        self.add_policy = mode;
        self
    }

    pub fn load_policy_failure_mode(mut self, mode: RebindFailureMode) -> Self {
        self.load_policy = mode;
        self
    }

    pub fn build(self) -> DefaultRebindExceptionHandler {
        DefaultRebindExceptionHandler {
            modes: self,
            state: Mutex::new(HandlerState::default()),
        }
    }
}

#[derive(Debug, Default)]
struct HandlerState {
    pass: Option<RebindPass>,
    done: bool,
    /// Ids whose load or creation already failed
    failed_ids: HashSet<String>,
    exceptions: Vec<Failure>,
    warnings: Vec<Failure>,
}

/// Routes each failure category through its configured mode
#[derive(Debug)]
pub struct DefaultRebindExceptionHandler {
    modes: RebindHandlerBuilder,
    state: Mutex<HandlerState>,
}

impl Default for DefaultRebindExceptionHandler {
    fn default() -> Self {
        RebindHandlerBuilder::default().build()
    }
}

impl DefaultRebindExceptionHandler {
    pub fn builder() -> RebindHandlerBuilder {
        RebindHandlerBuilder::default()
    }

    pub fn from_config(config: &PersistenceConfig) -> Self {
        RebindHandlerBuilder::from_config(config).build()
    }

    fn record(&self, failure: Failure, mode: RebindFailureMode) -> Result<()> {
        let mut state = self.state.lock();
        let read_only = state.pass.as_ref().is_some_and(|p| p.read_only);
        match mode {
            RebindFailureMode::FailFast => {
                warn!(category = failure.category(), read_only, "rebind aborting: {failure}");
                state.exceptions.push(failure.clone());
                Err(RebindError::aborted(failure).into())
            }
            RebindFailureMode::FailAtEnd => {
                warn!(category = failure.category(), read_only, "rebind problem: {failure}");
                state.exceptions.push(failure);
                Ok(())
            }
            RebindFailureMode::Continue => {
                if read_only {
                    debug!(category = failure.category(), "read-only rebind problem: {failure}");
                } else {
                    warn!(category = failure.category(), "rebind problem, continuing: {failure}");
                }
                state.warnings.push(failure);
                Ok(())
            }
        }
    }

    fn record_failed_id(&self, id: &str) {
        self.state.lock().failed_ids.insert(id.to_string());
    }

    fn mode_for_object(&self, kind: ObjectKind) -> RebindFailureMode {
        if kind.is_adjunct() {
            self.modes.load_policy
        } else {
            self.modes.rebind
        }
    }

    fn dangling<T>(&self, kind: ObjectKind, id: &str) -> Result<Option<T>> {
        self.record(
            Failure::DanglingReference {
                kind: Some(kind),
                id: id.to_string(),
            },
            self.modes.dangling_ref,
        )?;
        Ok(None)
    }

    fn finish(&self) -> Result<Vec<Failure>> {
        let mut state = self.state.lock();
        if state.done {
            return Err(PersistError::invalid_state(
                "rebind exception handler has already completed",
            ));
        }
        state.done = true;
        Ok(state.exceptions.clone())
    }
}

impl RebindExceptionHandler for DefaultRebindExceptionHandler {
    fn on_start(&self, pass: &RebindPass) -> Result<()> {
        let mut state = self.state.lock();
        if state.pass.is_some() {
            return Err(PersistError::invalid_state(
                "rebind exception handlers are single-use",
            ));
        }
        debug!(node = %pass.node_id, read_only = pass.read_only, "rebind pass starting");
        state.pass = Some(pass.clone());
        Ok(())
    }

    fn on_load_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()> {
        self.record_failed_id(id);
        self.record(
            Failure::Load {
                kind,
                id: id.to_string(),
                reason: reason.to_string(),
            },
            self.mode_for_object(kind),
        )
    }

    fn on_create_failed(
        &self,
        kind: ObjectKind,
        id: &str,
        type_name: &str,
        reason: &str,
    ) -> Result<()> {
        self.record_failed_id(id);
        self.record(
            Failure::Create {
                kind,
                id: id.to_string(),
                type_name: type_name.to_string(),
                reason: reason.to_string(),
            },
            self.mode_for_object(kind),
        )
    }

    fn on_not_found(&self, kind: ObjectKind, id: &str) -> Result<()> {
        if self.state.lock().failed_ids.contains(id) {
            debug!(kind = kind.as_str(), id, "ignoring missing object whose load already failed");
            return Ok(());
        }
        self.record(
            Failure::NotFound {
                kind,
                id: id.to_string(),
            },
            self.modes.rebind,
        )
    }

    fn on_dangling_entity_ref(&self, id: &str) -> Result<Option<Arc<Entity>>> {
        self.dangling(ObjectKind::Entity, id)
    }

    fn on_dangling_location_ref(&self, id: &str) -> Result<Option<Arc<Location>>> {
        self.dangling(ObjectKind::Location, id)
    }

    fn on_dangling_policy_ref(&self, id: &str) -> Result<Option<Arc<Adjunct>>> {
        self.dangling(ObjectKind::Policy, id)
    }

    fn on_dangling_enricher_ref(&self, id: &str) -> Result<Option<Arc<Adjunct>>> {
        self.dangling(ObjectKind::Enricher, id)
    }

    fn on_dangling_feed_ref(&self, id: &str) -> Result<Option<Arc<Adjunct>>> {
        self.dangling(ObjectKind::Feed, id)
    }

    fn on_dangling_catalog_item_ref(&self, id: &str) -> Result<Option<Arc<CatalogItem>>> {
        self.dangling(ObjectKind::CatalogItem, id)
    }

    fn on_dangling_untyped_ref(&self, id: &str) -> Result<Option<LiveRef>> {
        self.record(
            Failure::DanglingReference {
                kind: None,
                id: id.to_string(),
            },
            self.modes.dangling_ref,
        )?;
        Ok(None)
    }

    fn on_add_config_failed(
        &self,
        kind: ObjectKind,
        id: &str,
        key: &str,
        reason: &str,
    ) -> Result<()> {
        self.record(
            Failure::AddConfig {
                kind,
                id: id.to_string(),
                key: key.to_string(),
                reason: reason.to_string(),
            },
            self.modes.rebind,
        )
    }

    fn on_add_policy_failed(&self, entity_id: &str, policy_id: &str, reason: &str) -> Result<()> {
        self.record(
            Failure::AddPolicy {
                entity_id: entity_id.to_string(),
                adjunct_id: policy_id.to_string(),
                reason: reason.to_string(),
            },
            self.modes.add_policy,
        )
    }

    fn on_add_enricher_failed(
        &self,
        entity_id: &str,
        enricher_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.record(
            Failure::AddEnricher {
                entity_id: entity_id.to_string(),
                adjunct_id: enricher_id.to_string(),
                reason: reason.to_string(),
            },
            self.modes.add_policy,
        )
    }

    fn on_add_feed_failed(&self, entity_id: &str, feed_id: &str, reason: &str) -> Result<()> {
        self.record(
            Failure::AddFeed {
                entity_id: entity_id.to_string(),
                adjunct_id: feed_id.to_string(),
                reason: reason.to_string(),
            },
            self.modes.add_policy,
        )
    }

    fn on_rebind_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()> {
        let mode = if kind.is_adjunct() {
            self.modes.add_policy
        } else {
            self.modes.rebind
        };
        self.record(
            Failure::Rebind {
                kind,
                id: id.to_string(),
                reason: reason.to_string(),
            },
            mode,
        )
    }

    fn on_manage_failed(&self, kind: ObjectKind, id: &str, reason: &str) -> Result<()> {
        self.record(
            Failure::Manage {
                kind,
                id: id.to_string(),
                reason: reason.to_string(),
            },
            self.modes.rebind,
        )
    }

    fn on_done(&self) -> Result<()> {
        let exceptions = self.finish()?;
        let warnings = self.state.lock().warnings.len();
        if exceptions.is_empty() {
            if warnings > 0 {
                info!(warnings, "rebind completed with ignored problems");
            }
            return Ok(());
        }
        Err(RebindError::composite(exceptions).into())
    }

    fn on_failed(&self, error: PersistError) -> PersistError {
        let exceptions = match self.finish() {
            Ok(exceptions) => exceptions,
            Err(_) => return error,
        };
        match error {
            PersistError::Rebind(_) | PersistError::Interrupted(_) => error,
            other if exceptions.is_empty() => other,
            other => RebindError::new(format!("Rebind failed: {other}"), exceptions).into(),
        }
    }

    fn exceptions(&self) -> Vec<Failure> {
        self.state.lock().exceptions.clone()
    }

    fn warnings(&self) -> Vec<Failure> {
        self.state.lock().warnings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass() -> RebindPass {
        RebindPass {
            node_id: "node-a".to_string(),
            read_only: false,
        }
    }

    #[test]
    fn test_default_modes() {
        let handler = DefaultRebindExceptionHandler::default();
        handler.on_start(&pass()).unwrap();

        assert!(handler.on_dangling_entity_ref("gone").unwrap().is_none());
        handler.on_add_policy_failed("e1", "p1", "boom").unwrap();
        handler.on_load_failed(ObjectKind::Policy, "p2", "corrupt").unwrap();
        assert_eq!(handler.warnings().len(), 3);
        assert!(handler.exceptions().is_empty());

        handler.on_rebind_failed(ObjectKind::Entity, "e2", "bad").unwrap();
        let err = handler.on_done().unwrap_err();
        assert!(err.to_string().contains("problem rebinding entity e2: bad"));
    }

    #[test]
    fn test_fail_fast_aborts_with_id() {
        let handler = DefaultRebindExceptionHandler::builder()
            .rebind_failure_mode(RebindFailureMode::FailFast)
            .build();
        handler.on_start(&pass()).unwrap();

        let err = handler
            .on_load_failed(ObjectKind::Entity, "e7", "invalid json")
            .unwrap_err();
        assert!(err.to_string().contains("e7"));

        let raised = handler.on_failed(err);
        assert!(matches!(raised, PersistError::Rebind(ref e) if e.is_abort()));
    }

    #[test]
    fn test_continue_never_raises() {
        let handler = RebindHandlerBuilder::uniform(RebindFailureMode::Continue).build();
        handler.on_start(&pass()).unwrap();
        handler.on_manage_failed(ObjectKind::Entity, "e1", "hook").unwrap();
        handler.on_dangling_untyped_ref("x").unwrap();
        assert!(handler.on_done().is_ok());
        assert_eq!(handler.warnings().len(), 2);
    }

    #[test]
    fn test_not_found_ignored_after_load_failure() {
        let handler = DefaultRebindExceptionHandler::default();
        handler.on_start(&pass()).unwrap();
        handler.on_load_failed(ObjectKind::Entity, "e1", "corrupt").unwrap();
        handler.on_not_found(ObjectKind::Entity, "e1").unwrap();

        assert_eq!(handler.exceptions().len(), 1);
    }

    #[test]
    fn test_dangling_fail_at_end() {
        let handler = DefaultRebindExceptionHandler::builder()
            .dangling_ref_failure_mode(RebindFailureMode::FailAtEnd)
            .build();
        handler.on_start(&pass()).unwrap();
        assert!(handler.on_dangling_location_ref("l9").unwrap().is_none());

        let err = handler.on_done().unwrap_err();
        assert!(err.to_string().contains("no location found with id l9"));
    }

    #[test]
    fn test_handler_is_single_use() {
        let handler = DefaultRebindExceptionHandler::default();
        handler.on_start(&pass()).unwrap();
        assert!(handler.on_start(&pass()).is_err());
        handler.on_done().unwrap();
        assert!(matches!(handler.on_done(), Err(PersistError::InvalidState(_))));
    }
}
