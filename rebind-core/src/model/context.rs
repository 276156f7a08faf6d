/*!
The management context: owner of the live registry.

All creation, relationship and unmanage operations go through here so that
both ends of every relationship are updated together and the change tracker
sees each affected object. Rebind replaces the registry wholesale under the
write lock; see [`crate::rebind`].
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Adjunct, Behaviour, CatalogItem, CatalogItemDetail, Entity, Identifiable, LiveObject, LiveRef,
    Location, Lookup, ObjectState, Registry, TypeRegistry,
};
use crate::memento::{ConfigMap, ObjectKind};
use crate::tracker::{ChangeListener, ChangeTracker};
use crate::{PersistError, Result};

/// What to create: declared type plus initial state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSpec {
    /// Generated when absent
    pub id: Option<String>,
    pub type_name: String,
    pub display_name: Option<String>,
    pub catalog_item_id: Option<String>,
    pub config: ConfigMap,
    pub tags: Vec<String>,
    /// Parent entity or location; ignored for adjuncts and catalog items
    pub parent_id: Option<String>,
}

impl ObjectSpec {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn named(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn child_of(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn from_catalog(mut self, catalog_item_id: impl Into<String>) -> Self {
        self.catalog_item_id = Some(catalog_item_id.into());
        self
    }

    pub fn config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

pub struct ManagementContext {
    node_id: String,
    types: Arc<TypeRegistry>,
    tracker: Arc<ChangeTracker>,
    registry: RwLock<Registry>,
    running: AtomicBool,
    read_only: AtomicBool,
}

impl ManagementContext {
    pub fn new(node_id: impl Into<String>, types: Arc<TypeRegistry>) -> Self {
        Self {
            node_id: node_id.into(),
            types,
            tracker: Arc::new(ChangeTracker::new()),
            registry: RwLock::new(Registry::new()),
            running: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    pub fn init(&self) {
        self.running.store(true, Ordering::Release);
        info!(node = %self.node_id, "management context started");
    }

    /// Drop every live object and any pending changes
    pub fn teardown(&self) {
        let mut registry = self.registry.write();
        for object in registry.all() {
            object.set_managed(false);
        }
        *registry = Registry::new();
        self.tracker.clear();
        self.running.store(false, Ordering::Release);
        info!(node = %self.node_id, "management context stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// True while the registry holds a mirrored, read-only graph
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read()
    }

    pub(crate) fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write()
    }

    /// Run `f` against a consistent view of the registry
    pub fn with_registry<T>(&self, f: impl FnOnce(&Registry) -> T) -> T {
        f(&self.registry.read())
    }

    pub fn entity(&self, id: &str) -> Option<Arc<Entity>> {
        self.registry.read().entity(id)
    }

    pub fn location(&self, id: &str) -> Option<Arc<Location>> {
        self.registry.read().location(id)
    }

    pub fn adjunct(&self, kind: ObjectKind, id: &str) -> Option<Arc<Adjunct>> {
        self.registry.read().adjunct(kind, id)
    }

    pub fn catalog_item(&self, id: &str) -> Option<Arc<CatalogItem>> {
        self.registry.read().catalog_item(id)
    }

    /// Root entities, in id order
    pub fn applications(&self) -> Vec<Arc<Entity>> {
        self.registry.read().applications()
    }

    pub fn ids(&self, kind: ObjectKind) -> Vec<String> {
        self.registry.read().ids(kind)
    }

    pub fn count(&self, kind: ObjectKind) -> usize {
        self.registry.read().len(kind)
    }

    pub fn create_entity(&self, spec: ObjectSpec) -> Result<Arc<Entity>> {
        self.ensure_writable()?;
        let mut registry = self.registry.write();
        let parent = match &spec.parent_id {
            Some(pid) => Some(registry.entity(pid).ok_or_else(|| {
                PersistError::validation(format!("no entity found with id {pid}"))
            })?),
            None => None,
        };

        let entity: Arc<Entity> = Arc::new(self.instantiate(&registry, ObjectKind::Entity, &spec)?);
        entity.wire(|state| state.detail.parent_id = spec.parent_id.clone());
        entity
            .behaviour()
            .on_manage(&*registry, entity.id())
            .map_err(|e| {
                PersistError::validation(format!("failed to manage entity {}: {e}", entity.id()))
            })?;
        registry.insert_entity(entity.clone());
        if let Some(parent) = parent {
            parent.update(|state| push_unique(&mut state.detail.children_ids, entity.id()))?;
        }
        self.mark_managed(LiveRef::Entity(entity.clone()));
        Ok(entity)
    }

    pub fn create_location(&self, spec: ObjectSpec) -> Result<Arc<Location>> {
        self.ensure_writable()?;
        let mut registry = self.registry.write();
        let parent = match &spec.parent_id {
            Some(pid) => Some(registry.location(pid).ok_or_else(|| {
                PersistError::validation(format!("no location found with id {pid}"))
            })?),
            None => None,
        };

        let location: Arc<Location> =
            Arc::new(self.instantiate(&registry, ObjectKind::Location, &spec)?);
        location.wire(|state| state.detail.parent_id = spec.parent_id.clone());
        location
            .behaviour()
            .on_manage(&*registry, location.id())
            .map_err(|e| {
                PersistError::validation(format!("failed to manage location {}: {e}", location.id()))
            })?;
        registry.insert_location(location.clone());
        if let Some(parent) = parent {
            parent.update(|state| push_unique(&mut state.detail.children_ids, location.id()))?;
        }
        self.mark_managed(LiveRef::Location(location.clone()));
        Ok(location)
    }

    /// Create a policy, enricher or feed and attach it to an entity
    pub fn add_adjunct(
        &self,
        entity_id: &str,
        kind: ObjectKind,
        spec: ObjectSpec,
    ) -> Result<Arc<Adjunct>> {
        if !kind.is_adjunct() {
            return Err(PersistError::validation(format!("{kind} is not an adjunct kind")));
        }
        self.ensure_writable()?;
        let mut registry = self.registry.write();
        let entity = registry
            .entity(entity_id)
            .ok_or_else(|| PersistError::validation(format!("no entity found with id {entity_id}")))?;

        let adjunct: Arc<Adjunct> = Arc::new(self.instantiate(&registry, kind, &spec)?);
        adjunct.behaviour().on_attach(entity_id).map_err(|e| {
            PersistError::validation(format!(
                "failed to add {kind} {} to entity {entity_id}: {e}",
                adjunct.id()
            ))
        })?;
        adjunct.wire(|state| state.detail.entity_id = Some(entity_id.to_string()));
        adjunct
            .behaviour()
            .on_manage(&*registry, adjunct.id())
            .map_err(|e| {
                PersistError::validation(format!("failed to manage {kind} {}: {e}", adjunct.id()))
            })?;
        registry.insert_adjunct(adjunct.clone());
        entity.update(|state| {
            if let Some(ids) = state.detail.adjunct_ids_mut(kind) {
                push_unique(ids, adjunct.id());
            }
        })?;
        self.mark_managed(LiveRef::Adjunct(adjunct.clone()));
        Ok(adjunct)
    }

    pub fn add_catalog_item(
        &self,
        spec: ObjectSpec,
        detail: CatalogItemDetail,
    ) -> Result<Arc<CatalogItem>> {
        self.ensure_writable()?;
        let mut registry = self.registry.write();
        let item: Arc<CatalogItem> =
            Arc::new(self.instantiate(&registry, ObjectKind::CatalogItem, &spec)?);
        item.wire(|state| state.detail = detail);
        registry.insert_catalog_item(item.clone());
        self.mark_managed(LiveRef::CatalogItem(item.clone()));
        Ok(item)
    }

    pub fn add_location_to_entity(&self, entity_id: &str, location_id: &str) -> Result<()> {
        self.ensure_writable()?;
        let registry = self.registry.read();
        let entity = registry
            .entity(entity_id)
            .ok_or_else(|| PersistError::validation(format!("no entity found with id {entity_id}")))?;
        if !registry.contains(ObjectKind::Location, location_id) {
            return Err(PersistError::validation(format!(
                "no location found with id {location_id}"
            )));
        }
        entity.update(|state| push_unique(&mut state.detail.location_ids, location_id))
    }

    pub fn add_member(&self, group_id: &str, member_id: &str) -> Result<bool> {
        self.ensure_writable()?;
        let registry = self.registry.read();
        let group = registry
            .entity(group_id)
            .ok_or_else(|| PersistError::validation(format!("no entity found with id {group_id}")))?;
        if !registry.contains(ObjectKind::Entity, member_id) {
            return Err(PersistError::validation(format!(
                "no entity found with id {member_id}"
            )));
        }
        group.update(|state| state.detail.members_ids.insert(member_id.to_string()))
    }

    pub fn remove_member(&self, group_id: &str, member_id: &str) -> Result<bool> {
        self.ensure_writable()?;
        let group = self
            .entity(group_id)
            .ok_or_else(|| PersistError::validation(format!("no entity found with id {group_id}")))?;
        group.update(|state| state.detail.members_ids.remove(member_id))
    }

    /// Stop managing an object. Entities take their children and adjuncts
    /// with them; every relationship pointing at a removed object is cut.
    pub fn unmanage(&self, kind: ObjectKind, id: &str) -> Result<()> {
        self.ensure_writable()?;
        let mut registry = self.registry.write();
        if !registry.contains(kind, id) {
            return Err(PersistError::validation(format!(
                "no {} found with id {id}",
                kind.label()
            )));
        }
        self.unmanage_locked(&mut registry, kind, id)
    }

    fn unmanage_locked(&self, registry: &mut Registry, kind: ObjectKind, id: &str) -> Result<()> {
        let Some(object) = registry.remove(kind, id) else {
            return Ok(());
        };

        match &object {
            LiveRef::Entity(entity) => {
                let detail = entity.detail();
                for child in &detail.children_ids {
                    self.unmanage_locked(registry, ObjectKind::Entity, child)?;
                }
                for adjunct_kind in [ObjectKind::Policy, ObjectKind::Enricher, ObjectKind::Feed] {
                    for adjunct_id in detail.adjunct_ids(adjunct_kind) {
                        self.unmanage_locked(registry, adjunct_kind, adjunct_id)?;
                    }
                }
                if let Some(parent) = detail.parent_id.and_then(|pid| registry.entity(&pid)) {
                    parent.update(|state| state.detail.children_ids.retain(|c| c != id))?;
                }
                let groups: Vec<_> = registry
                    .entities()
                    .filter(|g| g.with_state(|s| s.detail.members_ids.contains(id)))
                    .cloned()
                    .collect();
                for group in groups {
                    group.update(|state| state.detail.members_ids.remove(id))?;
                }
            }
            LiveRef::Location(location) => {
                let detail = location.detail();
                for child in &detail.children_ids {
                    self.unmanage_locked(registry, ObjectKind::Location, child)?;
                }
                if let Some(parent) = detail.parent_id.and_then(|pid| registry.location(&pid)) {
                    parent.update(|state| state.detail.children_ids.retain(|c| c != id))?;
                }
                let users: Vec<_> = registry
                    .entities()
                    .filter(|e| e.with_state(|s| s.detail.location_ids.iter().any(|l| l == id)))
                    .cloned()
                    .collect();
                for entity in users {
                    entity.update(|state| state.detail.location_ids.retain(|l| l != id))?;
                }
            }
            LiveRef::Adjunct(adjunct) => {
                if let Some(owner) = adjunct.entity_id().and_then(|eid| registry.entity(&eid)) {
                    owner.update(|state| {
                        if let Some(ids) = state.detail.adjunct_ids_mut(kind) {
                            ids.retain(|a| a != id);
                        }
                    })?;
                }
            }
            LiveRef::CatalogItem(_) => {}
        }

        object.set_managed(false);
        self.tracker.on_unmanaged(kind, id);
        debug!(kind = kind.as_str(), id, "unmanaged");
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.is_running() {
            return Err(PersistError::invalid_state("management context is not running"));
        }
        if self.is_read_only() {
            return Err(PersistError::invalid_state(
                "management context is mirroring read-only state",
            ));
        }
        Ok(())
    }

    fn behaviour_for(&self, kind: ObjectKind, type_name: &str) -> Result<Arc<dyn Behaviour>> {
        self.types
            .create(kind, type_name)
            .map_err(PersistError::validation)
    }

    /// Build an unregistered object from a spec, checking id uniqueness and config
    fn instantiate<D: Default>(
        &self,
        registry: &Registry,
        kind: ObjectKind,
        spec: &ObjectSpec,
    ) -> Result<LiveObject<D>> {
        let behaviour = self.behaviour_for(kind, &spec.type_name)?;
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        if registry.find_any(&id).is_some() {
            return Err(PersistError::validation(format!("id {id} is already in use")));
        }
        for (key, value) in &spec.config {
            behaviour.accept_config(key, value).map_err(|e| {
                PersistError::validation(format!("{kind} {id} rejected config '{key}': {e}"))
            })?;
        }

        let object = LiveObject::skeleton(kind, id, spec.type_name.clone(), behaviour);
        object.wire(|state: &mut ObjectState<D>| {
            state.display_name = spec.display_name.clone();
            state.catalog_item_id = spec.catalog_item_id.clone();
            state.config = spec.config.clone();
            state.tags = spec.tags.clone();
        });
        object.set_listener(self.tracker.clone());
        Ok(object)
    }

    fn mark_managed(&self, object: LiveRef) {
        object.set_managed(true);
        self.tracker.on_managed(object.kind(), object.id());
    }
}

impl std::fmt::Debug for ManagementContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementContext")
            .field("node_id", &self.node_id)
            .field("running", &self.is_running())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}
