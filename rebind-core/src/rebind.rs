/*!
Rebind engine: rebuilds the live object graph from a raw data bundle.

A pass runs in four phases:

1. **Load** - decode every blob (in parallel) into a memento
2. **Instantiate** - create an unwired object per memento from the type registry
3. **Wire** - tier by tier (catalog items, locations, entities, adjuncts),
   restore state and resolve references, then attach adjuncts to entities
4. **Manage** - run management hooks, parents before children

Phases 2-4 build a staged registry while holding the context's registry write
lock, so readers never observe a half-wired graph. The staged graph replaces
the live one only if the exception handler's completion hook does not raise;
a failed pass leaves the live registry as it was.
*/

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::ha::ManagementNodeState;
use crate::handler::{RebindExceptionHandler, RebindPass};
use crate::memento::reference::resolve_refs;
use crate::memento::{
    AdjunctMemento, CatalogItemMemento, ConfigMap, ConfigRef, EntityMemento, LocationMemento,
    Memento, MementoCodec, MementoHeader, ObjectKind,
};
use crate::model::{
    Adjunct, Behaviour, CatalogItem, CatalogItemDetail, Entity, EntityDetail, Identifiable,
    LiveObject, LiveRef, Location, LocationDetail, Lookup, ManagementContext, ObjectState,
    Registry,
};
use crate::observability::RebindMetrics;
use crate::store::RawDataBundle;
use crate::tracker::{ChangeListener, NoopListener};
use crate::{PersistError, Result};

const ADJUNCT_KINDS: [ObjectKind; 3] = [ObjectKind::Policy, ObjectKind::Enricher, ObjectKind::Feed];

pub struct RebindEngine {
    context: Arc<ManagementContext>,
    config: Arc<PersistenceConfig>,
    metrics: Arc<RebindMetrics>,
    serial: Mutex<()>,
    read_only_passes: AtomicU64,
}

impl RebindEngine {
    pub fn new(
        context: Arc<ManagementContext>,
        config: Arc<PersistenceConfig>,
        metrics: Arc<RebindMetrics>,
    ) -> Self {
        Self {
            context,
            config,
            metrics,
            serial: Mutex::new(()),
            read_only_passes: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &Arc<ManagementContext> {
        &self.context
    }

    /// Run one rebind pass and return the root entities of the new graph
    ///
    /// `mode` must be `Master` (writable graph) or one of the hot mirroring
    /// states (read-only graph). Passes are serialised. If `cancel` becomes
    /// true the pass stops at the next phase boundary with `Interrupted`.
    pub fn rebind(
        &self,
        bundle: &RawDataBundle,
        codec: &MementoCodec,
        handler: &dyn RebindExceptionHandler,
        mode: ManagementNodeState,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<Arc<Entity>>> {
        let read_only = match mode {
            ManagementNodeState::Master => false,
            ManagementNodeState::HotStandby | ManagementNodeState::HotBackup => true,
            other => {
                return Err(PersistError::invalid_state(format!(
                    "cannot rebind in node state {other}"
                )))
            }
        };

        let _serial = self.serial.lock();
        let started = Instant::now();
        if bundle.is_empty() {
            debug!(read_only, "rebinding from an empty store");
        }
        handler.on_start(&RebindPass {
            node_id: self.context.node_id().to_string(),
            read_only,
        })?;

        let iteration = RebindIteration {
            engine: self,
            handler,
            codec,
            read_only,
            cancel,
        };
        let outcome = iteration.run(bundle);
        let elapsed = started.elapsed();

        for failure in handler.exceptions().iter().chain(handler.warnings().iter()) {
            self.metrics.note_failure(failure);
        }
        match &outcome {
            Ok(roots) => {
                self.metrics.note_rebind_success(elapsed, read_only);
                let registry = self.context.registry();
                if read_only {
                    let pass = self.read_only_passes.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(
                        pass,
                        entities = registry.len(ObjectKind::Entity),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "read-only rebind complete"
                    );
                } else {
                    info!(
                        applications = roots.len(),
                        entities = registry.len(ObjectKind::Entity),
                        locations = registry.len(ObjectKind::Location),
                        policies = registry.len(ObjectKind::Policy),
                        enrichers = registry.len(ObjectKind::Enricher),
                        feeds = registry.len(ObjectKind::Feed),
                        catalog_items = registry.len(ObjectKind::CatalogItem),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "rebind complete"
                    );
                }
            }
            Err(e) if e.is_interrupted() => debug!("rebind interrupted"),
            Err(e) => self.metrics.note_rebind_failure(elapsed, e.to_string()),
        }
        outcome
    }
}

impl std::fmt::Debug for RebindEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebindEngine")
            .field("node_id", &self.context.node_id())
            .finish()
    }
}

/// Mementos decoded in phase 1, per kind in bundle order
#[derive(Default)]
struct Loaded {
    catalog_items: Vec<CatalogItemMemento>,
    locations: Vec<LocationMemento>,
    entities: Vec<EntityMemento>,
    adjuncts: BTreeMap<ObjectKind, Vec<AdjunctMemento>>,
}

impl Loaded {
    fn push(&mut self, memento: Memento) {
        match memento {
            Memento::CatalogItem(m) => self.catalog_items.push(m),
            Memento::Location(m) => self.locations.push(m),
            Memento::Entity(m) => self.entities.push(m),
            Memento::Policy(m) => self.adjuncts.entry(ObjectKind::Policy).or_default().push(m),
            Memento::Enricher(m) => self.adjuncts.entry(ObjectKind::Enricher).or_default().push(m),
            Memento::Feed(m) => self.adjuncts.entry(ObjectKind::Feed).or_default().push(m),
        }
    }

    fn headers(&self, kind: ObjectKind) -> Vec<&MementoHeader> {
        match kind {
            ObjectKind::CatalogItem => self.catalog_items.iter().map(|m| &m.header).collect(),
            ObjectKind::Location => self.locations.iter().map(|m| &m.header).collect(),
            ObjectKind::Entity => self.entities.iter().map(|m| &m.header).collect(),
            _ => self.adjuncts(kind).iter().map(|m| &m.header).collect(),
        }
    }

    fn adjuncts(&self, kind: ObjectKind) -> &[AdjunctMemento] {
        self.adjuncts.get(&kind).map_or(&[], Vec::as_slice)
    }
}

/// One single-use pass
struct RebindIteration<'a> {
    engine: &'a RebindEngine,
    handler: &'a dyn RebindExceptionHandler,
    codec: &'a MementoCodec,
    read_only: bool,
    cancel: Option<&'a AtomicBool>,
}

impl RebindIteration<'_> {
    fn run(self, bundle: &RawDataBundle) -> Result<Vec<Arc<Entity>>> {
        let loaded = match self.load(bundle) {
            Ok(loaded) => loaded,
            Err(e) => return Err(self.handler.on_failed(e)),
        };

        let mut live = self.engine.context.registry_mut();
        let staged = match self.build(&loaded) {
            Ok(staged) => staged,
            Err(e) => return Err(self.handler.on_failed(e)),
        };
        self.handler.on_done()?;

        let listener: Arc<dyn ChangeListener> = if self.read_only {
            Arc::new(NoopListener)
        } else {
            self.engine.context.tracker().clone()
        };
        for object in staged.all() {
            object.attach(listener.clone(), self.read_only);
        }
        for object in live.all() {
            let kept = staged
                .find(object.kind(), object.id())
                .is_some_and(|current| current.same_object(&object));
            if !kept {
                object.set_managed(false);
            }
        }
        let roots = staged.applications();
        *live = staged;
        self.engine.context.set_read_only(self.read_only);
        Ok(roots)
    }

    fn check_cancelled(&self, phase: &str) -> Result<()> {
        if self.cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
            return Err(PersistError::interrupted(format!("rebind cancelled before {phase}")));
        }
        Ok(())
    }

    /// Phase 1
    fn load(&self, bundle: &RawDataBundle) -> Result<Loaded> {
        let config = &self.engine.config;
        for failure in bundle.read_failures() {
            if config.persists(failure.kind) {
                self.handler
                    .on_load_failed(failure.kind, &failure.id, &failure.reason)?;
            }
        }

        let mut loaded = Loaded::default();
        for kind in ObjectKind::ALL {
            if !config.persists(kind) {
                if bundle.len(kind) > 0 {
                    debug!(kind = kind.as_str(), count = bundle.len(kind), "skipping disabled kind");
                }
                continue;
            }

            let codec = self.codec;
            let blobs: Vec<_> = bundle.blobs(kind).collect();
            let decoded: Vec<Result<Memento>> = blobs
                .par_iter()
                .map(|(id, blob)| codec.decode(kind, id, blob))
                .collect();
            for ((id, _), result) in blobs.iter().zip(decoded) {
                match result {
                    Ok(memento) => loaded.push(memento),
                    Err(e) => self.handler.on_load_failed(kind, id, &e.to_string())?,
                }
            }
        }
        Ok(loaded)
    }

    /// Phases 2 to 4
    fn build(&self, loaded: &Loaded) -> Result<Registry> {
        self.check_cancelled("instantiation")?;
        let mut staged = self.instantiate(loaded)?;

        self.check_cancelled("wiring")?;
        self.wire(&mut staged, loaded)?;

        self.check_cancelled("management")?;
        self.manage(&staged)?;
        Ok(staged)
    }

    /// Phase 2
    fn instantiate(&self, loaded: &Loaded) -> Result<Registry> {
        let mut staged = Registry::new();
        for kind in ObjectKind::ALL {
            for header in loaded.headers(kind) {
                let behaviour = match self.engine.context.types().create(kind, &header.type_name) {
                    Ok(behaviour) => behaviour,
                    Err(reason) => {
                        self.handler
                            .on_create_failed(kind, &header.id, &header.type_name, &reason)?;
                        continue;
                    }
                };
                let (id, type_name) = (header.id.clone(), header.type_name.clone());
                match kind {
                    ObjectKind::CatalogItem => staged.insert_catalog_item(Arc::new(
                        CatalogItem::skeleton(kind, id, type_name, behaviour),
                    )),
                    ObjectKind::Location => staged
                        .insert_location(Arc::new(Location::skeleton(kind, id, type_name, behaviour))),
                    ObjectKind::Entity => {
                        staged.insert_entity(Arc::new(Entity::skeleton(kind, id, type_name, behaviour)))
                    }
                    _ => staged
                        .insert_adjunct(Arc::new(Adjunct::skeleton(kind, id, type_name, behaviour))),
                }
            }
        }
        Ok(staged)
    }

    /// Phase 3
    fn wire(&self, staged: &mut Registry, loaded: &Loaded) -> Result<()> {
        for memento in &loaded.catalog_items {
            let Some(item) = staged.catalog_item(&memento.header.id) else {
                self.handler
                    .on_not_found(ObjectKind::CatalogItem, &memento.header.id)?;
                continue;
            };
            self.wire_header(staged, item.as_ref(), &memento.header)?;
            item.wire(|state| {
                state.detail = CatalogItemDetail {
                    symbolic_name: memento.symbolic_name.clone(),
                    version: memento.version.clone(),
                    plan_yaml: memento.plan_yaml.clone(),
                    libraries: memento.libraries.clone(),
                    deprecated: memento.deprecated,
                    disabled: memento.disabled,
                }
            });
            self.reconstruct(staged, item.as_ref())?;
        }

        let locations: Vec<(&str, Option<&str>)> = loaded
            .locations
            .iter()
            .map(|m| (m.header.id.as_str(), m.parent_id.as_deref()))
            .collect();
        for index in parent_first(&locations) {
            let memento = &loaded.locations[index];
            let Some(location) = staged.location(&memento.header.id) else {
                self.handler
                    .on_not_found(ObjectKind::Location, &memento.header.id)?;
                continue;
            };
            self.wire_header(staged, location.as_ref(), &memento.header)?;
            let parent_id = self.resolve_opt(staged, ObjectKind::Location, memento.parent_id.as_deref())?;
            let children_ids = self.resolve_all(staged, ObjectKind::Location, &memento.children_ids)?;
            location.wire(|state| {
                state.detail = LocationDetail {
                    parent_id,
                    children_ids,
                }
            });
            self.reconstruct(staged, location.as_ref())?;
        }

        let entities: Vec<(&str, Option<&str>)> = loaded
            .entities
            .iter()
            .map(|m| (m.header.id.as_str(), m.parent_id.as_deref()))
            .collect();
        for index in parent_first(&entities) {
            let memento = &loaded.entities[index];
            let Some(entity) = staged.entity(&memento.header.id) else {
                self.handler.on_not_found(ObjectKind::Entity, &memento.header.id)?;
                continue;
            };
            self.wire_header(staged, entity.as_ref(), &memento.header)?;
            let detail = self.entity_detail(staged, memento)?;
            entity.wire(|state| state.detail = detail);
            self.reconstruct(staged, entity.as_ref())?;
        }

        for kind in ADJUNCT_KINDS {
            for memento in loaded.adjuncts(kind) {
                let Some(adjunct) = staged.adjunct(kind, &memento.header.id) else {
                    self.handler.on_not_found(kind, &memento.header.id)?;
                    continue;
                };
                self.wire_header(staged, adjunct.as_ref(), &memento.header)?;
                self.reconstruct(staged, adjunct.as_ref())?;
            }
        }

        self.attach_adjuncts(staged)
    }

    fn entity_detail(&self, staged: &mut Registry, memento: &EntityMemento) -> Result<EntityDetail> {
        let members: Vec<String> = memento.members_ids.iter().cloned().collect();
        Ok(EntityDetail {
            parent_id: self.resolve_opt(staged, ObjectKind::Entity, memento.parent_id.as_deref())?,
            children_ids: self.resolve_all(staged, ObjectKind::Entity, &memento.children_ids)?,
            members_ids: self
                .resolve_all(staged, ObjectKind::Entity, &members)?
                .into_iter()
                .collect::<BTreeSet<_>>(),
            location_ids: self.resolve_all(staged, ObjectKind::Location, &memento.location_ids)?,
            policy_ids: self.resolve_adjuncts(staged, ObjectKind::Policy, &memento.policy_ids)?,
            enricher_ids: self.resolve_adjuncts(staged, ObjectKind::Enricher, &memento.enricher_ids)?,
            feed_ids: self.resolve_adjuncts(staged, ObjectKind::Feed, &memento.feed_ids)?,
            attributes: memento.attributes.clone(),
        })
    }

    /// Ids of a kind that is not persisted are dropped without reporting
    fn resolve_adjuncts(&self, staged: &mut Registry, kind: ObjectKind, ids: &[String]) -> Result<Vec<String>> {
        if !self.engine.config.persists(kind) {
            return Ok(Vec::new());
        }
        self.resolve_all(staged, kind, ids)
    }

    /// Attach every adjunct an entity lists; a rejected adjunct is dropped
    /// from the entity's list.
    fn attach_adjuncts(&self, staged: &mut Registry) -> Result<()> {
        let entities: Vec<Arc<Entity>> = staged.entities().cloned().collect();
        for entity in entities {
            for kind in ADJUNCT_KINDS {
                let mut rejected = Vec::new();
                for adjunct_id in entity.adjunct_ids(kind) {
                    let Some(adjunct) = staged.adjunct(kind, &adjunct_id) else {
                        continue;
                    };
                    match adjunct.behaviour().on_attach(entity.id()) {
                        Ok(()) => adjunct.wire(|state| {
                            state.detail.entity_id = Some(entity.id().to_string())
                        }),
                        Err(e) => {
                            let reason = e.to_string();
                            match kind {
                                ObjectKind::Policy => self.handler.on_add_policy_failed(entity.id(), &adjunct_id, &reason)?,
                                ObjectKind::Enricher => self.handler.on_add_enricher_failed(entity.id(), &adjunct_id, &reason)?,
                                _ => self.handler.on_add_feed_failed(entity.id(), &adjunct_id, &reason)?,
                            }
                            rejected.push(adjunct_id);
                        }
                    }
                }
                if !rejected.is_empty() {
                    entity.wire(|state| {
                        if let Some(ids) = state.detail.adjunct_ids_mut(kind) {
                            ids.retain(|id| !rejected.contains(id));
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Phase 4
    fn manage(&self, staged: &Registry) -> Result<()> {
        for item in staged.catalog_items() {
            self.manage_one(staged, item.as_ref())?;
        }

        let locations: Vec<_> = staged.locations().cloned().collect();
        let order: Vec<(String, Option<String>)> =
            locations.iter().map(|l| (l.id().to_string(), l.parent_id())).collect();
        for index in parent_first(&borrowed(&order)) {
            self.manage_one(staged, locations[index].as_ref())?;
        }

        let entities: Vec<_> = staged.entities().cloned().collect();
        let order: Vec<(String, Option<String>)> =
            entities.iter().map(|e| (e.id().to_string(), e.parent_id())).collect();
        for index in parent_first(&borrowed(&order)) {
            self.manage_one(staged, entities[index].as_ref())?;
        }

        for kind in ADJUNCT_KINDS {
            for adjunct in staged.adjuncts(kind) {
                self.manage_one(staged, adjunct.as_ref())?;
            }
        }
        Ok(())
    }

    fn manage_one<D>(&self, staged: &Registry, object: &LiveObject<D>) -> Result<()> {
        match object.behaviour().on_manage(staged, object.id()) {
            Ok(()) => {
                object.set_managed(true);
                Ok(())
            }
            Err(e) => self
                .handler
                .on_manage_failed(object.kind(), object.id(), &e.to_string()),
        }
    }

    fn reconstruct<D>(&self, staged: &Registry, object: &LiveObject<D>) -> Result<()> {
        match object.behaviour().on_reconstruct(staged, object.id()) {
            Ok(()) => Ok(()),
            Err(e) => self
                .handler
                .on_rebind_failed(object.kind(), object.id(), &e.to_string()),
        }
    }

    fn wire_header<D>(
        &self,
        staged: &mut Registry,
        object: &LiveObject<D>,
        header: &MementoHeader,
    ) -> Result<()> {
        let catalog_item_id = match &header.catalog_item_id {
            Some(id) if self.engine.config.persists(ObjectKind::CatalogItem) => {
                self.resolve_ref(staged, ObjectKind::CatalogItem, id)?
            }
            other => other.clone(),
        };
        let config = self.resolve_config(staged, object, &header.config)?;
        object.wire(|state: &mut ObjectState<D>| {
            state.display_name = header.display_name.clone();
            state.catalog_item_id = catalog_item_id;
            state.tags = header.tags.clone();
            state.config = config;
        });
        Ok(())
    }

    /// Resolve references inside config values and offer each entry to the
    /// object's behaviour. Rejected entries are left out.
    fn resolve_config<D>(
        &self,
        staged: &mut Registry,
        object: &LiveObject<D>,
        config: &ConfigMap,
    ) -> Result<ConfigMap> {
        let behaviour: &Arc<dyn Behaviour> = object.behaviour();
        let mut out = ConfigMap::new();
        for (key, value) in config {
            let mut failure = None;
            let resolved = resolve_refs(value, &mut |reference: &ConfigRef| {
                if failure.is_some() {
                    return None;
                }
                match self.resolve_config_ref(staged, reference) {
                    Ok(value) => value,
                    Err(e) => {
                        failure = Some(e);
                        None
                    }
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }
            let Some(resolved) = resolved else {
                continue;
            };
            if let Err(e) = behaviour.accept_config(key, &resolved) {
                self.handler
                    .on_add_config_failed(object.kind(), object.id(), key, &e.to_string())?;
                continue;
            }
            out.insert(key.clone(), resolved);
        }
        Ok(out)
    }

    fn resolve_config_ref(&self, staged: &mut Registry, reference: &ConfigRef) -> Result<Option<Value>> {
        match reference.kind {
            Some(kind) => Ok(self
                .resolve_ref(staged, kind, &reference.id)?
                .map(|id| ConfigRef::typed(kind, id).to_value())),
            None => {
                if staged.find_any(&reference.id).is_some() {
                    return Ok(Some(reference.to_value()));
                }
                Ok(self
                    .handler
                    .on_dangling_untyped_ref(&reference.id)?
                    .map(|substitute| {
                        let value = ConfigRef::untyped(substitute.id()).to_value();
                        staged.adopt(substitute);
                        value
                    }))
            }
        }
    }

    /// The id to use for a reference: itself if present, a substitute chosen
    /// by the handler, or `None` to drop it.
    fn resolve_ref(&self, staged: &mut Registry, kind: ObjectKind, id: &str) -> Result<Option<String>> {
        if staged.contains(kind, id) {
            return Ok(Some(id.to_string()));
        }
        let substitute = match kind {
            ObjectKind::Entity => self.handler.on_dangling_entity_ref(id)?.map(LiveRef::Entity),
            ObjectKind::Location => self.handler.on_dangling_location_ref(id)?.map(LiveRef::Location),
            ObjectKind::CatalogItem => self
                .handler
                .on_dangling_catalog_item_ref(id)?
                .map(LiveRef::CatalogItem),
            ObjectKind::Policy => self.handler.on_dangling_policy_ref(id)?.map(LiveRef::Adjunct),
            ObjectKind::Enricher => self.handler.on_dangling_enricher_ref(id)?.map(LiveRef::Adjunct),
            ObjectKind::Feed => self.handler.on_dangling_feed_ref(id)?.map(LiveRef::Adjunct),
        };
        Ok(substitute.map(|substitute| {
            let substitute_id = substitute.id().to_string();
            staged.adopt(substitute);
            substitute_id
        }))
    }

    fn resolve_opt(&self, staged: &mut Registry, kind: ObjectKind, id: Option<&str>) -> Result<Option<String>> {
        match id {
            Some(id) => self.resolve_ref(staged, kind, id),
            None => Ok(None),
        }
    }

    /// Resolve a list of ids, dropping unresolved ones and duplicates
    fn resolve_all(&self, staged: &mut Registry, kind: ObjectKind, ids: &[String]) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(resolved) = self.resolve_ref(staged, kind, id)? {
                if !out.contains(&resolved) {
                    out.push(resolved);
                }
            }
        }
        Ok(out)
    }
}

fn borrowed(nodes: &[(String, Option<String>)]) -> Vec<(&str, Option<&str>)> {
    nodes
        .iter()
        .map(|(id, parent)| (id.as_str(), parent.as_deref()))
        .collect()
}

/// Indices of `nodes` ordered so that every parent present in the set comes
/// before its children. Relative order is otherwise kept; cycles are broken
/// at the first node visited.
fn parent_first(nodes: &[(&str, Option<&str>)]) -> Vec<usize> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (*id, i))
        .collect();
    let mut visited = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());

    for start in 0..nodes.len() {
        // Walk up to the highest unvisited ancestor, then emit downwards.
        let mut chain = Vec::new();
        let mut current = Some(start);
        while let Some(i) = current {
            if visited[i] {
                break;
            }
            visited[i] = true;
            chain.push(i);
            current = nodes[i].1.and_then(|parent| index.get(parent).copied());
        }
        order.extend(chain.into_iter().rev());
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_first_orders_ancestors() {
        let nodes = [
            ("c", Some("b")),
            ("a", None),
            ("b", Some("a")),
            ("x", Some("missing")),
        ];
        let order: Vec<&str> = parent_first(&nodes).into_iter().map(|i| nodes[i].0).collect();
        assert_eq!(order, vec!["a", "b", "c", "x"]);
    }

    #[test]
    fn test_parent_first_survives_cycles() {
        let nodes = [("a", Some("b")), ("b", Some("a"))];
        let order = parent_first(&nodes);
        assert_eq!(order.len(), 2);
    }
}
