/*!
Live management objects.

Every persisted kind is a [`LiveObject`] parameterised by its kind-specific
detail: [`Entity`], [`Location`], [`Adjunct`] (policies, enrichers and feeds)
and [`CatalogItem`]. Cross-object relationships are held as ids and resolved
through a [`Lookup`], never as owning pointers, so parent/child and
group/member cycles need no special handling.

Shared behaviour is split into small capability traits ([`Identifiable`],
[`Configurable`], [`Taggable`], [`Rebindable`]). Type-specific behaviour is
supplied by a [`Behaviour`] created from the [`TypeRegistry`].
*/

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::BoxError;
use crate::memento::{
    AdjunctMemento, CatalogItemMemento, ConfigMap, EntityMemento, LocationMemento, Memento,
    MementoHeader, ObjectKind,
};
use crate::tracker::{ChangeListener, NoopListener};
use crate::{PersistError, Result};

pub mod context;
pub mod registry;
pub mod types;

pub use context::{ManagementContext, ObjectSpec};
pub use registry::{Lookup, Registry};
pub use types::{BehaviourFactory, NoopBehaviour, TypeRegistry};

/// Type-specific hooks for a live object
///
/// All hooks default to doing nothing. Hooks that receive a [`Lookup`] must
/// use it, not the management context, to reach other objects: during a
/// rebind the context is locked and the lookup is the graph being built.
pub trait Behaviour: Send + Sync {
    /// Validate a config entry before it is applied
    fn accept_config(&self, _key: &str, _value: &Value) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called once the object's config and relationships are wired
    fn on_reconstruct(&self, _lookup: &dyn Lookup, _id: &str) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called when the object becomes managed; parents are managed first
    fn on_manage(&self, _lookup: &dyn Lookup, _id: &str) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Adjust the config captured in a memento
    fn on_snapshot(&self, _config: &mut ConfigMap) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called when an adjunct is attached to its owning entity
    fn on_attach(&self, _entity_id: &str) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

pub trait Identifiable {
    fn id(&self) -> &str;
    fn kind(&self) -> ObjectKind;
    fn type_name(&self) -> &str;
    fn display_name(&self) -> Option<String>;
}

pub trait Configurable {
    fn config(&self, key: &str) -> Option<Value>;
    fn config_map(&self) -> ConfigMap;
    fn set_config(&self, key: &str, value: Value) -> Result<()>;
    fn remove_config(&self, key: &str) -> Result<Option<Value>>;
}

pub trait Taggable {
    fn tags(&self) -> Vec<String>;
    /// Returns false if the tag was already present
    fn add_tag(&self, tag: &str) -> Result<bool>;
    fn remove_tag(&self, tag: &str) -> Result<bool>;
}

/// Objects that can produce a memento of their current state
pub trait Rebindable: Identifiable + Send + Sync {
    fn memento(&self) -> Result<Memento>;
}

/// State common to every live object plus the kind-specific `detail`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectState<D> {
    pub display_name: Option<String>,
    pub catalog_item_id: Option<String>,
    pub config: ConfigMap,
    pub tags: Vec<String>,
    pub detail: D,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityDetail {
    pub parent_id: Option<String>,
    pub children_ids: Vec<String>,
    pub members_ids: BTreeSet<String>,
    pub location_ids: Vec<String>,
    pub policy_ids: Vec<String>,
    pub enricher_ids: Vec<String>,
    pub feed_ids: Vec<String>,
    pub attributes: ConfigMap,
}

impl EntityDetail {
    pub fn adjunct_ids(&self, kind: ObjectKind) -> &[String] {
        match kind {
            ObjectKind::Policy => &self.policy_ids,
            ObjectKind::Enricher => &self.enricher_ids,
            ObjectKind::Feed => &self.feed_ids,
            _ => &[],
        }
    }

    pub(crate) fn adjunct_ids_mut(&mut self, kind: ObjectKind) -> Option<&mut Vec<String>> {
        match kind {
            ObjectKind::Policy => Some(&mut self.policy_ids),
            ObjectKind::Enricher => Some(&mut self.enricher_ids),
            ObjectKind::Feed => Some(&mut self.feed_ids),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationDetail {
    pub parent_id: Option<String>,
    pub children_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdjunctDetail {
    /// Owning entity, set when the adjunct is attached
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogItemDetail {
    pub symbolic_name: String,
    pub version: String,
    pub plan_yaml: Option<String>,
    pub libraries: Vec<String>,
    pub deprecated: bool,
    pub disabled: bool,
}

/// A managed object of any kind
pub struct LiveObject<D> {
    id: String,
    kind: ObjectKind,
    type_name: String,
    behaviour: Arc<dyn Behaviour>,
    read_only: AtomicBool,
    managed: AtomicBool,
    listener: RwLock<Arc<dyn ChangeListener>>,
    state: RwLock<ObjectState<D>>,
}

pub type Entity = LiveObject<EntityDetail>;
pub type Location = LiveObject<LocationDetail>;
pub type Adjunct = LiveObject<AdjunctDetail>;
pub type CatalogItem = LiveObject<CatalogItemDetail>;

impl<D: Default> LiveObject<D> {
    /// An unwired placeholder carrying only identity and behaviour
    pub(crate) fn skeleton(
        kind: ObjectKind,
        id: impl Into<String>,
        type_name: impl Into<String>,
        behaviour: Arc<dyn Behaviour>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            type_name: type_name.into(),
            behaviour,
            read_only: AtomicBool::new(false),
            managed: AtomicBool::new(false),
            listener: RwLock::new(Arc::new(NoopListener)),
            state: RwLock::new(ObjectState::default()),
        }
    }
}

impl<D> LiveObject<D> {
    pub fn behaviour(&self) -> &Arc<dyn Behaviour> {
        &self.behaviour
    }

    /// Objects mirrored by a hot-standby or hot-backup node refuse mutation
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn is_managed(&self) -> bool {
        self.managed.load(Ordering::Acquire)
    }

    pub(crate) fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    pub(crate) fn set_managed(&self, managed: bool) {
        self.managed.store(managed, Ordering::Release);
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn ChangeListener>) {
        *self.listener.write() = listener;
    }

    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&ObjectState<D>) -> T) -> T {
        f(&self.state.read())
    }

    /// Mutate during wiring: no read-only check and no change notification
    pub(crate) fn wire<T>(&self, f: impl FnOnce(&mut ObjectState<D>) -> T) -> T {
        f(&mut self.state.write())
    }

    /// Mutate a live object and report it dirty
    pub(crate) fn update<T>(&self, f: impl FnOnce(&mut ObjectState<D>) -> T) -> Result<T> {
        self.ensure_writable()?;
        let out = f(&mut self.state.write());
        self.listener.read().on_changed(self.kind, &self.id);
        Ok(out)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(PersistError::invalid_state(format!(
                "{} {} is read-only",
                self.kind, self.id
            )));
        }
        Ok(())
    }

    fn header(&self) -> Result<MementoHeader> {
        let state = self.state.read();
        let mut config = state.config.clone();
        self.behaviour.on_snapshot(&mut config).map_err(|e| {
            PersistError::Persistence(format!("snapshot hook failed for {} {}: {e}", self.kind, self.id))
        })?;
        Ok(MementoHeader {
            id: self.id.clone(),
            type_name: self.type_name.clone(),
            display_name: state.display_name.clone(),
            catalog_item_id: state.catalog_item_id.clone(),
            config,
            tags: state.tags.clone(),
        })
    }
}

impl<D: Clone> LiveObject<D> {
    pub fn state(&self) -> ObjectState<D> {
        self.state.read().clone()
    }

    pub fn detail(&self) -> D {
        self.state.read().detail.clone()
    }
}

impl<D> fmt::Debug for LiveObject<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveObject")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("type", &self.type_name)
            .field("read_only", &self.is_read_only())
            .field("managed", &self.is_managed())
            .finish()
    }
}

impl<D> Identifiable for LiveObject<D> {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ObjectKind {
        self.kind
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn display_name(&self) -> Option<String> {
        self.state.read().display_name.clone()
    }
}

impl<D> Configurable for LiveObject<D> {
    fn config(&self, key: &str) -> Option<Value> {
        self.state.read().config.get(key).cloned()
    }

    fn config_map(&self) -> ConfigMap {
        self.state.read().config.clone()
    }

    fn set_config(&self, key: &str, value: Value) -> Result<()> {
        self.ensure_writable()?;
        self.behaviour.accept_config(key, &value).map_err(|e| {
            PersistError::validation(format!("{} {} rejected config '{key}': {e}", self.kind, self.id))
        })?;
        self.update(|state| {
            state.config.insert(key.to_string(), value);
        })
    }

    fn remove_config(&self, key: &str) -> Result<Option<Value>> {
        self.update(|state| state.config.remove(key))
    }
}

impl<D> Taggable for LiveObject<D> {
    fn tags(&self) -> Vec<String> {
        self.state.read().tags.clone()
    }

    fn add_tag(&self, tag: &str) -> Result<bool> {
        if self.state.read().tags.iter().any(|t| t == tag) {
            return Ok(false);
        }
        self.update(|state| {
            state.tags.push(tag.to_string());
            true
        })
    }

    fn remove_tag(&self, tag: &str) -> Result<bool> {
        self.update(|state| {
            let before = state.tags.len();
            state.tags.retain(|t| t != tag);
            before != state.tags.len()
        })
    }
}

impl Entity {
    pub fn parent_id(&self) -> Option<String> {
        self.state.read().detail.parent_id.clone()
    }

    pub fn children_ids(&self) -> Vec<String> {
        self.state.read().detail.children_ids.clone()
    }

    pub fn members_ids(&self) -> BTreeSet<String> {
        self.state.read().detail.members_ids.clone()
    }

    pub fn location_ids(&self) -> Vec<String> {
        self.state.read().detail.location_ids.clone()
    }

    pub fn adjunct_ids(&self, kind: ObjectKind) -> Vec<String> {
        self.state.read().detail.adjunct_ids(kind).to_vec()
    }

    /// An application is an entity without a parent
    pub fn is_application(&self) -> bool {
        self.state.read().detail.parent_id.is_none()
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.state.read().detail.attributes.get(name).cloned()
    }

    /// Publish a sensor value
    pub fn set_attribute(&self, name: &str, value: Value) -> Result<()> {
        self.update(|state| {
            state.detail.attributes.insert(name.to_string(), value);
        })
    }
}

impl Location {
    pub fn parent_id(&self) -> Option<String> {
        self.state.read().detail.parent_id.clone()
    }

    pub fn children_ids(&self) -> Vec<String> {
        self.state.read().detail.children_ids.clone()
    }
}

impl Adjunct {
    pub fn entity_id(&self) -> Option<String> {
        self.state.read().detail.entity_id.clone()
    }
}

impl CatalogItem {
    pub fn symbolic_name(&self) -> String {
        self.state.read().detail.symbolic_name.clone()
    }

    pub fn version(&self) -> String {
        self.state.read().detail.version.clone()
    }
}

impl Rebindable for Entity {
    fn memento(&self) -> Result<Memento> {
        let header = self.header()?;
        let detail = self.detail();
        Ok(Memento::Entity(EntityMemento {
            header,
            parent_id: detail.parent_id,
            children_ids: detail.children_ids,
            members_ids: detail.members_ids,
            location_ids: detail.location_ids,
            policy_ids: detail.policy_ids,
            enricher_ids: detail.enricher_ids,
            feed_ids: detail.feed_ids,
            attributes: detail.attributes,
        }))
    }
}

impl Rebindable for Location {
    fn memento(&self) -> Result<Memento> {
        let header = self.header()?;
        let detail = self.detail();
        Ok(Memento::Location(LocationMemento {
            header,
            parent_id: detail.parent_id,
            children_ids: detail.children_ids,
        }))
    }
}

impl Rebindable for Adjunct {
    fn memento(&self) -> Result<Memento> {
        Memento::adjunct(
            self.kind,
            AdjunctMemento {
                header: self.header()?,
            },
        )
    }
}

impl Rebindable for CatalogItem {
    fn memento(&self) -> Result<Memento> {
        let header = self.header()?;
        let detail = self.detail();
        Ok(Memento::CatalogItem(CatalogItemMemento {
            header,
            symbolic_name: detail.symbolic_name,
            version: detail.version,
            plan_yaml: detail.plan_yaml,
            libraries: detail.libraries,
            deprecated: detail.deprecated,
            disabled: detail.disabled,
        }))
    }
}

/// A reference to a live object whose kind is only known at runtime
#[derive(Debug, Clone)]
pub enum LiveRef {
    CatalogItem(Arc<CatalogItem>),
    Location(Arc<Location>),
    Entity(Arc<Entity>),
    Adjunct(Arc<Adjunct>),
}

impl LiveRef {
    pub fn kind(&self) -> ObjectKind {
        match self {
            LiveRef::CatalogItem(_) => ObjectKind::CatalogItem,
            LiveRef::Location(_) => ObjectKind::Location,
            LiveRef::Entity(_) => ObjectKind::Entity,
            LiveRef::Adjunct(a) => a.kind(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            LiveRef::CatalogItem(o) => o.id(),
            LiveRef::Location(o) => o.id(),
            LiveRef::Entity(o) => o.id(),
            LiveRef::Adjunct(o) => o.id(),
        }
    }

    pub fn is_managed(&self) -> bool {
        match self {
            LiveRef::CatalogItem(o) => o.is_managed(),
            LiveRef::Location(o) => o.is_managed(),
            LiveRef::Entity(o) => o.is_managed(),
            LiveRef::Adjunct(o) => o.is_managed(),
        }
    }

    pub(crate) fn set_managed(&self, managed: bool) {
        match self {
            LiveRef::CatalogItem(o) => o.set_managed(managed),
            LiveRef::Location(o) => o.set_managed(managed),
            LiveRef::Entity(o) => o.set_managed(managed),
            LiveRef::Adjunct(o) => o.set_managed(managed),
        }
    }

    /// Switch between mirrored (read-only) and master ownership
    pub(crate) fn attach(&self, listener: Arc<dyn ChangeListener>, read_only: bool) {
        match self {
            LiveRef::CatalogItem(o) => {
                o.set_listener(listener);
                o.set_read_only(read_only);
            }
            LiveRef::Location(o) => {
                o.set_listener(listener);
                o.set_read_only(read_only);
            }
            LiveRef::Entity(o) => {
                o.set_listener(listener);
                o.set_read_only(read_only);
            }
            LiveRef::Adjunct(o) => {
                o.set_listener(listener);
                o.set_read_only(read_only);
            }
        }
    }

    /// Whether both refer to the same live instance, not merely the same id
    pub fn same_object(&self, other: &LiveRef) -> bool {
        match (self, other) {
            (LiveRef::CatalogItem(a), LiveRef::CatalogItem(b)) => Arc::ptr_eq(a, b),
            (LiveRef::Location(a), LiveRef::Location(b)) => Arc::ptr_eq(a, b),
            (LiveRef::Entity(a), LiveRef::Entity(b)) => Arc::ptr_eq(a, b),
            (LiveRef::Adjunct(a), LiveRef::Adjunct(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_rebindable(&self) -> Arc<dyn Rebindable> {
        match self {
            LiveRef::CatalogItem(o) => o.clone(),
            LiveRef::Location(o) => o.clone(),
            LiveRef::Entity(o) => o.clone(),
            LiveRef::Adjunct(o) => o.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ChangeTracker;
    use serde_json::json;

    struct RejectNegativePort;

    impl Behaviour for RejectNegativePort {
        fn accept_config(&self, key: &str, value: &Value) -> std::result::Result<(), BoxError> {
            if key == "port" && value.as_i64().is_some_and(|p| p < 0) {
                return Err("port must be positive".into());
            }
            Ok(())
        }

        fn on_snapshot(&self, config: &mut ConfigMap) -> std::result::Result<(), BoxError> {
            config.insert("snapshotted".to_string(), json!(true));
            Ok(())
        }
    }

    fn entity(id: &str) -> Entity {
        Entity::skeleton(ObjectKind::Entity, id, "web.Server", Arc::new(RejectNegativePort))
    }

    #[test]
    fn test_set_config_notifies_listener() {
        let tracker = Arc::new(ChangeTracker::new());
        let e = entity("e1");
        e.set_listener(tracker.clone());

        e.set_config("port", json!(8080)).unwrap();
        assert_eq!(e.config("port"), Some(json!(8080)));
        assert!(tracker.is_dirty(ObjectKind::Entity, "e1"));
    }

    #[test]
    fn test_behaviour_can_reject_config() {
        let e = entity("e1");
        let err = e.set_config("port", json!(-1)).unwrap_err();
        assert!(err.to_string().contains("port must be positive"));
        assert!(e.config("port").is_none());
    }

    #[test]
    fn test_read_only_refuses_mutation() {
        let e = entity("e1");
        e.set_read_only(true);

        assert!(matches!(
            e.set_config("a", json!(1)),
            Err(PersistError::InvalidState(_))
        ));
        assert!(e.add_tag("x").is_err());
        assert!(e.set_attribute("up", json!(true)).is_err());
    }

    #[test]
    fn test_tags_are_unique() {
        let e = entity("e1");
        assert!(e.add_tag("prod").unwrap());
        assert!(!e.add_tag("prod").unwrap());
        assert_eq!(e.tags(), vec!["prod"]);
        assert!(e.remove_tag("prod").unwrap());
        assert!(e.tags().is_empty());
    }

    #[test]
    fn test_entity_memento_captures_detail_and_snapshot_hook() {
        let e = entity("e1");
        e.wire(|state| {
            state.display_name = Some("Web".to_string());
            state.detail.parent_id = Some("app".to_string());
            state.detail.policy_ids = vec!["p1".to_string()];
        });
        e.set_attribute("service.up", json!(true)).unwrap();

        let Memento::Entity(memento) = e.memento().unwrap() else {
            panic!("expected entity memento");
        };
        assert_eq!(memento.header.display_name.as_deref(), Some("Web"));
        assert_eq!(memento.parent_id.as_deref(), Some("app"));
        assert_eq!(memento.policy_ids, vec!["p1"]);
        assert_eq!(memento.attributes["service.up"], json!(true));
        assert_eq!(memento.header.config["snapshotted"], json!(true));
        assert!(e.config("snapshotted").is_none());
    }

    #[test]
    fn test_adjunct_memento_keeps_kind() {
        let feed = Adjunct::skeleton(ObjectKind::Feed, "f1", "http.Feed", Arc::new(NoopBehaviour));
        assert_eq!(feed.memento().unwrap().kind(), ObjectKind::Feed);
    }
}
