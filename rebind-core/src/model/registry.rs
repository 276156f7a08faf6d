//! The set of live objects known to one management context.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Adjunct, CatalogItem, Entity, Identifiable, LiveRef, Location, Rebindable};
use crate::memento::ObjectKind;

/// Read access to a graph of live objects by id
pub trait Lookup {
    fn entity(&self, id: &str) -> Option<Arc<Entity>>;
    fn location(&self, id: &str) -> Option<Arc<Location>>;
    fn adjunct(&self, kind: ObjectKind, id: &str) -> Option<Arc<Adjunct>>;
    fn catalog_item(&self, id: &str) -> Option<Arc<CatalogItem>>;

    fn find(&self, kind: ObjectKind, id: &str) -> Option<LiveRef> {
        match kind {
            ObjectKind::Entity => self.entity(id).map(LiveRef::Entity),
            ObjectKind::Location => self.location(id).map(LiveRef::Location),
            ObjectKind::CatalogItem => self.catalog_item(id).map(LiveRef::CatalogItem),
            ObjectKind::Policy | ObjectKind::Enricher | ObjectKind::Feed => {
                self.adjunct(kind, id).map(LiveRef::Adjunct)
            }
        }
    }

    /// Find an object of any kind, searching kinds in tier order
    fn find_any(&self, id: &str) -> Option<LiveRef> {
        ObjectKind::ALL.into_iter().find_map(|kind| self.find(kind, id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    catalog_items: BTreeMap<String, Arc<CatalogItem>>,
    locations: BTreeMap<String, Arc<Location>>,
    entities: BTreeMap<String, Arc<Entity>>,
    policies: BTreeMap<String, Arc<Adjunct>>,
    enrichers: BTreeMap<String, Arc<Adjunct>>,
    feeds: BTreeMap<String, Arc<Adjunct>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_entity(&mut self, entity: Arc<Entity>) {
        self.entities.insert(entity.id().to_string(), entity);
    }

    pub fn insert_location(&mut self, location: Arc<Location>) {
        self.locations.insert(location.id().to_string(), location);
    }

    pub fn insert_catalog_item(&mut self, item: Arc<CatalogItem>) {
        self.catalog_items.insert(item.id().to_string(), item);
    }

    pub fn insert_adjunct(&mut self, adjunct: Arc<Adjunct>) {
        if let Some(map) = self.adjunct_map_mut(adjunct.kind()) {
            map.insert(adjunct.id().to_string(), adjunct);
        }
    }

    /// Insert an object of any kind unless its id is already taken
    pub fn adopt(&mut self, object: LiveRef) {
        if self.find(object.kind(), object.id()).is_some() {
            return;
        }
        match object {
            LiveRef::CatalogItem(o) => self.insert_catalog_item(o),
            LiveRef::Location(o) => self.insert_location(o),
            LiveRef::Entity(o) => self.insert_entity(o),
            LiveRef::Adjunct(o) => self.insert_adjunct(o),
        }
    }

    pub fn remove(&mut self, kind: ObjectKind, id: &str) -> Option<LiveRef> {
        match kind {
            ObjectKind::CatalogItem => self.catalog_items.remove(id).map(LiveRef::CatalogItem),
            ObjectKind::Location => self.locations.remove(id).map(LiveRef::Location),
            ObjectKind::Entity => self.entities.remove(id).map(LiveRef::Entity),
            _ => self
                .adjunct_map_mut(kind)
                .and_then(|m| m.remove(id))
                .map(LiveRef::Adjunct),
        }
    }

    pub fn contains(&self, kind: ObjectKind, id: &str) -> bool {
        self.find(kind, id).is_some()
    }

    pub fn ids(&self, kind: ObjectKind) -> Vec<String> {
        match kind {
            ObjectKind::CatalogItem => self.catalog_items.keys().cloned().collect(),
            ObjectKind::Location => self.locations.keys().cloned().collect(),
            ObjectKind::Entity => self.entities.keys().cloned().collect(),
            _ => self
                .adjunct_map(kind)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    pub fn len(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::CatalogItem => self.catalog_items.len(),
            ObjectKind::Location => self.locations.len(),
            ObjectKind::Entity => self.entities.len(),
            _ => self.adjunct_map(kind).map_or(0, BTreeMap::len),
        }
    }

    pub fn total(&self) -> usize {
        ObjectKind::ALL.into_iter().map(|k| self.len(k)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.entities.values()
    }

    pub fn locations(&self) -> impl Iterator<Item = &Arc<Location>> {
        self.locations.values()
    }

    pub fn catalog_items(&self) -> impl Iterator<Item = &Arc<CatalogItem>> {
        self.catalog_items.values()
    }

    pub fn adjuncts(&self, kind: ObjectKind) -> impl Iterator<Item = &Arc<Adjunct>> {
        self.adjunct_map(kind).into_iter().flat_map(|m| m.values())
    }

    /// Every object of every kind, in tier order
    pub fn all(&self) -> Vec<LiveRef> {
        ObjectKind::ALL
            .into_iter()
            .flat_map(|kind| self.all_of(kind))
            .collect()
    }

    pub fn all_of(&self, kind: ObjectKind) -> Vec<LiveRef> {
        match kind {
            ObjectKind::CatalogItem => self.catalog_items.values().cloned().map(LiveRef::CatalogItem).collect(),
            ObjectKind::Location => self.locations.values().cloned().map(LiveRef::Location).collect(),
            ObjectKind::Entity => self.entities.values().cloned().map(LiveRef::Entity).collect(),
            _ => self.adjuncts(kind).cloned().map(LiveRef::Adjunct).collect(),
        }
    }

    pub fn rebindable(&self, kind: ObjectKind, id: &str) -> Option<Arc<dyn Rebindable>> {
        self.find(kind, id).map(|o| o.as_rebindable())
    }

    /// Entities without a parent, in id order
    pub fn applications(&self) -> Vec<Arc<Entity>> {
        self.entities
            .values()
            .filter(|e| e.is_application())
            .cloned()
            .collect()
    }

    fn adjunct_map(&self, kind: ObjectKind) -> Option<&BTreeMap<String, Arc<Adjunct>>> {
        match kind {
            ObjectKind::Policy => Some(&self.policies),
            ObjectKind::Enricher => Some(&self.enrichers),
            ObjectKind::Feed => Some(&self.feeds),
            _ => None,
        }
    }

    fn adjunct_map_mut(&mut self, kind: ObjectKind) -> Option<&mut BTreeMap<String, Arc<Adjunct>>> {
        match kind {
            ObjectKind::Policy => Some(&mut self.policies),
            ObjectKind::Enricher => Some(&mut self.enrichers),
            ObjectKind::Feed => Some(&mut self.feeds),
            _ => None,
        }
    }
}

impl Lookup for Registry {
    fn entity(&self, id: &str) -> Option<Arc<Entity>> {
        self.entities.get(id).cloned()
    }

    fn location(&self, id: &str) -> Option<Arc<Location>> {
        self.locations.get(id).cloned()
    }

    fn adjunct(&self, kind: ObjectKind, id: &str) -> Option<Arc<Adjunct>> {
        self.adjunct_map(kind)?.get(id).cloned()
    }

    fn catalog_item(&self, id: &str) -> Option<Arc<CatalogItem>> {
        self.catalog_items.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NoopBehaviour;

    #[test]
    fn test_adjunct_kinds_are_separate_namespaces() {
        let mut registry = Registry::new();
        registry.insert_adjunct(Arc::new(Adjunct::skeleton(
            ObjectKind::Policy,
            "a1",
            "p",
            Arc::new(NoopBehaviour),
        )));

        assert!(registry.adjunct(ObjectKind::Policy, "a1").is_some());
        assert!(registry.adjunct(ObjectKind::Feed, "a1").is_none());
        assert_eq!(registry.find_any("a1").unwrap().kind(), ObjectKind::Policy);
        assert_eq!(registry.total(), 1);
    }

    #[test]
    fn test_adopt_keeps_existing() {
        let mut registry = Registry::new();
        let first = Arc::new(Entity::skeleton(ObjectKind::Entity, "e1", "t1", Arc::new(NoopBehaviour)));
        let second = Arc::new(Entity::skeleton(ObjectKind::Entity, "e1", "t2", Arc::new(NoopBehaviour)));
        registry.insert_entity(first);
        registry.adopt(LiveRef::Entity(second));

        assert_eq!(registry.entity("e1").unwrap().type_name(), "t1");
    }
}
