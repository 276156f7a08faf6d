//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rebind_core::{
    ManagementContext, MemoryStore, ObjectKind, PersistenceConfig, RawStore, RebindManager,
    TypeRegistry,
};

pub fn types() -> Arc<TypeRegistry> {
    let types = Arc::new(TypeRegistry::new());
    types.register_plain(ObjectKind::Entity, "app");
    types.register_plain(ObjectKind::Entity, "server");
    types.register_plain(ObjectKind::Entity, "group");
    types.register_plain(ObjectKind::Location, "region");
    types.register_plain(ObjectKind::Location, "zone");
    types.register_plain(ObjectKind::Policy, "autoscaler");
    types.register_plain(ObjectKind::Enricher, "aggregator");
    types.register_plain(ObjectKind::Feed, "http-poll");
    types.register_plain(ObjectKind::CatalogItem, "blueprint");
    types
}

pub fn config() -> PersistenceConfig {
    PersistenceConfig {
        persist_period: Duration::from_millis(20),
        mirror_period: Duration::from_millis(20),
        ..PersistenceConfig::default()
    }
}

/// Periodic flushes effectively never fire; tests force them
pub fn manual_config() -> PersistenceConfig {
    PersistenceConfig {
        persist_period: Duration::from_secs(3600),
        ..config()
    }
}

pub fn context(node_id: &str, types: Arc<TypeRegistry>) -> Arc<ManagementContext> {
    let context = Arc::new(ManagementContext::new(node_id, types));
    context.init();
    context
}

/// A manager over `store` on a fresh context
pub fn manager(node_id: &str, store: &MemoryStore) -> RebindManager {
    manager_with_types(node_id, store, types())
}

pub fn manager_with_types(node_id: &str, store: &MemoryStore, types: Arc<TypeRegistry>) -> RebindManager {
    let manager = RebindManager::new(context(node_id, types), config());
    let store: Arc<dyn RawStore> = Arc::new(store.clone());
    manager.set_store(store);
    manager
}

/// A manager over `store` with persistence running and flushes forced by hand
pub fn persisting(node_id: &str, store: &MemoryStore) -> RebindManager {
    let manager = RebindManager::new(context(node_id, types()), manual_config());
    let store: Arc<dyn RawStore> = Arc::new(store.clone());
    manager.set_store(store);
    manager.start_persistence().unwrap();
    manager
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
