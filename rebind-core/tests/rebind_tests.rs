/*!
Integration tests for rebinding persisted graphs.
These tests persist a graph through one manager and rebuild it through another
sharing the same store.
*/

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rebind_core::{
    Behaviour, BoxError, CatalogItemDetail, ConfigRef, Configurable, Identifiable, Lookup,
    ManagementContext, ManagementNodeState, Memento, MemoryStore, ObjectKind, ObjectSpec,
    PersistError, PersistenceConfig, RawStore, RebindExceptionHandler, RebindFailureMode,
    RebindHandlerBuilder, RebindManager, TypeRegistry,
};
use serde_json::json;

use common::{manager, manager_with_types, persisting, types};

fn build_graph(context: &ManagementContext) {
    context
        .create_location(ObjectSpec::new("region").with_id("us-east").named("US East"))
        .unwrap();
    context
        .create_location(ObjectSpec::new("zone").with_id("us-east-1a").child_of("us-east"))
        .unwrap();
    context
        .add_catalog_item(
            ObjectSpec::new("blueprint").with_id("web-bp"),
            CatalogItemDetail {
                symbolic_name: "web".to_string(),
                version: "1.0".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

    context
        .create_entity(
            ObjectSpec::new("app")
                .with_id("web-app")
                .named("Web")
                .from_catalog("web-bp")
                .config("replicas", json!(3))
                .config("error_budget", json!(0.0015905896671941921))
                .tag("prod"),
        )
        .unwrap();
    context
        .create_entity(ObjectSpec::new("server").with_id("db").child_of("web-app"))
        .unwrap();
    context
        .create_entity(
            ObjectSpec::new("server")
                .with_id("frontend")
                .child_of("web-app")
                .config("backend", ConfigRef::typed(ObjectKind::Entity, "db").to_value()),
        )
        .unwrap();
    context
        .create_entity(ObjectSpec::new("group").with_id("cluster").child_of("web-app"))
        .unwrap();
    context.add_member("cluster", "frontend").unwrap();
    context.add_location_to_entity("web-app", "us-east-1a").unwrap();

    context
        .add_adjunct(
            "web-app",
            ObjectKind::Policy,
            ObjectSpec::new("autoscaler").with_id("scaler").config("max", json!(5)),
        )
        .unwrap();
    context
        .add_adjunct("frontend", ObjectKind::Enricher, ObjectSpec::new("aggregator").with_id("agg"))
        .unwrap();
    context
        .add_adjunct("db", ObjectKind::Feed, ObjectSpec::new("http-poll").with_id("health"))
        .unwrap();
}

fn snapshot(context: &ManagementContext) -> BTreeMap<(ObjectKind, String), Memento> {
    context.with_registry(|registry| {
        registry
            .all()
            .into_iter()
            .map(|object| {
                let memento = object.as_rebindable().memento().unwrap();
                ((object.kind(), object.id().to_string()), memento)
            })
            .collect()
    })
}

/// Persist the standard graph into `store` and return its snapshot
fn persist_graph(store: &MemoryStore) -> BTreeMap<(ObjectKind, String), Memento> {
    let source = persisting("node-a", store);
    build_graph(source.context());
    source.force_persist_now(true, None).unwrap();
    snapshot(source.context())
}

#[test]
fn test_round_trip_preserves_graph() {
    let store = MemoryStore::new();
    let original = persist_graph(&store);

    let target = manager("node-b", &store);
    let handler = target.new_rebind_handler();
    let roots = target.rebind(&handler, ManagementNodeState::Master).unwrap();

    let root_ids: Vec<_> = roots.iter().map(|e| e.id().to_string()).collect();
    assert_eq!(root_ids, vec!["web-app"]);
    assert_eq!(snapshot(target.context()), original);
    assert!(handler.warnings().is_empty());
    assert!(handler.exceptions().is_empty());

    let context = target.context();
    assert_eq!(
        context.entity("web-app").unwrap().config("error_budget"),
        Some(json!(0.0015905896671941921))
    );
    let scaler = context.adjunct(ObjectKind::Policy, "scaler").unwrap();
    assert_eq!(scaler.entity_id().as_deref(), Some("web-app"));
    assert!(scaler.is_managed());
    assert_eq!(
        context.entity("frontend").unwrap().config("backend"),
        Some(ConfigRef::typed(ObjectKind::Entity, "db").to_value())
    );
    assert!(!context.is_read_only());
}

#[test]
fn test_rebind_twice_is_idempotent() {
    let store = MemoryStore::new();
    persist_graph(&store);

    let target = manager("node-b", &store);
    target
        .rebind(&target.new_rebind_handler(), ManagementNodeState::Master)
        .unwrap();
    let first = snapshot(target.context());
    let old_app = target.context().entity("web-app").unwrap();

    target
        .rebind(&target.new_rebind_handler(), ManagementNodeState::Master)
        .unwrap();
    let second = snapshot(target.context());

    assert_eq!(first, second);
    let app = target.context().entity("web-app").unwrap();
    assert_eq!(app.children_ids(), vec!["db", "frontend", "cluster"]);
    assert!(app.is_managed());
    assert!(!old_app.is_managed());
}

#[test]
fn test_dangling_parent_becomes_root() {
    let store = MemoryStore::new();
    let source = persisting("node-a", &store);
    let context = source.context();
    context.create_entity(ObjectSpec::new("app").with_id("e1")).unwrap();
    context
        .create_entity(ObjectSpec::new("server").with_id("e2").child_of("e1"))
        .unwrap();
    source.force_persist_now(true, None).unwrap();
    store.delete(ObjectKind::Entity, "e1").unwrap();

    let target = manager("node-b", &store);
    let handler = RebindHandlerBuilder::default()
        .dangling_ref_failure_mode(RebindFailureMode::Continue)
        .build();
    let roots = target.rebind(&handler, ManagementNodeState::Master).unwrap();

    let root_ids: Vec<_> = roots.iter().map(|e| e.id().to_string()).collect();
    assert_eq!(root_ids, vec!["e2"]);
    assert_eq!(target.context().entity("e2").unwrap().parent_id(), None);
    assert_eq!(handler.warnings()[0].category(), "dangling_reference");
    assert_eq!(handler.warnings()[0].id(), "e1");
}

#[test]
fn test_dangling_config_reference_is_dropped() {
    let store = MemoryStore::new();
    persist_graph(&store);
    store.delete(ObjectKind::Entity, "db").unwrap();

    let target = manager("node-b", &store);
    let handler = target.new_rebind_handler();
    target.rebind(&handler, ManagementNodeState::Master).unwrap();

    let frontend = target.context().entity("frontend").unwrap();
    assert_eq!(frontend.config("backend"), None);
    assert_eq!(
        target.context().entity("web-app").unwrap().children_ids(),
        vec!["frontend", "cluster"]
    );
}

/// Records whether each entity's parent was managed and configured when the
/// entity itself was managed
struct ParentAware {
    seen: Arc<Mutex<Vec<(String, bool)>>>,
}

impl Behaviour for ParentAware {
    fn on_manage(&self, lookup: &dyn Lookup, id: &str) -> Result<(), BoxError> {
        let entity = lookup.entity(id).ok_or("entity missing from lookup")?;
        if let Some(parent_id) = entity.parent_id() {
            let parent = lookup.entity(&parent_id).ok_or("parent missing from lookup")?;
            let ready = parent.is_managed() && parent.config("ready") == Some(json!(true));
            self.seen.lock().push((id.to_string(), ready));
        }
        Ok(())
    }
}

#[test]
fn test_parents_are_managed_before_children() {
    let store = MemoryStore::new();
    let source = persisting("node-a", &store);
    let context = source.context();
    // Ids sort child-first so bundle order alone would manage children first.
    context
        .create_entity(ObjectSpec::new("server").with_id("zz-parent").config("ready", json!(true)))
        .unwrap();
    context
        .create_entity(
            ObjectSpec::new("server")
                .with_id("mm-child")
                .child_of("zz-parent")
                .config("ready", json!(true)),
        )
        .unwrap();
    context
        .create_entity(ObjectSpec::new("server").with_id("aa-grandchild").child_of("mm-child"))
        .unwrap();
    source.force_persist_now(true, None).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let target_types = types();
    let recorder = seen.clone();
    target_types.register(ObjectKind::Entity, "server", move || {
        Arc::new(ParentAware {
            seen: recorder.clone(),
        })
    });
    let target = manager_with_types("node-b", &store, target_types);
    target
        .rebind(&target.new_rebind_handler(), ManagementNodeState::Master)
        .unwrap();

    let seen = seen.lock().clone();
    assert_eq!(
        seen,
        vec![("mm-child".to_string(), true), ("aa-grandchild".to_string(), true)]
    );
}

fn store_with_one_corrupt_entity() -> MemoryStore {
    let store = MemoryStore::new();
    let source = persisting("node-a", &store);
    for i in 0..9 {
        source
            .context()
            .create_entity(ObjectSpec::new("app").with_id(format!("e{i}")))
            .unwrap();
    }
    source.force_persist_now(true, None).unwrap();
    store.put_raw(ObjectKind::Entity, "e-bad", &b"\x1f\x8b not really gzip"[..]);
    store
}

#[test]
fn test_corrupt_blob_under_continue() {
    let store = store_with_one_corrupt_entity();
    let target = manager("node-b", &store);

    let handler = RebindHandlerBuilder::uniform(RebindFailureMode::Continue).build();
    let roots = target.rebind(&handler, ManagementNodeState::Master).unwrap();

    assert_eq!(roots.len(), 9);
    assert_eq!(target.context().count(ObjectKind::Entity), 9);
    let warnings = handler.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].category(), "load");
    assert_eq!(warnings[0].id(), "e-bad");
    assert_eq!(target.metrics()["failures"]["load"], json!(1));
}

#[test]
fn test_corrupt_blob_under_fail_fast() {
    let store = store_with_one_corrupt_entity();
    let target = manager("node-b", &store);

    let handler = RebindHandlerBuilder::uniform(RebindFailureMode::FailFast).build();
    let err = target
        .rebind(&handler, ManagementNodeState::Master)
        .unwrap_err();

    assert!(matches!(&err, PersistError::Rebind(e) if e.is_abort()));
    assert!(err.to_string().contains("e-bad"));
    assert_eq!(target.context().count(ObjectKind::Entity), 0);
    assert_eq!(target.metrics()["rebind"]["failureCount"], json!(1));
}

#[test]
fn test_corrupt_blob_under_fail_at_end_keeps_live_graph() {
    let store = store_with_one_corrupt_entity();
    let target = manager("node-b", &store);
    target
        .context()
        .create_entity(ObjectSpec::new("app").with_id("existing"))
        .unwrap();

    let handler = RebindHandlerBuilder::uniform(RebindFailureMode::FailAtEnd).build();
    let err = target
        .rebind(&handler, ManagementNodeState::Master)
        .unwrap_err();

    assert!(err.to_string().starts_with("Problem rebinding"));
    assert_eq!(handler.exceptions().len(), 1);
    // The failed pass did not replace the live graph.
    assert!(target.context().entity("existing").is_some());
    assert!(target.context().entity("e0").is_none());
}

#[test]
fn test_unknown_type_is_a_create_failure() {
    let store = MemoryStore::new();
    persist_graph(&store);

    let target = manager_with_types("node-b", &store, Arc::new(TypeRegistry::new()));
    let handler = RebindHandlerBuilder::uniform(RebindFailureMode::Continue).build();
    let roots = target.rebind(&handler, ManagementNodeState::Master).unwrap();

    assert!(roots.is_empty());
    assert!(handler
        .warnings()
        .iter()
        .any(|f| f.category() == "create" && f.id() == "web-app"));
    // Missing objects are reported once as create failures, not again as not found.
    assert!(handler.warnings().iter().all(|f| f.category() != "not_found"));
}

struct RejectingPolicy;

impl Behaviour for RejectingPolicy {
    fn on_attach(&self, entity_id: &str) -> Result<(), BoxError> {
        Err(format!("cannot attach to {entity_id}").into())
    }
}

#[test]
fn test_rejected_policy_is_detached() {
    let store = MemoryStore::new();
    persist_graph(&store);

    let target_types = types();
    target_types.register(ObjectKind::Policy, "autoscaler", || Arc::new(RejectingPolicy));
    let target = manager_with_types("node-b", &store, target_types.clone());
    let handler = target.new_rebind_handler();
    target.rebind(&handler, ManagementNodeState::Master).unwrap();

    let app = target.context().entity("web-app").unwrap();
    assert!(app.adjunct_ids(ObjectKind::Policy).is_empty());
    assert_eq!(handler.warnings()[0].category(), "add_policy");

    let strict = manager_with_types("node-c", &store, target_types);
    let handler = RebindHandlerBuilder::default()
        .add_policy_failure_mode(RebindFailureMode::FailAtEnd)
        .build();
    assert!(strict.rebind(&handler, ManagementNodeState::Master).is_err());
}

#[test]
fn test_disabled_kinds_are_not_rebound() {
    let store = MemoryStore::new();
    persist_graph(&store);

    let config = PersistenceConfig {
        persist_feeds: false,
        ..common::config()
    };
    let target = RebindManager::new(common::context("node-b", types()), config);
    let raw: Arc<dyn RawStore> = Arc::new(store.clone());
    target.set_store(raw);

    let handler = target.new_rebind_handler();
    target.rebind(&handler, ManagementNodeState::Master).unwrap();

    let context = target.context();
    assert_eq!(context.count(ObjectKind::Feed), 0);
    assert!(context.entity("db").unwrap().adjunct_ids(ObjectKind::Feed).is_empty());
    assert!(handler.warnings().is_empty());
}

#[test]
fn test_read_only_rebind_refuses_mutation() {
    let store = MemoryStore::new();
    persist_graph(&store);

    let mirror = manager("node-b", &store);
    let handler = RebindHandlerBuilder::uniform(RebindFailureMode::Continue).build();
    mirror.rebind(&handler, ManagementNodeState::HotStandby).unwrap();

    let context = mirror.context();
    assert!(context.is_read_only());
    let app = context.entity("web-app").unwrap();
    assert!(app.is_read_only());
    assert!(matches!(
        app.set_config("replicas", json!(4)),
        Err(PersistError::InvalidState(_))
    ));
    assert!(context
        .create_entity(ObjectSpec::new("app").with_id("new"))
        .is_err());
    assert_eq!(mirror.metrics()["readOnlyRebindCount"], json!(1));
}

#[test]
fn test_rebind_from_empty_store() {
    let store = MemoryStore::new();
    let target = manager("node-b", &store);
    let roots = target
        .rebind(&target.new_rebind_handler(), ManagementNodeState::Master)
        .unwrap();
    assert!(roots.is_empty());
}

#[test]
fn test_rebind_rejects_non_serving_states() {
    let store = MemoryStore::new();
    let target = manager("node-b", &store);
    assert!(matches!(
        target.rebind(&target.new_rebind_handler(), ManagementNodeState::Standby),
        Err(PersistError::InvalidState(_))
    ));
}
