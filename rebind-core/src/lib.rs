/*!
# Rebind Core Engine

Persistence, rebind and hot-standby mirroring for a management plane whose
live state is a cross-referencing graph of entities, locations, policies,
enrichers, feeds and catalog items.

This crate provides:

- Immutable mementos of every object kind, stored as integrity-checked,
  optionally compressed envelopes
- Pluggable raw stores (in memory, local filesystem, S3)
- A change tracker and a periodic persistence driver that writes only what changed
- A four-phase rebind engine that rebuilds a live graph from a bundle of mementos
- Pluggable failure policies for both directions (`FAIL_FAST`, `FAIL_AT_END`, `CONTINUE`)
- A node-state controller switching between persisting as master and
  mirroring read-only as a hot standby

## Architecture

- Live objects report every mutation to the [`ChangeTracker`]
- The [`PersistenceDriver`] drains the tracker and writes mementos through a
  [`MementoPersister`] onto a [`RawStore`]
- The [`RebindEngine`] loads a [`RawDataBundle`] and replaces the registry of
  the [`ManagementContext`] with the rebuilt graph
- The [`NodeStateController`] decides which of the two loops runs

## Usage

```no_run
use std::sync::Arc;

use rebind_core::{
    ManagementContext, ManagementNodeState, ObjectKind, ObjectSpec, PersistenceConfig,
    RebindManager, StorageConfig, TypeRegistry,
};

fn main() -> rebind_core::Result<()> {
    let types = Arc::new(TypeRegistry::new());
    types.register_plain(ObjectKind::Entity, "app");

    let context = Arc::new(ManagementContext::new("node-a", types));
    context.init();

    let config = PersistenceConfig::with_storage(StorageConfig::local("/var/lib/rebind"));
    let manager = RebindManager::from_config(context.clone(), config)?;

    // Rebind whatever is stored, then persist changes periodically
    manager.set_node_state(ManagementNodeState::Master)?;
    context.create_entity(ObjectSpec::new("app").with_id("web"))?;

    manager.stop()?;
    Ok(())
}
```
*/

pub mod backup;
pub mod compression;
pub mod config;
pub mod driver;
pub mod error;
pub mod ha;
pub mod handler;
pub mod manager;
pub mod memento;
pub mod model;
pub mod observability;
pub mod persister;
pub mod rebind;
pub mod store;
pub mod tracker;

#[cfg(test)]
mod error_tests;

pub use backup::BackupMode;
pub use compression::{CompressionAdapter, CompressionKind, GzipCompressor, NoCompression};
pub use config::{PersistenceConfig, StorageBackend, StorageConfig};
pub use driver::{FlushSummary, ListenerState, PersistenceDriver, PersistenceHandlerFactory};
pub use error::{BoxError, Failure, PersistError, RebindError, Result};
pub use ha::{ControllerState, ManagementNodeState, NodeStateController};
pub use handler::{
    DefaultPersistenceExceptionHandler, DefaultRebindExceptionHandler, PersistenceExceptionHandler,
    RebindExceptionHandler, RebindFailureMode, RebindHandlerBuilder, RebindPass,
};
pub use manager::RebindManager;
pub use memento::{
    AdjunctMemento, BundleManifest, CatalogItemMemento, ConfigMap, ConfigRef, EntityMemento,
    LocationMemento, Memento, MementoCodec, MementoHeader, ObjectKind,
};
pub use model::{
    Adjunct, Behaviour, CatalogItem, CatalogItemDetail, Configurable, Entity, Identifiable,
    LiveRef, Location, Lookup, ManagementContext, ObjectSpec, Rebindable, Registry, Taggable,
    TypeRegistry,
};
pub use observability::{init_observability, PersistenceActivityMetrics, RebindMetrics};
pub use persister::{copy_state, CopySummary, MementoPersister, PersisterSlot};
pub use rebind::RebindEngine;
pub use store::{load_bundle, LocalFileStore, MemoryStore, RawDataBundle, RawStore};
pub use tracker::{ChangeListener, ChangeTracker, PersistenceDelta};

#[cfg(feature = "s3")]
pub use store::S3Store;
