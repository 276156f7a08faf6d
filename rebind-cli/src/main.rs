/*!
Rebind CLI - Command-line interface for persisted management-plane state.

This CLI inspects, verifies, copies and clears the memento stores written by
the persistence driver (local filesystem, S3).
*/

use std::io::{self, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use rebind_core::store::create_store_from_config;
use rebind_core::{
    copy_state, init_observability, BundleManifest, DefaultPersistenceExceptionHandler,
    MementoCodec, ObjectKind, PersistError, RawStore, RebindFailureMode, StorageBackend,
    StorageConfig,
};
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "rebind")]
#[command(about = "CLI for persisted management-plane state")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Store URI: a directory or `s3://bucket/prefix`
    #[arg(short, long, global = true, env = "REBIND_STORE", default_value = "./rebind-store")]
    store: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FailureMode {
    FailFast,
    FailAtEnd,
    Continue,
}

impl From<FailureMode> for RebindFailureMode {
    fn from(mode: FailureMode) -> Self {
        match mode {
            FailureMode::FailFast => RebindFailureMode::FailFast,
            FailureMode::FailAtEnd => RebindFailureMode::FailAtEnd,
            FailureMode::Continue => RebindFailureMode::Continue,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List persisted objects
    List {
        /// Only list one kind (entity, location, policy, enricher, feed, catalog-item)
        #[arg(short, long)]
        kind: Option<ObjectKind>,
    },
    /// Print one memento as JSON
    Show {
        /// Object kind
        kind: ObjectKind,
        /// Object id
        id: String,
    },
    /// Decode every blob and report the ones that fail
    Verify,
    /// Print the bundle manifest
    Manifest,
    /// Copy every blob and the manifest to another store
    CopyState {
        /// Target store URI
        target: String,
        /// How to handle blobs that cannot be copied
        #[arg(long, value_enum, default_value = "fail-at-end")]
        mode: FailureMode,
    },
    /// Delete everything in the store
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct ObjectInfo {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    type_name: String,
    #[tabled(rename = "Name")]
    display_name: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Tabled)]
struct VerifyFailure {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Problem")]
    reason: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs)?;

    let store = open_store(&cli.store)?;

    match cli.command {
        Commands::List { kind } => list_objects(store.as_ref(), kind)?,
        Commands::Show { kind, id } => show_memento(store.as_ref(), kind, &id)?,
        Commands::Verify => verify_store(store.as_ref())?,
        Commands::Manifest => show_manifest(store.as_ref())?,
        Commands::CopyState { target, mode } => {
            let target = open_store(&target)?;
            copy_store(store.as_ref(), target.as_ref(), mode.into())?
        }
        Commands::Clear { force } => clear_store(store.as_ref(), force)?,
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<(), anyhow::Error> {
    if verbose && std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "rebind_core=debug,rebind_retry=debug,rebind=debug");
    }
    init_observability(json)?;
    Ok(())
}

fn open_store(uri: &str) -> Result<Arc<dyn RawStore>, anyhow::Error> {
    let config = StorageConfig::from_uri(uri)?;
    if config.backend == StorageBackend::Memory {
        anyhow::bail!("{uri} names an in-memory store, which never holds persisted state");
    }
    let store = create_store_from_config(&config)?;
    info!(store = %store.describe(), "opened memento store");
    Ok(store)
}

fn kinds(filter: Option<ObjectKind>) -> Vec<ObjectKind> {
    match filter {
        Some(kind) => vec![kind],
        None => ObjectKind::ALL.to_vec(),
    }
}

fn collect_objects(
    store: &dyn RawStore,
    filter: Option<ObjectKind>,
) -> Result<Vec<ObjectInfo>, PersistError> {
    let codec = MementoCodec::uncompressed();
    let mut rows = Vec::new();

    for kind in kinds(filter) {
        let contents = store.read_all(kind)?;
        for failure in contents.failures {
            warn!(kind = %kind, id = %failure.id, "unreadable blob: {}", failure.reason);
        }
        for (id, blob) in &contents.blobs {
            let (type_name, display_name) = match codec.decode(kind, id, blob) {
                Ok(memento) => {
                    let header = memento.header();
                    (
                        header.type_name.clone(),
                        header.display_name.clone().unwrap_or_default(),
                    )
                }
                Err(e) => {
                    warn!(kind = %kind, id = %id, error = %e, "failed to decode memento");
                    ("<corrupt>".to_string(), String::new())
                }
            };
            rows.push(ObjectInfo {
                kind: kind.to_string(),
                id: id.clone(),
                type_name,
                display_name,
                size: format_size(blob.len() as u64),
            });
        }
    }

    Ok(rows)
}

fn list_objects(store: &dyn RawStore, filter: Option<ObjectKind>) -> Result<(), anyhow::Error> {
    let rows = collect_objects(store, filter)?;
    if rows.is_empty() {
        println!("No persisted objects found in {}", store.describe());
    } else {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn show_memento(store: &dyn RawStore, kind: ObjectKind, id: &str) -> Result<(), anyhow::Error> {
    let blob = store.read(kind, id)?;
    let memento = MementoCodec::uncompressed().decode(kind, id, &blob)?;
    println!("{}", serde_json::to_string_pretty(&memento.to_value()?)?);
    Ok(())
}

fn find_corrupt(store: &dyn RawStore) -> Result<(usize, Vec<VerifyFailure>), PersistError> {
    let codec = MementoCodec::uncompressed();
    let mut checked = 0;
    let mut failures = Vec::new();

    for kind in ObjectKind::ALL {
        let contents = store.read_all(kind)?;
        for failure in contents.failures {
            failures.push(VerifyFailure {
                kind: kind.to_string(),
                id: failure.id,
                reason: failure.reason,
            });
        }
        for (id, blob) in &contents.blobs {
            checked += 1;
            if let Err(e) = codec.decode(kind, id, blob) {
                failures.push(VerifyFailure {
                    kind: kind.to_string(),
                    id: id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok((checked, failures))
}

fn verify_store(store: &dyn RawStore) -> Result<(), anyhow::Error> {
    let (checked, failures) = find_corrupt(store)?;

    if failures.is_empty() {
        println!("✓ All {checked} mementos decoded and passed the integrity check");
        return Ok(());
    }

    let failed = failures.len();
    error!("✗ {failed} of the persisted objects failed verification");
    println!("{}", Table::new(failures));
    Err(anyhow::anyhow!("{failed} persisted objects failed verification"))
}

fn show_manifest(store: &dyn RawStore) -> Result<(), anyhow::Error> {
    let Some(data) = store.read_manifest()? else {
        println!("No manifest found in {}", store.describe());
        return Ok(());
    };
    let manifest = BundleManifest::from_bytes(&data)?;

    println!("Manifest Details:");
    println!("  Store: {}", store.describe());
    println!("  Format Version: {}", manifest.format_version);
    println!("  Written: {}", format_timestamp(manifest.last_written.timestamp()));
    println!("  Writer Node: {}", manifest.writer_node_id);
    println!("  Write ID: {}", manifest.write_id);
    for kind in ObjectKind::ALL {
        println!("  {}: {}", kind.dir_name(), manifest.count(kind));
    }
    Ok(())
}

fn copy_store(
    source: &dyn RawStore,
    target: &dyn RawStore,
    mode: RebindFailureMode,
) -> Result<(), anyhow::Error> {
    let handler = DefaultPersistenceExceptionHandler::new(mode);
    let summary = copy_state(source, target, &handler)?;
    println!(
        "✓ Copied {} blobs from {} to {} ({} failed)",
        summary.copied,
        source.describe(),
        target.describe(),
        summary.failed
    );
    Ok(())
}

fn clear_store(store: &dyn RawStore, force: bool) -> Result<(), anyhow::Error> {
    if !force {
        print!(
            "Are you sure you want to delete everything in '{}'? (y/N): ",
            store.describe()
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Clear cancelled");
            return Ok(());
        }
    }

    store.clear()?;
    println!("✓ Store cleared");
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: i64) -> String {
    use chrono::{Local, TimeZone};

    match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => timestamp.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebind_core::{EntityMemento, Memento, MementoHeader, MemoryStore};

    fn store_with_entity(id: &str) -> MemoryStore {
        let store = MemoryStore::new();
        let memento = Memento::Entity(EntityMemento {
            header: MementoHeader::new(id, "app"),
            ..Default::default()
        });
        let blob = MementoCodec::uncompressed().encode(&memento).unwrap();
        store.write(ObjectKind::Entity, id, &blob).unwrap();
        store
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
    }

    #[test]
    fn test_collect_objects_reads_headers() {
        let store = store_with_entity("web");
        let rows = collect_objects(&store, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "web");
        assert_eq!(rows[0].type_name, "app");

        assert!(collect_objects(&store, Some(ObjectKind::Location))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_find_corrupt_reports_bad_blobs() {
        let store = store_with_entity("web");
        store.put_raw(ObjectKind::Entity, "broken", b"not json".to_vec());

        let (checked, failures) = find_corrupt(&store).unwrap();
        assert_eq!(checked, 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "broken");
    }

    #[test]
    fn test_open_store_rejects_memory_uri() {
        let err = open_store("mem://").err().unwrap();
        assert!(err.to_string().contains("in-memory"));
    }

    #[test]
    fn test_copy_store_copies_blobs() {
        let source = store_with_entity("web");
        let target = MemoryStore::new();
        copy_store(&source, &target, RebindFailureMode::FailAtEnd).unwrap();
        assert!(target.contains(ObjectKind::Entity, "web"));
    }
}
