/*!
Error types for the rebind core.

[`PersistError`] is the crate-wide error. [`Failure`] is the taxonomy of
per-object problems reported to the exception handlers during a rebind or a
persistence run; handlers accumulate them and may escalate them as a
[`RebindError`].
*/

use std::fmt;

use thiserror::Error;

use crate::memento::ObjectKind;

/// Result type used throughout the rebind core.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Boxed error returned by behaviour hooks supplied by object implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while persisting or rebinding the management plane.
#[derive(Error, Debug)]
pub enum PersistError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Invalid memento blob format
    #[error("Invalid memento format: {0}")]
    InvalidFormat(String),

    /// Raw store adapter errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// A rebind pass was aborted or finished with escalated failures
    #[error(transparent)]
    Rebind(#[from] RebindError),

    /// A persistence run was escalated by its exception handler
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// Waiting for a consistency point took too long
    #[error("Timed out after {elapsed_ms}ms waiting for {what}")]
    Timeout { what: String, elapsed_ms: u128 },

    /// An operation was requested in a state that does not permit it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A cooperative cancellation was observed
    #[error("Interrupted: {0}")]
    Interrupted(String),
}

impl PersistError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn interrupted<S: Into<String>>(msg: S) -> Self {
        Self::Interrupted(msg.into())
    }

    pub fn timeout<S: Into<String>>(what: S, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            elapsed_ms: elapsed.as_millis(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

fn reference_label(kind: &Option<ObjectKind>) -> &'static str {
    match kind {
        Some(kind) => kind.label(),
        None => "object",
    }
}

/// A single problem encountered while rebinding or persisting one object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A stored blob could not be deserialized.
    #[error("problem loading {kind} memento {id}: {reason}")]
    Load {
        kind: ObjectKind,
        id: String,
        reason: String,
    },

    /// No factory is registered for the memento's declared type.
    #[error("problem creating {kind} {id} of type {type_name}: {reason}")]
    Create {
        kind: ObjectKind,
        id: String,
        type_name: String,
        reason: String,
    },

    /// A memento was loaded but its object is absent at a later phase.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ObjectKind, id: String },

    /// A referenced id was not among the loaded objects.
    #[error("no {} found with id {id}", reference_label(.kind))]
    DanglingReference {
        kind: Option<ObjectKind>,
        id: String,
    },

    /// A management-start lifecycle hook failed.
    #[error("problem managing {kind} {id}: {reason}")]
    Manage {
        kind: ObjectKind,
        id: String,
        reason: String,
    },

    /// Reconstructing an object from its memento failed.
    #[error("problem rebinding {kind} {id}: {reason}")]
    Rebind {
        kind: ObjectKind,
        id: String,
        reason: String,
    },

    /// A config entry was rejected while wiring.
    #[error("problem adding config '{key}' to {kind} {id}: {reason}")]
    AddConfig {
        kind: ObjectKind,
        id: String,
        key: String,
        reason: String,
    },

    #[error("problem adding policy {adjunct_id} to entity {entity_id}: {reason}")]
    AddPolicy {
        entity_id: String,
        adjunct_id: String,
        reason: String,
    },

    #[error("problem adding enricher {adjunct_id} to entity {entity_id}: {reason}")]
    AddEnricher {
        entity_id: String,
        adjunct_id: String,
        reason: String,
    },

    #[error("problem adding feed {adjunct_id} to entity {entity_id}: {reason}")]
    AddFeed {
        entity_id: String,
        adjunct_id: String,
        reason: String,
    },

    /// Snapshotting a live object failed.
    #[error("problem generating memento for {kind} {id}: {reason}")]
    GenerateMemento {
        kind: ObjectKind,
        id: String,
        reason: String,
    },

    /// Writing a memento for an object failed.
    #[error("problem persisting {kind} {id}: {reason}")]
    Persist {
        kind: ObjectKind,
        id: String,
        reason: String,
    },

    /// Writing raw bytes (manifest, copied blobs) failed.
    #[error("problem writing raw data {target}: {reason}")]
    RawPersist { target: String, reason: String },

    /// Deleting a blob failed.
    #[error("problem deleting {kind} {id}: {reason}")]
    Delete {
        kind: ObjectKind,
        id: String,
        reason: String,
    },
}

impl Failure {
    /// Stable short name of the failure category, used as a metrics key.
    pub fn category(&self) -> &'static str {
        match self {
            Failure::Load { .. } => "load",
            Failure::Create { .. } => "create",
            Failure::NotFound { .. } => "not_found",
            Failure::DanglingReference { .. } => "dangling_reference",
            Failure::Manage { .. } => "manage",
            Failure::Rebind { .. } => "rebind",
            Failure::AddConfig { .. } => "add_config",
            Failure::AddPolicy { .. } => "add_policy",
            Failure::AddEnricher { .. } => "add_enricher",
            Failure::AddFeed { .. } => "add_feed",
            Failure::GenerateMemento { .. } => "generate_memento",
            Failure::Persist { .. } => "persist",
            Failure::RawPersist { .. } => "raw_persist",
            Failure::Delete { .. } => "delete",
        }
    }

    /// Id of the object the failure concerns.
    pub fn id(&self) -> &str {
        match self {
            Failure::Load { id, .. }
            | Failure::Create { id, .. }
            | Failure::NotFound { id, .. }
            | Failure::DanglingReference { id, .. }
            | Failure::Manage { id, .. }
            | Failure::Rebind { id, .. }
            | Failure::AddConfig { id, .. }
            | Failure::GenerateMemento { id, .. }
            | Failure::Persist { id, .. }
            | Failure::Delete { id, .. } => id,
            Failure::AddPolicy { adjunct_id, .. }
            | Failure::AddEnricher { adjunct_id, .. }
            | Failure::AddFeed { adjunct_id, .. } => adjunct_id,
            Failure::RawPersist { target, .. } => target,
        }
    }
}

/// A rebind (or persistence run) that ended with escalated failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebindError {
    message: String,
    failures: Vec<Failure>,
    aborted: bool,
}

impl RebindError {
    pub fn new<S: Into<String>>(message: S, failures: Vec<Failure>) -> Self {
        Self {
            message: message.into(),
            failures,
            aborted: false,
        }
    }

    /// Abort caused by a single failure under a fail-fast policy.
    pub fn aborted(failure: Failure) -> Self {
        Self {
            message: format!("Rebind: aborting due to {failure}"),
            failures: vec![failure],
            aborted: true,
        }
    }

    /// Composite of every failure accumulated during a pass.
    pub fn composite(failures: Vec<Failure>) -> Self {
        let message = if failures.len() == 1 {
            "Problem rebinding".to_string()
        } else {
            "Problems rebinding".to_string()
        };
        Self {
            message,
            failures,
            aborted: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Whether the pass stopped at the first failure rather than at the end.
    pub fn is_abort(&self) -> bool {
        self.aborted
    }
}

impl fmt::Display for RebindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if !self.aborted {
            for (index, failure) in self.failures.iter().enumerate() {
                let sep = if index == 0 { ": " } else { "; " };
                write!(f, "{sep}{failure}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RebindError {}

