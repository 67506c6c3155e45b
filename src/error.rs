//! Error types for the operator

use thiserror::Error;

use crate::resource::ObjectKey;

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Resource store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    #[error("conflict writing {kind} {key}: resource version {expected} is stale")]
    Conflict {
        kind: &'static str,
        key: ObjectKey,
        expected: String,
    },

    #[error("malformed {kind} document: {message}")]
    Serialization { kind: &'static str, message: String },
}

/// Errors returned by the schema registry facade
///
/// Only `Transient` is worth retrying without a change to the Schema spec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid schema or schema type: {0}")]
    InvalidSchemaOrType(String),

    #[error("incompatible schema: {0}")]
    IncompatibleSchema(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("schema version was already soft deleted: {0}")]
    AlreadySoftDeleted(String),

    #[error("registry request failed: {0}")]
    Transient(String),
}

impl RegistryError {
    /// The registry-provided message for content rejections
    pub fn domain_message(&self) -> Option<&str> {
        match self {
            RegistryError::InvalidSchemaOrType(message)
            | RegistryError::IncompatibleSchema(message) => Some(message),
            _ => None,
        }
    }

    /// Whether the subject or version is already gone from the registry
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            RegistryError::NotFound(_) | RegistryError::AlreadySoftDeleted(_)
        )
    }
}

/// Failures resolving the registry instance an object belongs to
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstanceError {
    #[error("instance label not found")]
    InstanceLabelNotFound,

    #[error("schema registry instance {0} not found")]
    InstanceNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors a reconcile pass propagates to the scheduler
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no previous active schema version found, SchemaVersion {0} has been modified manually")]
    InvalidSchemaVersionModification(ObjectKey),

    #[error("reconcile cancelled")]
    Cancelled,
}

/// Top-level operator errors
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Invalid object name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid manifest {path}: {message}")]
    InvalidManifest { path: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] config_crate::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
}
