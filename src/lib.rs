//! Schema Registry Operator
//!
//! Continuously converges declared `Schema` objects against a schema registry
//! and keeps an append-only history of `SchemaVersion` records per subject.
//!
//! ## Features
//!
//! - **Change Detection**: SHA256 content checksums cached on each Schema skip
//!   registry calls when nothing changed
//! - **Subject Uniqueness**: Schemas sharing a registry instance may not claim
//!   the same effective subject
//! - **Version History**: every registration creates an immutable
//!   SchemaVersion; exactly one per subject is active
//! - **Two-Phase Teardown**: subjects and versions are soft then permanently
//!   deleted before their objects are released
//!
//! ## Architecture
//!
//! ```text
//! manifest ──apply──▶ ResourceStore ──watch──▶ Controller<SchemaReconciler>
//!                          ▲                       │ register / compat
//!                          │                       ▼
//!                          │               SchemaRegistryApi (HTTP)
//!                          │                       ▲ delete version
//!                          └──watch──▶ Controller<SchemaVersionReconciler>
//! ```

pub mod checksum;
pub mod config;
pub mod controller;
pub mod error;
pub mod manifest;
pub mod reconcile;
pub mod registry;
pub mod resource;
pub mod store;

pub use checksum::Checksum;
pub use config::OperatorConfig;
pub use controller::{Controller, Manager, WorkQueue};
pub use error::{InstanceError, OperatorError, ReconcileError, RegistryError, Result, StoreError};
pub use manifest::{apply_manifest, ApplyOutcome, Manifest};
pub use reconcile::{Action, Reconciler, SchemaReconciler, SchemaVersionReconciler};
pub use registry::{HttpRegistryClient, RegistryEndpoint, SchemaRegistryApi};
pub use resource::{ObjectKey, ObjectMeta, Resource, Schema, SchemaRegistry, SchemaVersion};
pub use store::{InMemoryStore, ResourceStore};
