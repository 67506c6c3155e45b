//! Reconcilers for Schema and SchemaVersion objects
//!
//! Each reconcile pass reads fresh state from the store, talks to the
//! registry if needed, and returns an [`Action`] telling the scheduler when to
//! look at the object again.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{InstanceError, ReconcileError};
use crate::resource::{ObjectKey, ObjectMeta, Resource, SchemaRegistry, INSTANCE_LABEL};
use crate::store::ResourceStore;

pub mod schema;
pub mod schema_version;

pub use schema::SchemaReconciler;
pub use schema_version::SchemaVersionReconciler;

pub const SCHEMA_DEPLOYED: &str = "Schema deployed successfully";
pub const INSTANCE_NOT_FOUND: &str = "Schema Registry instance not found";

/// What the scheduler should do after a reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Object: Resource;

    /// Converge the object currently stored under `key`
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;

    /// Clean up after an object that has already left the store
    async fn cleanup(&self, _tombstone: &Self::Object) -> Result<Action, ReconcileError> {
        Ok(Action::Done)
    }

    /// Delay before retrying a pass that returned an error
    fn error_backoff(&self) -> Duration;
}

/// Status message for an instance association failure
pub fn instance_message(error: &InstanceError) -> String {
    match error {
        InstanceError::InstanceLabelNotFound => {
            format!("Instance label: {} not found", INSTANCE_LABEL)
        }
        InstanceError::InstanceNotFound(_) => INSTANCE_NOT_FOUND.to_string(),
        InstanceError::Store(e) => e.to_string(),
    }
}

/// Look up the SchemaRegistry named by the object's instance label
pub async fn resolve_instance<S: ResourceStore>(
    store: &S,
    meta: &ObjectMeta,
) -> Result<SchemaRegistry, InstanceError> {
    let instance = meta
        .label(INSTANCE_LABEL)
        .ok_or(InstanceError::InstanceLabelNotFound)?;

    store
        .get::<SchemaRegistry>(&ObjectKey::new(&meta.namespace, instance))
        .await?
        .ok_or_else(|| InstanceError::InstanceNotFound(instance.to_string()))
}
