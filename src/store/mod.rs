//! Resource store interface
//!
//! The reconcilers only ever talk to the control plane through
//! [`ResourceStore`]: point reads, label-filtered lists, create, separate
//! spec and status writes guarded by `resourceVersion`, delete, and a watch
//! stream. [`InMemoryStore`] implements the same semantics locally, including
//! finalizers and owner-reference cascades.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::resource::{LabelSelector, ObjectKey, Resource};

pub mod memory;

pub use memory::{InMemoryStore, StoreSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A change observed on the store
///
/// For `Deleted`, `object` is the last state of the object before it was
/// purged.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub kind: String,
    pub key: ObjectKey,
    pub event_type: EventType,
    pub object: serde_json::Value,
}

impl WatchEvent {
    pub fn is_kind<K: Resource>(&self) -> bool {
        self.kind == K::KIND
    }

    /// Decode the carried object as `K`
    pub fn decode<K: Resource>(&self) -> Result<K, StoreError> {
        serde_json::from_value(self.object.clone()).map_err(|e| StoreError::Serialization {
            kind: K::KIND,
            message: e.to_string(),
        })
    }
}

#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    async fn get<K: Resource>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError>;

    async fn list<K: Resource>(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, StoreError>;

    /// Every object of the kind, across namespaces
    async fn list_all<K: Resource>(&self) -> Result<Vec<K>, StoreError>;

    /// Fails with `AlreadyExists` if the key is taken; status is not persisted
    async fn create<K: Resource>(&self, object: &K) -> Result<K, StoreError>;

    /// Write metadata and spec; the stored status is preserved
    async fn update<K: Resource>(&self, object: &K) -> Result<K, StoreError>;

    /// Write status only
    async fn update_status<K: Resource>(&self, object: &K) -> Result<K, StoreError>;

    /// Request deletion; objects holding finalizers are only marked
    async fn delete<K: Resource>(&self, key: &ObjectKey) -> Result<(), StoreError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
