//! In-memory resource store
//!
//! Objects are kept as JSON documents keyed by kind and `namespace/name`, so
//! spec/status separation and no-op detection work the same for every kind.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StoreError;
use crate::resource::{LabelSelector, ObjectKey, ObjectMeta, Resource};
use crate::store::{EventType, ResourceStore, WatchEvent};

const EVENT_CAPACITY: usize = 1024;

type StoreKey = (String, ObjectKey);

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<StoreKey, Value>,
    revision: u64,
    next_uid: u64,
}

/// A persisted copy of the store contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub revision: u64,
    pub next_uid: u64,
    pub objects: Vec<StoredObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub kind: String,
    pub object: Value,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self, StoreError> {
        let store = Self::new();
        {
            let mut inner = store.lock();
            inner.revision = snapshot.revision;
            inner.next_uid = snapshot.next_uid;
            for stored in snapshot.objects {
                let meta = read_meta(&stored.object, "object")?;
                inner.objects.insert((stored.kind, meta.key()), stored.object);
            }
        }
        Ok(store)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.lock();
        StoreSnapshot {
            revision: inner.revision,
            next_uid: inner.next_uid,
            objects: inner
                .objects
                .iter()
                .map(|((kind, _), object)| StoredObject {
                    kind: kind.clone(),
                    object: object.clone(),
                })
                .collect(),
        }
    }

    /// Monotonic counter bumped by every effective write
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }
}

impl Inner {
    fn bump(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn check_version(&self, kind: &'static str, key: &ObjectKey, stored: &ObjectMeta, incoming: &ObjectMeta) -> Result<(), StoreError> {
        if !incoming.resource_version.is_empty() && incoming.resource_version != stored.resource_version {
            return Err(StoreError::Conflict {
                kind,
                key: key.clone(),
                expected: incoming.resource_version.clone(),
            });
        }
        Ok(())
    }

    /// Remove an object and everything it owns, transitively
    fn purge(&mut self, kind: String, key: ObjectKey, events: &mut Vec<WatchEvent>) {
        let mut pending = vec![(kind, key)];
        while let Some(store_key) = pending.pop() {
            let Some(object) = self.objects.remove(&store_key) else {
                continue;
            };
            self.bump();
            let uid = object["metadata"]["uid"].as_str().unwrap_or_default().to_string();
            debug!(kind = %store_key.0, key = %store_key.1, "object purged");
            events.push(WatchEvent {
                kind: store_key.0,
                key: store_key.1,
                event_type: EventType::Deleted,
                object,
            });

            if uid.is_empty() {
                continue;
            }
            let owned: Vec<StoreKey> = self
                .objects
                .iter()
                .filter(|(_, doc)| {
                    read_meta(doc, "object")
                        .map(|meta| meta.is_owned_by(&uid))
                        .unwrap_or(false)
                })
                .map(|(child, _)| child.clone())
                .collect();
            for child in owned {
                if let Some(purge_now) = self.request_deletion(&child, events) {
                    if purge_now {
                        pending.push(child);
                    }
                }
            }
        }
    }

    /// Mark for deletion, or report that the object can be purged right away
    fn request_deletion(&mut self, store_key: &StoreKey, events: &mut Vec<WatchEvent>) -> Option<bool> {
        let doc = self.objects.get(store_key)?;
        let meta = read_meta(doc, "object").ok()?;
        if meta.finalizers.is_empty() {
            return Some(true);
        }
        if meta.is_deleting() {
            return Some(false);
        }
        let resource_version = self.bump();
        let doc = self.objects.get_mut(store_key)?;
        doc["metadata"]["deletionTimestamp"] = serde_json::to_value(Utc::now()).unwrap_or(Value::Null);
        doc["metadata"]["resourceVersion"] = Value::String(resource_version);
        events.push(WatchEvent {
            kind: store_key.0.clone(),
            key: store_key.1.clone(),
            event_type: EventType::Modified,
            object: doc.clone(),
        });
        Some(false)
    }
}

fn read_meta(doc: &Value, kind: &'static str) -> Result<ObjectMeta, StoreError> {
    serde_json::from_value(doc["metadata"].clone()).map_err(|e| StoreError::Serialization {
        kind,
        message: e.to_string(),
    })
}

fn encode<K: Resource>(object: &K) -> Result<Value, StoreError> {
    serde_json::to_value(object).map_err(|e| StoreError::Serialization {
        kind: K::KIND,
        message: e.to_string(),
    })
}

fn decode<K: Resource>(doc: &Value) -> Result<K, StoreError> {
    serde_json::from_value(doc.clone()).map_err(|e| StoreError::Serialization {
        kind: K::KIND,
        message: e.to_string(),
    })
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get<K: Resource>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        let inner = self.lock();
        inner
            .objects
            .get(&(K::KIND.to_string(), key.clone()))
            .map(decode::<K>)
            .transpose()
    }

    async fn list<K: Resource>(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, StoreError> {
        let inner = self.lock();
        let mut objects = Vec::new();
        for ((kind, key), doc) in &inner.objects {
            if kind != K::KIND || key.namespace != namespace {
                continue;
            }
            let object = decode::<K>(doc)?;
            if selector.matches(&object.meta().labels) {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    async fn list_all<K: Resource>(&self) -> Result<Vec<K>, StoreError> {
        let inner = self.lock();
        inner
            .objects
            .iter()
            .filter(|((kind, _), _)| kind == K::KIND)
            .map(|(_, doc)| decode::<K>(doc))
            .collect()
    }

    async fn create<K: Resource>(&self, object: &K) -> Result<K, StoreError> {
        let key = object.key();
        let store_key = (K::KIND.to_string(), key.clone());
        let created = {
            let mut inner = self.lock();
            if inner.objects.contains_key(&store_key) {
                return Err(StoreError::AlreadyExists { kind: K::KIND, key });
            }

            let mut created = object.clone();
            inner.next_uid += 1;
            let uid = format!("uid-{:08}", inner.next_uid);
            let resource_version = inner.bump();
            {
                let meta = created.meta_mut();
                meta.uid = uid;
                meta.resource_version = resource_version;
                meta.generation = 1;
                meta.creation_timestamp = Some(Utc::now());
                meta.deletion_timestamp = None;
            }

            let mut doc = encode(&created)?;
            if let Some(map) = doc.as_object_mut() {
                map.remove("status");
            }
            let created = decode::<K>(&doc)?;
            let doc = encode(&created)?;
            inner.objects.insert(store_key, doc.clone());
            created
        };

        self.publish(vec![WatchEvent {
            kind: K::KIND.to_string(),
            key,
            event_type: EventType::Added,
            object: encode(&created)?,
        }]);
        Ok(created)
    }

    async fn update<K: Resource>(&self, object: &K) -> Result<K, StoreError> {
        let key = object.key();
        let store_key = (K::KIND.to_string(), key.clone());
        let mut events = Vec::new();
        let updated = {
            let mut inner = self.lock();
            let Some(stored_doc) = inner.objects.get(&store_key).cloned() else {
                return Err(StoreError::NotFound { kind: K::KIND, key });
            };
            let stored = decode::<K>(&stored_doc)?;
            inner.check_version(K::KIND, &key, stored.meta(), object.meta())?;

            let mut next = object.clone();
            {
                let stored_meta = stored.meta();
                let meta = next.meta_mut();
                meta.uid = stored_meta.uid.clone();
                meta.resource_version = stored_meta.resource_version.clone();
                meta.generation = stored_meta.generation;
                meta.creation_timestamp = stored_meta.creation_timestamp;
                meta.deletion_timestamp = stored_meta.deletion_timestamp;
            }
            let mut doc = encode(&next)?;
            doc["status"] = stored_doc["status"].clone();
            if doc == stored_doc {
                return Ok(stored);
            }

            if doc["spec"] != stored_doc["spec"] {
                let generation = stored.meta().generation + 1;
                doc["metadata"]["generation"] = Value::from(generation);
            }

            let meta = read_meta(&doc, K::KIND)?;
            if meta.is_deleting() && meta.finalizers.is_empty() {
                inner.objects.insert(store_key.clone(), doc.clone());
                inner.purge(store_key.0, store_key.1, &mut events);
                decode::<K>(&doc)?
            } else {
                doc["metadata"]["resourceVersion"] = Value::String(inner.bump());
                inner.objects.insert(store_key, doc.clone());
                events.push(WatchEvent {
                    kind: K::KIND.to_string(),
                    key,
                    event_type: EventType::Modified,
                    object: doc.clone(),
                });
                decode::<K>(&doc)?
            }
        };

        self.publish(events);
        Ok(updated)
    }

    async fn update_status<K: Resource>(&self, object: &K) -> Result<K, StoreError> {
        let key = object.key();
        let store_key = (K::KIND.to_string(), key.clone());
        let (updated, doc) = {
            let mut inner = self.lock();
            let Some(stored_doc) = inner.objects.get(&store_key).cloned() else {
                return Err(StoreError::NotFound { kind: K::KIND, key });
            };
            let stored = decode::<K>(&stored_doc)?;
            inner.check_version(K::KIND, &key, stored.meta(), object.meta())?;

            let incoming = encode(object)?;
            if incoming["status"] == stored_doc["status"] {
                return Ok(stored);
            }

            let mut doc = stored_doc;
            doc["status"] = incoming["status"].clone();
            doc["metadata"]["resourceVersion"] = Value::String(inner.bump());
            inner.objects.insert(store_key, doc.clone());
            (decode::<K>(&doc)?, doc)
        };

        self.publish(vec![WatchEvent {
            kind: K::KIND.to_string(),
            key,
            event_type: EventType::Modified,
            object: doc,
        }]);
        Ok(updated)
    }

    async fn delete<K: Resource>(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let store_key = (K::KIND.to_string(), key.clone());
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            match inner.request_deletion(&store_key, &mut events) {
                None => {
                    return Err(StoreError::NotFound {
                        kind: K::KIND,
                        key: key.clone(),
                    })
                }
                Some(true) => inner.purge(store_key.0, store_key.1, &mut events),
                Some(false) => {}
            }
        }
        self.publish(events);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{
        Schema, SchemaSpec, SchemaVersion, SchemaVersionSpec, FINALIZER, INSTANCE_LABEL,
    };

    fn schema(name: &str) -> Schema {
        let mut meta = ObjectMeta::new("default", name);
        meta.labels.insert(INSTANCE_LABEL.to_string(), "registry-a".to_string());
        Schema::new(
            meta,
            SchemaSpec {
                content: r#"{"type": "string"}"#.to_string(),
                ..Default::default()
            },
        )
    }

    fn child_of(parent: &Schema, version: u32) -> SchemaVersion {
        let mut meta = ObjectMeta::new("default", SchemaVersion::object_name("s1-value", version));
        meta.owner_references.push(parent.controller_reference());
        SchemaVersion {
            metadata: meta,
            spec: SchemaVersionSpec {
                subject: "s1-value".to_string(),
                content: parent.spec.content.clone(),
                version,
                registry_schema_id: version,
            },
            status: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identity_and_drops_status() {
        let store = InMemoryStore::new();
        let mut object = schema("s1");
        object.status.ready = true;

        let created = store.create(&object).await.unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert!(!created.metadata.resource_version.is_empty());
        assert_eq!(created.metadata.generation, 1);
        assert!(!created.status.ready);

        let duplicate = store.create(&object).await;
        assert!(matches!(duplicate, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let store = InMemoryStore::new();
        let created = store.create(&schema("s1")).await.unwrap();

        let mut first = created.clone();
        first.status.message = "first".to_string();
        store.update_status(&first).await.unwrap();

        let mut second = created;
        second.status.message = "second".to_string();
        let result = store.update_status(&second).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_spec_and_status_writes_are_separate() {
        let store = InMemoryStore::new();
        let created = store.create(&schema("s1")).await.unwrap();

        let mut with_status = created.clone();
        with_status.status.ready = true;
        let with_status = store.update_status(&with_status).await.unwrap();
        assert_eq!(with_status.metadata.generation, 1);

        let mut edited = with_status.clone();
        edited.spec.content = r#"{"type": "int"}"#.to_string();
        edited.status.ready = false;
        let edited = store.update(&edited).await.unwrap();
        assert!(edited.status.ready);
        assert_eq!(edited.metadata.generation, 2);
    }

    #[tokio::test]
    async fn test_noop_writes_emit_nothing() {
        let store = InMemoryStore::new();
        let created = store.create(&schema("s1")).await.unwrap();
        let mut events = store.watch();
        let revision = store.revision();

        let same = store.update(&created).await.unwrap();
        let same = store.update_status(&same).await.unwrap();
        assert_eq!(same.metadata.resource_version, created.metadata.resource_version);
        assert_eq!(store.revision(), revision);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_finalizer_blocks_purge_until_released() {
        let store = InMemoryStore::new();
        let mut object = schema("s1");
        object.metadata.finalizers.push(FINALIZER.to_string());
        store.create(&object).await.unwrap();

        store.delete::<Schema>(&object.key()).await.unwrap();
        let marked: Schema = store.get(&object.key()).await.unwrap().unwrap();
        assert!(marked.metadata.is_deleting());

        let mut released = marked;
        released.metadata.remove_finalizer(FINALIZER);
        store.update(&released).await.unwrap();
        assert!(store.get::<Schema>(&object.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_cascades_to_owned_objects() {
        let store = InMemoryStore::new();
        let parent = store.create(&schema("s1")).await.unwrap();
        store.create(&child_of(&parent, 1)).await.unwrap();
        store.create(&child_of(&parent, 2)).await.unwrap();
        let mut events = store.watch();

        store.delete::<Schema>(&parent.key()).await.unwrap();

        let remaining = store
            .list::<SchemaVersion>("default", &LabelSelector::everything())
            .await
            .unwrap();
        assert!(remaining.is_empty());

        let mut deleted = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.event_type, EventType::Deleted);
            deleted.push(event.key.name);
        }
        deleted.sort();
        assert_eq!(deleted, vec!["s1", "s1-value-v1", "s1-value-v2"]);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_objects() {
        let store = InMemoryStore::new();
        store.create(&schema("s1")).await.unwrap();
        let snapshot = store.snapshot();

        let restored = InMemoryStore::from_snapshot(snapshot).unwrap();
        assert!(restored.get::<Schema>(&ObjectKey::new("default", "s1")).await.unwrap().is_some());
        assert_eq!(restored.revision(), store.revision());
    }
}
