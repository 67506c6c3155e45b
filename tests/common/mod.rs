//! Shared fixtures: an in-process registry double and object builders

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use schema_registry_operator::config::OperatorConfig;
use schema_registry_operator::registry::{
    RegisteredSchema, RegistryEndpoint, SchemaRegistryApi, SchemaSubmission,
};
use schema_registry_operator::resource::{
    CompatibilityLevel, ObjectMeta, Schema, SchemaRegistry, SchemaRegistrySpec, SchemaSpec,
    INSTANCE_LABEL,
};
use schema_registry_operator::{InMemoryStore, RegistryError, ResourceStore};

pub const INSTANCE: &str = "registry-a";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Register(String),
    FetchLatest(String),
    GetCompatibility(String),
    SetCompatibility(String, CompatibilityLevel),
    DeleteSubject(String, bool),
    DeleteVersion(String, u32, bool),
}

#[derive(Debug, Clone)]
struct StoredVersion {
    version: u32,
    id: u32,
    content: String,
    soft_deleted: bool,
}

#[derive(Default)]
struct State {
    subjects: BTreeMap<String, Vec<StoredVersion>>,
    compatibility: BTreeMap<String, CompatibilityLevel>,
    next_id: u32,
    rejection: Option<RegistryError>,
    compatibility_failures: u32,
}

/// Registry double following the Confluent semantics the reconcilers rely on
#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<State>,
    calls: Mutex<Vec<Call>>,
}

impl MockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn register_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Register(_)))
            .count()
    }

    /// Fail every registration with `error` until cleared
    pub fn reject_with(&self, error: RegistryError) {
        self.state.lock().unwrap().rejection = Some(error);
    }

    pub fn clear_rejection(&self) {
        self.state.lock().unwrap().rejection = None;
    }

    /// Fail the next `times` compatibility updates as unavailable
    pub fn fail_compatibility(&self, times: u32) {
        self.state.lock().unwrap().compatibility_failures = times;
    }

    /// Live version numbers of a subject
    pub fn versions(&self, subject: &str) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .subjects
            .get(subject)
            .map(|versions| {
                versions
                    .iter()
                    .filter(|v| !v.soft_deleted)
                    .map(|v| v.version)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_subject(&self, subject: &str) -> bool {
        self.state.lock().unwrap().subjects.contains_key(subject)
    }

    pub fn compatibility(&self, subject: &str) -> Option<CompatibilityLevel> {
        self.state.lock().unwrap().compatibility.get(subject).copied()
    }
}

#[async_trait]
impl SchemaRegistryApi for MockRegistry {
    async fn register(
        &self,
        _endpoint: &RegistryEndpoint,
        subject: &str,
        schema: SchemaSubmission<'_>,
    ) -> Result<u32, RegistryError> {
        self.record(Call::Register(subject.to_string()));
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.rejection.clone() {
            return Err(error);
        }

        state.next_id += 1;
        let fresh_id = state.next_id;
        let versions = state.subjects.entry(subject.to_string()).or_default();
        if let Some(existing) = versions
            .iter()
            .find(|v| !v.soft_deleted && v.content == schema.content)
        {
            return Ok(existing.id);
        }
        let version = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        versions.push(StoredVersion {
            version,
            id: fresh_id,
            content: schema.content.to_string(),
            soft_deleted: false,
        });
        Ok(fresh_id)
    }

    async fn fetch_latest(
        &self,
        _endpoint: &RegistryEndpoint,
        subject: &str,
    ) -> Result<RegisteredSchema, RegistryError> {
        self.record(Call::FetchLatest(subject.to_string()));
        let state = self.state.lock().unwrap();
        state
            .subjects
            .get(subject)
            .and_then(|versions| versions.iter().filter(|v| !v.soft_deleted).last())
            .map(|v| RegisteredSchema {
                id: v.id,
                version: v.version,
            })
            .ok_or_else(|| RegistryError::NotFound(format!("Subject '{}' not found.", subject)))
    }

    async fn get_compatibility(
        &self,
        _endpoint: &RegistryEndpoint,
        subject: &str,
    ) -> Result<Option<CompatibilityLevel>, RegistryError> {
        self.record(Call::GetCompatibility(subject.to_string()));
        Ok(self.state.lock().unwrap().compatibility.get(subject).copied())
    }

    async fn set_compatibility(
        &self,
        _endpoint: &RegistryEndpoint,
        subject: &str,
        level: CompatibilityLevel,
    ) -> Result<(), RegistryError> {
        self.record(Call::SetCompatibility(subject.to_string(), level));
        let mut state = self.state.lock().unwrap();
        if state.compatibility_failures > 0 {
            state.compatibility_failures -= 1;
            return Err(RegistryError::Transient("status 503: unavailable".to_string()));
        }
        state.compatibility.insert(subject.to_string(), level);
        Ok(())
    }

    async fn delete_subject(
        &self,
        _endpoint: &RegistryEndpoint,
        subject: &str,
        permanent: bool,
    ) -> Result<(), RegistryError> {
        self.record(Call::DeleteSubject(subject.to_string(), permanent));
        let mut state = self.state.lock().unwrap();
        let Some(versions) = state.subjects.get_mut(subject) else {
            return Err(RegistryError::NotFound(format!("Subject '{}' not found.", subject)));
        };

        if permanent {
            if versions.iter().any(|v| !v.soft_deleted) {
                return Err(RegistryError::Transient(format!(
                    "Subject '{}' was not deleted first before being permanently deleted",
                    subject
                )));
            }
            state.subjects.remove(subject);
            state.compatibility.remove(subject);
            return Ok(());
        }

        if versions.iter().all(|v| v.soft_deleted) {
            return Err(RegistryError::NotFound(format!("Subject '{}' was soft deleted.", subject)));
        }
        for version in versions.iter_mut() {
            version.soft_deleted = true;
        }
        Ok(())
    }

    async fn delete_version(
        &self,
        _endpoint: &RegistryEndpoint,
        subject: &str,
        version: u32,
        permanent: bool,
    ) -> Result<(), RegistryError> {
        self.record(Call::DeleteVersion(subject.to_string(), version, permanent));
        let mut state = self.state.lock().unwrap();
        let Some(versions) = state.subjects.get_mut(subject) else {
            return Err(RegistryError::NotFound(format!("Subject '{}' not found.", subject)));
        };
        let Some(position) = versions.iter().position(|v| v.version == version) else {
            return Err(RegistryError::NotFound(format!("Version {} not found.", version)));
        };

        if permanent {
            if !versions[position].soft_deleted {
                return Err(RegistryError::Transient(format!(
                    "Subject '{}' Version {} was not deleted first before being permanently deleted",
                    subject, version
                )));
            }
            versions.remove(position);
            if versions.is_empty() {
                state.subjects.remove(subject);
            }
            return Ok(());
        }

        if versions[position].soft_deleted {
            return Err(RegistryError::AlreadySoftDeleted(format!(
                "Subject '{}' Version {} was soft deleted.",
                subject, version
            )));
        }
        versions[position].soft_deleted = true;
        Ok(())
    }
}

pub fn config() -> OperatorConfig {
    let mut config = OperatorConfig::default();
    config.controller.sync_interval_secs = 600;
    config
}

pub fn schema(name: &str, subject: &str, content: &str) -> Schema {
    let mut metadata = ObjectMeta::new("default", name);
    metadata
        .labels
        .insert(INSTANCE_LABEL.to_string(), INSTANCE.to_string());
    Schema::new(
        metadata,
        SchemaSpec {
            subject: subject.to_string(),
            content: content.to_string(),
            ..Default::default()
        },
    )
}

pub async fn create_instance(store: &InMemoryStore) {
    store
        .create(&SchemaRegistry::new(
            ObjectMeta::new("default", INSTANCE),
            SchemaRegistrySpec::default(),
        ))
        .await
        .unwrap();
}

/// Apply an edit to the stored Schema, retrying on write conflicts
pub async fn edit_schema(store: &InMemoryStore, name: &str, edit: impl Fn(&mut Schema)) {
    let key = schema_registry_operator::ObjectKey::new("default", name);
    loop {
        let mut current: Schema = store.get(&key).await.unwrap().unwrap();
        edit(&mut current);
        match store.update(&current).await {
            Ok(_) => return,
            Err(schema_registry_operator::StoreError::Conflict { .. }) => continue,
            Err(e) => panic!("edit failed: {}", e),
        }
    }
}
