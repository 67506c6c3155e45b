//! Manifest loading
//!
//! Manifests are JSON documents tagged by `kind`, one object or an array of
//! objects per file:
//!
//! ```json
//! {
//!   "kind": "Schema",
//!   "metadata": {
//!     "name": "orders",
//!     "labels": { "client.sroperator.io/instance": "registry-a" }
//!   },
//!   "spec": { "type": "AVRO", "content": "{\"type\": \"string\"}" }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{OperatorError, Result, StoreError};
use crate::resource::{validate_object_name, ObjectKey, Resource, Schema, SchemaRegistry, CONTENT_HASH_LABEL};
use crate::store::ResourceStore;

/// An object an external actor may declare
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    Schema(Schema),
    SchemaRegistry(SchemaRegistry),
}

/// What [`apply_manifest`] did with a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Configured,
    Unchanged,
}

impl Manifest {
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::Schema(_) => Schema::KIND,
            Manifest::SchemaRegistry(_) => SchemaRegistry::KIND,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            Manifest::Schema(schema) => schema.key(),
            Manifest::SchemaRegistry(registry) => registry.key(),
        }
    }

    fn validate(&self) -> Result<()> {
        let key = self.key();
        validate_object_name(&key.namespace)?;
        validate_object_name(&key.name)?;
        // The subject prefixes SchemaVersion object names
        match self {
            Manifest::Schema(schema) if !schema.spec.subject.is_empty() => {
                validate_object_name(&schema.spec.subject)
            }
            _ => Ok(()),
        }
    }
}

/// Parse one manifest file
pub fn load_file(path: &Path) -> Result<Vec<Manifest>> {
    let content = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    let documents = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let mut manifests = Vec::with_capacity(documents.len());
    for document in documents {
        let manifest: Manifest =
            serde_json::from_value(document).map_err(|e| OperatorError::InvalidManifest {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        manifest.validate()?;
        manifests.push(manifest);
    }
    debug!(path = %path.display(), count = manifests.len(), "manifest file loaded");
    Ok(manifests)
}

/// Load manifests from files and directories; directories are walked for
/// `.json` files in path order
pub fn load_paths(paths: &[PathBuf]) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut files = Vec::new();
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry?;
                let file = entry.path();
                if file.is_file() && file.extension().map(|ext| ext == "json").unwrap_or(false) {
                    files.push(file.to_path_buf());
                }
            }
            for file in files {
                manifests.extend(load_file(&file)?);
            }
        } else {
            manifests.extend(load_file(path)?);
        }
    }
    Ok(manifests)
}

/// Create the object, or bring an existing one's spec and labels in line
pub async fn apply_manifest<S: ResourceStore>(store: &S, manifest: &Manifest) -> Result<ApplyOutcome> {
    let outcome = match manifest {
        Manifest::Schema(schema) => apply_schema(store, schema).await?,
        Manifest::SchemaRegistry(registry) => apply_registry(store, registry).await?,
    };
    info!(kind = manifest.kind(), key = %manifest.key(), ?outcome, "manifest applied");
    Ok(outcome)
}

async fn apply_schema<S: ResourceStore>(store: &S, desired: &Schema) -> std::result::Result<ApplyOutcome, StoreError> {
    let Some(existing) = store.get::<Schema>(&desired.key()).await? else {
        let mut fresh = Schema::new(desired.metadata.clone(), desired.spec.clone());
        fresh.metadata.labels.remove(CONTENT_HASH_LABEL);
        store.create(&fresh).await?;
        return Ok(ApplyOutcome::Created);
    };

    let mut next = existing.clone();
    next.spec = desired.spec.clone();
    // Target and type never change after the first write
    next.spec.target = existing.spec.target;
    next.spec.format = existing.spec.format;
    next.metadata.labels = desired.metadata.labels.clone();
    next.metadata.labels.remove(CONTENT_HASH_LABEL);
    if let Some(hash) = existing.metadata.label(CONTENT_HASH_LABEL) {
        next.metadata.labels.insert(CONTENT_HASH_LABEL.to_string(), hash.to_string());
    }
    next.metadata.annotations = desired.metadata.annotations.clone();
    write_if_changed(store, &existing, &next).await
}

async fn apply_registry<S: ResourceStore>(
    store: &S,
    desired: &SchemaRegistry,
) -> std::result::Result<ApplyOutcome, StoreError> {
    let Some(existing) = store.get::<SchemaRegistry>(&desired.key()).await? else {
        store
            .create(&SchemaRegistry::new(desired.metadata.clone(), desired.spec.clone()))
            .await?;
        return Ok(ApplyOutcome::Created);
    };

    let mut next = existing.clone();
    next.spec = desired.spec.clone();
    next.metadata.labels = desired.metadata.labels.clone();
    next.metadata.annotations = desired.metadata.annotations.clone();
    write_if_changed(store, &existing, &next).await
}

async fn write_if_changed<S: ResourceStore, K: Resource + PartialEq>(
    store: &S,
    existing: &K,
    next: &K,
) -> std::result::Result<ApplyOutcome, StoreError> {
    if existing == next {
        return Ok(ApplyOutcome::Unchanged);
    }
    store.update(next).await?;
    Ok(ApplyOutcome::Configured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{SchemaFormat, SchemaTarget, INSTANCE_LABEL};
    use crate::store::InMemoryStore;
    use tempfile::TempDir;

    const SCHEMA_MANIFEST: &str = r#"{
        "kind": "Schema",
        "metadata": {
            "name": "orders",
            "labels": { "client.sroperator.io/instance": "registry-a" }
        },
        "spec": { "content": "{\"type\": \"string\"}" }
    }"#;

    fn parse(json: &str) -> Manifest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_manifest_tagged_by_kind() {
        let manifest = parse(SCHEMA_MANIFEST);
        assert_eq!(manifest.kind(), "Schema");
        assert_eq!(manifest.key(), ObjectKey::new("default", "orders"));

        let Manifest::Schema(schema) = manifest else {
            panic!("expected a Schema manifest");
        };
        assert_eq!(schema.metadata.label(INSTANCE_LABEL), Some("registry-a"));
        assert_eq!(schema.spec.target, SchemaTarget::Value);
        assert_eq!(schema.spec.format, SchemaFormat::Avro);
    }

    #[test]
    fn test_load_paths_walks_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/orders.json"), SCHEMA_MANIFEST).unwrap();
        fs::write(
            dir.path().join("registry.json"),
            r#"[{"kind": "SchemaRegistry", "metadata": {"name": "registry-a"}, "spec": {}}]"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let manifests = load_paths(&[dir.path().to_path_buf()]).unwrap();
        let kinds: Vec<_> = manifests.iter().map(Manifest::kind).collect();
        assert_eq!(kinds, vec!["Schema", "SchemaRegistry"]);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, SCHEMA_MANIFEST.replace("\"orders\"", "\"Orders_Topic\"")).unwrap();
        assert!(matches!(load_file(&path), Err(OperatorError::InvalidName { .. })));

        for subject in ["team/orders", "orders?v=1", "orders value"] {
            let manifest = SCHEMA_MANIFEST.replace(
                r#""spec": {"#,
                &format!(r#""spec": {{ "subject": "{}","#, subject),
            );
            fs::write(&path, manifest).unwrap();
            assert!(
                matches!(load_file(&path), Err(OperatorError::InvalidName { .. })),
                "subject {subject} accepted"
            );
        }

        fs::write(&path, r#"{"kind": "Topic", "metadata": {"name": "t"}}"#).unwrap();
        assert!(matches!(load_file(&path), Err(OperatorError::InvalidManifest { .. })));
    }

    #[tokio::test]
    async fn test_apply_preserves_converged_state() {
        let store = InMemoryStore::new();
        let manifest = parse(SCHEMA_MANIFEST);
        assert_eq!(apply_manifest(&store, &manifest).await.unwrap(), ApplyOutcome::Created);
        assert_eq!(apply_manifest(&store, &manifest).await.unwrap(), ApplyOutcome::Unchanged);

        let key = manifest.key();
        let mut converged: Schema = store.get(&key).await.unwrap().unwrap();
        converged
            .metadata
            .labels
            .insert(CONTENT_HASH_LABEL.to_string(), "abc".to_string());
        store.update(&converged).await.unwrap();

        let Manifest::Schema(mut edited) = manifest else {
            unreachable!()
        };
        edited.spec.content = r#"{"type": "int"}"#.to_string();
        edited.spec.target = SchemaTarget::Key;
        let outcome = apply_manifest(&store, &Manifest::Schema(edited)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Configured);

        let stored: Schema = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.spec.content, r#"{"type": "int"}"#);
        assert_eq!(stored.spec.target, SchemaTarget::Value);
        assert_eq!(stored.metadata.label(CONTENT_HASH_LABEL), Some("abc"));
        assert_eq!(stored.metadata.label(INSTANCE_LABEL), Some("registry-a"));
    }
}
