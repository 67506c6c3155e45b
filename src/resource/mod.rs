//! Declarative object model
//!
//! Objects follow the usual control-plane shape: `metadata`, `spec` and a
//! `status` written separately from the spec.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::OperatorError;

pub mod registry;
pub mod schema;
pub mod schema_version;

pub use registry::{SchemaRegistry, SchemaRegistrySpec};
pub use schema::{CompatibilityLevel, Schema, SchemaFormat, SchemaSpec, SchemaStatus, SchemaTarget};
pub use schema_version::{SchemaVersion, SchemaVersionSpec, SchemaVersionStatus};

/// Label naming the SchemaRegistry instance an object belongs to
pub const INSTANCE_LABEL: &str = "client.sroperator.io/instance";

/// Label caching the content checksum of the last converged Schema
pub const CONTENT_HASH_LABEL: &str = "client.sroperator.io/content-hash";

/// Annotation on a SchemaVersion pointing at the version active before it
pub const PREVIOUS_VERSION_ANNOTATION: &str = "client.sroperator.io/previous-version";

/// Deletion guard held until registry cleanup has finished
pub const FINALIZER: &str = "client.sroperator.io/finalizer";

/// Namespace + name of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference from a child to the object that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

/// Metadata shared by every object in the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Assigned by the store on creation
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Opaque optimistic-concurrency token, assigned by the store
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    /// Bumped by the store whenever the spec changes
    #[serde(default)]
    pub generation: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was not present yet
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_references.iter().any(|owner| owner.uid == uid)
    }
}

/// An object kind the store can hold
pub trait Resource: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }

    /// Owner reference pointing at this object, for children it controls
    fn controller_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: Self::KIND.to_string(),
            name: self.meta().name.clone(),
            uid: self.meta().uid.clone(),
            controller: true,
        }
    }
}

/// Label equality selector used when listing objects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

fn dns_subdomain() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .expect("valid DNS-1123 pattern")
    })
}

/// Check a name against the DNS-1123 subdomain rules used for object names
pub fn validate_object_name(name: &str) -> Result<(), OperatorError> {
    if name.is_empty() || name.len() > 253 {
        return Err(OperatorError::InvalidName {
            name: name.to_string(),
            reason: "must be between 1 and 253 characters".to_string(),
        });
    }
    if !dns_subdomain().is_match(name) {
        return Err(OperatorError::InvalidName {
            name: name.to_string(),
            reason: "must consist of lower case alphanumerics, '-' or '.', and start and end with an alphanumeric".to_string(),
        });
    }
    Ok(())
}
