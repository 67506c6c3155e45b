//! The SchemaVersion resource: one immutable registered revision of a subject

use serde::{Deserialize, Serialize};

use crate::resource::{ObjectMeta, Resource, PREVIOUS_VERSION_ANNOTATION};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersionSpec {
    pub subject: String,
    pub content: String,
    pub version: u32,
    pub registry_schema_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersionStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub active: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub metadata: ObjectMeta,
    pub spec: SchemaVersionSpec,
    #[serde(default)]
    pub status: SchemaVersionStatus,
}

impl SchemaVersion {
    /// Object name for a version of a subject, e.g. `orders-value-v3`
    pub fn object_name(subject: &str, version: u32) -> String {
        format!("{}-v{}", subject, version)
    }

    /// Version that was active when this one was created; `Some(0)` means none
    ///
    /// `None` means the annotation is missing or unreadable, which only happens
    /// when the object was not written by the Schema reconciler.
    pub fn previous_version(&self) -> Option<u32> {
        self.metadata
            .annotation(PREVIOUS_VERSION_ANNOTATION)
            .and_then(|value| value.trim().parse().ok())
    }

    /// Name of the sibling this version superseded
    pub fn previous_object_name(&self) -> Option<String> {
        match self.previous_version() {
            Some(0) | None => None,
            Some(previous) => Some(Self::object_name(&self.spec.subject, previous)),
        }
    }
}

impl Resource for SchemaVersion {
    const KIND: &'static str = "SchemaVersion";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(annotation: Option<&str>) -> SchemaVersion {
        let mut metadata = ObjectMeta::new("default", "s1-value-v2");
        if let Some(value) = annotation {
            metadata
                .annotations
                .insert(PREVIOUS_VERSION_ANNOTATION.to_string(), value.to_string());
        }
        SchemaVersion {
            metadata,
            spec: SchemaVersionSpec {
                subject: "s1-value".to_string(),
                content: "\"string\"".to_string(),
                version: 2,
                registry_schema_id: 7,
            },
            status: SchemaVersionStatus::default(),
        }
    }

    #[test]
    fn test_object_name() {
        assert_eq!(SchemaVersion::object_name("s1-value", 1), "s1-value-v1");
    }

    #[test]
    fn test_previous_version_annotation() {
        assert_eq!(version(Some("1")).previous_version(), Some(1));
        assert_eq!(
            version(Some("1")).previous_object_name().as_deref(),
            Some("s1-value-v1")
        );
        assert_eq!(version(Some("0")).previous_version(), Some(0));
        assert_eq!(version(Some("0")).previous_object_name(), None);
        assert_eq!(version(None).previous_version(), None);
        assert_eq!(version(Some("latest")).previous_version(), None);
    }
}
