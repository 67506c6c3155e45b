//! The Schema resource: a desired schema definition for one subject

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::resource::{ObjectMeta, Resource, CONTENT_HASH_LABEL};

/// Which half of a record the schema describes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaTarget {
    #[default]
    Value,
    Key,
}

impl SchemaTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaTarget::Value => "VALUE",
            SchemaTarget::Key => "KEY",
        }
    }
}

/// Schema language understood by the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaFormat {
    #[default]
    Avro,
    Protobuf,
    Json,
}

impl SchemaFormat {
    /// The `schemaType` value sent to the registry
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaFormat::Avro => "AVRO",
            SchemaFormat::Protobuf => "PROTOBUF",
            SchemaFormat::Json => "JSON",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompatibilityLevel {
    #[default]
    None,
    Backward,
    BackwardTransitive,
    Forward,
    ForwardTransitive,
    Full,
    FullTransitive,
}

impl CompatibilityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompatibilityLevel::None => "NONE",
            CompatibilityLevel::Backward => "BACKWARD",
            CompatibilityLevel::BackwardTransitive => "BACKWARD_TRANSITIVE",
            CompatibilityLevel::Forward => "FORWARD",
            CompatibilityLevel::ForwardTransitive => "FORWARD_TRANSITIVE",
            CompatibilityLevel::Full => "FULL",
            CompatibilityLevel::FullTransitive => "FULL_TRANSITIVE",
        }
    }

    /// Parse the level as reported by the registry
    pub fn parse(level: &str) -> Option<Self> {
        let level = match level {
            "NONE" => CompatibilityLevel::None,
            "BACKWARD" => CompatibilityLevel::Backward,
            "BACKWARD_TRANSITIVE" => CompatibilityLevel::BackwardTransitive,
            "FORWARD" => CompatibilityLevel::Forward,
            "FORWARD_TRANSITIVE" => CompatibilityLevel::ForwardTransitive,
            "FULL" => CompatibilityLevel::Full,
            "FULL_TRANSITIVE" => CompatibilityLevel::FullTransitive,
            _ => return None,
        };
        Some(level)
    }
}

impl fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired state of a Schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSpec {
    /// Subject prefix; the object name is used when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,

    /// Immutable after creation
    #[serde(default)]
    pub target: SchemaTarget,

    /// Immutable after creation
    #[serde(default, rename = "type")]
    pub format: SchemaFormat,

    /// Raw schema text
    pub content: String,

    #[serde(default)]
    pub compatibility_level: CompatibilityLevel,

    #[serde(default)]
    pub normalize: bool,

    /// Resync cadence in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_interval: Option<u64>,
}

/// Observed state of a Schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaStatus {
    #[serde(default)]
    pub latest_version: u32,

    #[serde(default)]
    pub message: String,

    /// Set only when the registry rejected the content
    #[serde(default)]
    pub registry_error: String,

    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub metadata: ObjectMeta,
    pub spec: SchemaSpec,
    #[serde(default)]
    pub status: SchemaStatus,
}

impl Schema {
    pub fn new(metadata: ObjectMeta, spec: SchemaSpec) -> Self {
        Self {
            metadata,
            spec,
            status: SchemaStatus::default(),
        }
    }

    /// The subject this schema is registered under, e.g. `orders-value`
    pub fn effective_subject(&self) -> String {
        let subject = if self.spec.subject.is_empty() {
            &self.metadata.name
        } else {
            &self.spec.subject
        };
        format!("{}-{}", subject, self.spec.target.as_str().to_lowercase())
    }

    /// Fingerprint of every spec field that shapes registry state
    ///
    /// Target and type are immutable, so content, compatibility level and the
    /// normalize flag are enough.
    pub fn content_checksum(&self) -> Checksum {
        Checksum::from_parts([
            self.spec.content.as_str(),
            self.spec.compatibility_level.as_str(),
            if self.spec.normalize { "normalize" } else { "" },
        ])
    }

    /// Whether the content differs from what was last converged
    pub fn content_changed(&self) -> bool {
        match self.metadata.label(CONTENT_HASH_LABEL) {
            Some(label) => !self.content_checksum().matches_label(label),
            None => true,
        }
    }

    /// True until the first successful registration has been committed
    pub fn is_first_registration(&self) -> bool {
        self.metadata.label(CONTENT_HASH_LABEL).is_none()
    }

    pub fn sync_interval(&self, default: Duration) -> Duration {
        self.spec
            .sync_interval
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

impl Resource for Schema {
    const KIND: &'static str = "Schema";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
