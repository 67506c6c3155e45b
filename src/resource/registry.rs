//! The SchemaRegistry resource, read only to locate a registry endpoint
//!
//! Deploying the registry server itself is handled elsewhere; this crate only
//! needs enough of the object to build a base URL.

use serde::{Deserialize, Serialize};

use crate::config::RegistryConfig;
use crate::registry::RegistryEndpoint;
use crate::resource::{ObjectMeta, Resource};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRegistrySpec {
    /// Host name of the registry service; the object name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRegistry {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SchemaRegistrySpec,
    #[serde(default)]
    pub status: serde_json::Value,
}

impl SchemaRegistry {
    pub fn new(metadata: ObjectMeta, spec: SchemaRegistrySpec) -> Self {
        Self {
            metadata,
            spec,
            status: serde_json::Value::Null,
        }
    }

    pub fn endpoint(&self, defaults: &RegistryConfig) -> RegistryEndpoint {
        let scheme = self.spec.scheme.as_deref().unwrap_or(&defaults.scheme);
        let host = self.spec.host.as_deref().unwrap_or(&self.metadata.name);
        let port = self.spec.port.unwrap_or(defaults.default_port);
        RegistryEndpoint::new(format!("{}://{}:{}", scheme, host, port))
    }
}

impl Resource for SchemaRegistry {
    const KIND: &'static str = "SchemaRegistry";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
