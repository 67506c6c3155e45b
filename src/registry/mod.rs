//! Schema registry facade
//!
//! A typed view of the registry REST surface the reconcilers depend on.
//! Every call targets an explicit [`RegistryEndpoint`]; there are no retries
//! here, the reconcilers decide when to try again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::resource::{CompatibilityLevel, SchemaFormat};

pub mod client;

pub use client::HttpRegistryClient;

/// Base URL of one registry instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryEndpoint {
    base_url: String,
}

impl RegistryEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Version and id the registry assigned to a subject's schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredSchema {
    pub id: u32,
    pub version: u32,
}

/// Schema submitted for registration
#[derive(Debug, Clone, Copy)]
pub struct SchemaSubmission<'a> {
    pub content: &'a str,
    pub format: SchemaFormat,
    pub normalize: bool,
}

#[async_trait]
pub trait SchemaRegistryApi: Send + Sync + 'static {
    /// Register content under a subject, returning the schema id
    ///
    /// 422 maps to `InvalidSchemaOrType`, 409 to `IncompatibleSchema`.
    async fn register(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
        schema: SchemaSubmission<'_>,
    ) -> Result<u32, RegistryError>;

    async fn fetch_latest(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
    ) -> Result<RegisteredSchema, RegistryError>;

    /// Effective level for the subject, `None` when the registry reports none
    async fn get_compatibility(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
    ) -> Result<Option<CompatibilityLevel>, RegistryError>;

    async fn set_compatibility(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
        level: CompatibilityLevel,
    ) -> Result<(), RegistryError>;

    async fn delete_subject(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
        permanent: bool,
    ) -> Result<(), RegistryError>;

    async fn delete_version(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
        version: u32,
        permanent: bool,
    ) -> Result<(), RegistryError>;
}
