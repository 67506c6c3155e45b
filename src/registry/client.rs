//! HTTP client for the Confluent-compatible registry REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RegistryError;
use crate::registry::{RegisteredSchema, RegistryEndpoint, SchemaRegistryApi, SchemaSubmission};
use crate::resource::CompatibilityLevel;

const CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

// Registry error codes carried in 404 bodies
const SUBJECT_NOT_FOUND: u32 = 40401;
const VERSION_NOT_FOUND: u32 = 40402;
const SCHEMA_NOT_FOUND: u32 = 40403;
const SUBJECT_SOFT_DELETED: u32 = 40404;
const SCHEMA_VERSION_SOFT_DELETED: u32 = 40406;
const SUBJECT_LEVEL_COMPATIBILITY_NOT_CONFIGURED: u32 = 40408;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    schema: &'a str,
    schema_type: &'a str,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: u32,
}

#[derive(Serialize)]
struct ConfigUpdateRequest<'a> {
    compatibility: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    compatibility_level: Option<String>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    error_code: Option<u32>,
    message: Option<String>,
}

/// HTTP implementation of [`SchemaRegistryApi`]
#[derive(Clone)]
pub struct HttpRegistryClient {
    client: reqwest::Client,
}

impl HttpRegistryClient {
    pub fn new(timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Transient(format!("building http client: {e}")))?;
        Ok(Self { client })
    }

    /// Endpoint URL with each segment percent-encoded
    fn url(endpoint: &RegistryEndpoint, segments: &[&str]) -> Result<Url, RegistryError> {
        let base = endpoint.base_url();
        let mut url =
            Url::parse(base).map_err(|e| RegistryError::Transient(format!("invalid registry url {base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| RegistryError::Transient(format!("registry url {base} cannot carry a path")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(request: reqwest::RequestBuilder, action: &str) -> Result<Response, RegistryError> {
        request
            .header(reqwest::header::ACCEPT, CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| RegistryError::Transient(format!("{action} request failed: {e}")))
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response, action: &str) -> Result<T, RegistryError> {
        response
            .json::<T>()
            .await
            .map_err(|e| RegistryError::Transient(format!("invalid {action} response: {e}")))
    }
}

/// Map a non-2xx response to the facade's error taxonomy
async fn error_from(response: Response, action: &str) -> RegistryError {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    let parsed: ErrorBody = serde_json::from_slice(&body).unwrap_or_default();
    let message = parsed
        .message
        .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());

    classify(status, parsed.error_code, message, action)
}

fn classify(status: StatusCode, error_code: Option<u32>, message: String, action: &str) -> RegistryError {
    match status {
        StatusCode::UNPROCESSABLE_ENTITY => RegistryError::InvalidSchemaOrType(message),
        StatusCode::CONFLICT => RegistryError::IncompatibleSchema(message),
        StatusCode::NOT_FOUND => match error_code {
            Some(SCHEMA_VERSION_SOFT_DELETED) => RegistryError::AlreadySoftDeleted(message),
            Some(
                SUBJECT_NOT_FOUND
                | VERSION_NOT_FOUND
                | SCHEMA_NOT_FOUND
                | SUBJECT_SOFT_DELETED
                | SUBJECT_LEVEL_COMPATIBILITY_NOT_CONFIGURED,
            )
            | None => RegistryError::NotFound(message),
            // 40405 / 40407: permanent delete attempted before the soft delete
            Some(code) => RegistryError::Transient(format!("{action} failed ({status}, {code}): {message}")),
        },
        _ => RegistryError::Transient(format!("{action} failed ({status}): {message}")),
    }
}

#[async_trait]
impl SchemaRegistryApi for HttpRegistryClient {
    async fn register(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
        schema: SchemaSubmission<'_>,
    ) -> Result<u32, RegistryError> {
        let url = Self::url(endpoint, &["subjects", subject, "versions"])?;
        debug!(%url, schema_type = schema.format.as_str(), "registering schema");
        let request = self
            .client
            .post(url)
            .query(&[("normalize", schema.normalize)])
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(
                serde_json::to_vec(&RegisterRequest {
                    schema: schema.content,
                    schema_type: schema.format.as_str(),
                })
                .map_err(|e| RegistryError::Transient(format!("encoding register request: {e}")))?,
            );
        let response = Self::send(request, "register").await?;
        if !response.status().is_success() {
            return Err(error_from(response, "register").await);
        }
        let registered: RegisterResponse = Self::json(response, "register").await?;
        Ok(registered.id)
    }

    async fn fetch_latest(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
    ) -> Result<RegisteredSchema, RegistryError> {
        let url = Self::url(endpoint, &["subjects", subject, "versions", "latest"])?;
        let response = Self::send(self.client.get(url), "fetch latest").await?;
        if !response.status().is_success() {
            return Err(error_from(response, "fetch latest").await);
        }
        Self::json(response, "fetch latest").await
    }

    async fn get_compatibility(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
    ) -> Result<Option<CompatibilityLevel>, RegistryError> {
        let request = self
            .client
            .get(Self::url(endpoint, &["config", subject])?)
            .query(&[("defaultToGlobal", true)]);
        let response = Self::send(request, "get compatibility").await?;
        if !response.status().is_success() {
            return match error_from(response, "get compatibility").await {
                RegistryError::NotFound(_) => Ok(None),
                other => Err(other),
            };
        }
        let config: ConfigResponse = Self::json(response, "get compatibility").await?;
        Ok(config
            .compatibility_level
            .as_deref()
            .and_then(CompatibilityLevel::parse))
    }

    async fn set_compatibility(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
        level: CompatibilityLevel,
    ) -> Result<(), RegistryError> {
        let body = serde_json::to_vec(&ConfigUpdateRequest {
            compatibility: level.as_str(),
        })
        .map_err(|e| RegistryError::Transient(format!("encoding config request: {e}")))?;
        let request = self
            .client
            .put(Self::url(endpoint, &["config", subject])?)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body);
        let response = Self::send(request, "set compatibility").await?;
        if !response.status().is_success() {
            return Err(match error_from(response, "set compatibility").await {
                RegistryError::Transient(message) => RegistryError::Transient(message),
                other => RegistryError::Transient(other.to_string()),
            });
        }
        Ok(())
    }

    async fn delete_subject(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
        permanent: bool,
    ) -> Result<(), RegistryError> {
        let request = self
            .client
            .delete(Self::url(endpoint, &["subjects", subject])?)
            .query(&[("permanent", permanent)]);
        let response = Self::send(request, "delete subject").await?;
        if !response.status().is_success() {
            return Err(error_from(response, "delete subject").await);
        }
        Ok(())
    }

    async fn delete_version(
        &self,
        endpoint: &RegistryEndpoint,
        subject: &str,
        version: u32,
        permanent: bool,
    ) -> Result<(), RegistryError> {
        let version = version.to_string();
        let url = Self::url(endpoint, &["subjects", subject, "versions", &version])?;
        let request = self.client.delete(url).query(&[("permanent", permanent)]);
        let response = Self::send(request, "delete version").await?;
        if !response.status().is_success() {
            return Err(error_from(response, "delete version").await);
        }
        Ok(())
    }
}
