//! Configuration management for the operator
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (operator.toml)
//! - Environment variables (SRO__*)
//!
//! ## Example config file (operator.toml):
//! ```toml
//! [controller]
//! sync_interval_secs = 60
//! error_backoff_secs = 60
//! instance_backoff_secs = 300
//! max_concurrent_reconciles = 4
//!
//! [registry]
//! scheme = "http"
//! default_port = 8081
//! request_timeout_secs = 30
//!
//! [logging]
//! filter = "info,schema_registry_operator=debug"
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the operator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Reconcile scheduling
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Registry connection defaults
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Requeue cadence and concurrency of the control loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Resync cadence for Schemas that do not set `syncInterval`
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Backoff after registry, network or store failures
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,

    /// Backoff while the registry instance cannot be resolved, or while a
    /// subject collision blocks registration
    #[serde(default = "default_instance_backoff")]
    pub instance_backoff_secs: u64,

    /// Reconciles allowed to run at once across distinct objects
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_reconciles: usize,
}

/// How registry endpoints are derived from SchemaRegistry objects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Port used when the SchemaRegistry object does not set one
    #[serde(default = "default_port")]
    pub default_port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_sync_interval() -> u64 {
    60
}

fn default_error_backoff() -> u64 {
    60
}

fn default_instance_backoff() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    4
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_request_timeout() -> u64 {
    30
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            error_backoff_secs: default_error_backoff(),
            instance_backoff_secs: default_instance_backoff(),
            max_concurrent_reconciles: default_max_concurrent(),
        }
    }
}

impl ControllerConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn instance_backoff(&self) -> Duration {
        Duration::from_secs(self.instance_backoff_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            default_port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl RegistryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, layering an explicit file over the default locations
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = [
            "operator.toml",
            ".operator.toml",
            "config/operator.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(config_dir) = directories::ProjectDirs::from("io", "sroperator", "schema-operator") {
            let xdg_config = config_dir.config_dir().join("operator.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // SRO__CONTROLLER__SYNC_INTERVAL_SECS=30
        builder = builder.add_source(
            Environment::with_prefix("SRO")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OperatorConfig::default();
        assert_eq!(config.controller.sync_interval(), Duration::from_secs(60));
        assert_eq!(config.controller.error_backoff(), Duration::from_secs(60));
        assert!(config.controller.instance_backoff() > config.controller.error_backoff());
        assert_eq!(config.registry.default_port, 8081);
    }

    #[test]
    fn test_serialize_config() {
        let config = OperatorConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[controller]"));
        assert!(toml_str.contains("[registry]"));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[controller]\nsync_interval_secs = 15\n\n[registry]\ndefault_port = 9090\n",
        )
        .unwrap();

        let config = OperatorConfig::load_from(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.controller.sync_interval_secs, 15);
        assert_eq!(config.controller.error_backoff_secs, 60);
        assert_eq!(config.registry.default_port, 9090);
        assert_eq!(config.registry.scheme, "http");
    }
}
