//! Configuration types for the HTTP service
//!
//! Sources, applied in order with later sources overriding earlier ones:
//!
//! 1. `/etc/vm-history/service.yaml`
//! 2. `./config/service.yaml`
//! 3. An explicit file passed by the operator (required when given)
//! 4. Environment variables prefixed `VMH__`, e.g. `VMH__SERVER__PORT=9000`
//!
//! Every field carries a default, so an unconfigured environment still
//! yields a complete configuration. [`ServiceConfig::validate`] then rejects
//! the settings the service cannot run without.

use crate::errors::ConfigError;
use crate::observer::ObserverConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use vm_history_core::{EncryptionConfig, MaskingConfig, ProvisioningConfig, TrackerConfig};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "VMH";

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Credential encryption settings
    pub encryption: EncryptionConfig,

    /// Sensitive-data masking rules
    pub masking: MaskingConfig,

    /// Operation tracker behaviour
    pub tracker: TrackerConfig,

    /// Provisioning tool invocation
    pub provisioning: ProvisioningConfig,

    /// Inbound request recording
    pub observer: ObserverConfig,

    /// Event store backend
    pub storage: StorageConfig,
}

impl ServiceConfig {
    /// Load configuration from the layered sources
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] when a file is malformed, the explicit
    /// file is missing, or a value cannot be coerced to its field type.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(
                config::File::with_name("/etc/vm-history/service")
                    .required(false)
                    .format(config::FileFormat::Yaml),
            )
            .add_source(
                config::File::with_name("config/service")
                    .required(false)
                    .format(config::FileFormat::Yaml),
            );

        if let Some(path) = explicit_path {
            info!(path = %path.display(), "Loading configuration from explicit path");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.encryption
            .resolve_secret()
            .map_err(|e| ConfigError::Missing {
                key: format!("encryption.secret ({})", e),
            })?;

        if self.server.port == 0 {
            return Err(ConfigError::Invalid {
                message: "server.port must be non-zero".to_string(),
            });
        }

        if self.provisioning.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                message: "provisioning.timeout_seconds must be greater than zero".to_string(),
            });
        }

        if self.provisioning.program.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "provisioning.program must not be empty".to_string(),
            });
        }

        if self.tracker.cancellation_update_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                message: "tracker.cancellation_update_timeout_ms must be greater than zero"
                    .to_string(),
            });
        }

        if self.masking.mask_char.is_whitespace() {
            return Err(ConfigError::Invalid {
                message: "masking.mask_char must be visible".to_string(),
            });
        }

        if self.storage.backend == StorageBackend::Filesystem
            && self.storage.path.as_os_str().is_empty()
        {
            return Err(ConfigError::Missing {
                key: "storage.path".to_string(),
            });
        }

        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,

    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            shutdown_timeout_seconds: 30,
            enable_cors: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level, used when `RUST_LOG` is unset
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Event store backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local, lost on restart
    #[default]
    Memory,
    /// One JSON document per event under `path`
    Filesystem,
}

/// Event store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Root directory for the filesystem backend
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("./data/history"),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
