//! Configuration file loader.

use std::path::Path;

use super::error::{ConfigError, ConfigResult};
use super::types::DaemonConfig;

/// Loads and validates daemon configuration.
#[derive(Debug, Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Create a new configuration loader.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Load configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable, malformed, or
    /// fails validation.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> ConfigResult<DaemonConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        self.load_str(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or validation fails.
    pub fn load_str(&self, content: &str) -> ConfigResult<DaemonConfig> {
        let config: DaemonConfig = toml::from_str(content)?;
        validate(&config)?;
        Ok(config)
    }

    /// Load configuration or return defaults if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(&self, path: P) -> ConfigResult<DaemonConfig> {
        let path = path.as_ref();
        if path.exists() {
            self.load(path)
        } else {
            Ok(DaemonConfig::default())
        }
    }
}

fn validate(config: &DaemonConfig) -> ConfigResult<()> {
    if config.daemon.grpc_listen == config.daemon.http_listen {
        return Err(ConfigError::ValidationError(
            "grpc_listen and http_listen must differ".to_string(),
        ));
    }
    if config.cache.capacity == 0 {
        return Err(ConfigError::ValidationError(
            "cache.capacity must be greater than zero".to_string(),
        ));
    }
    if config.cache.shards == 0 {
        return Err(ConfigError::ValidationError(
            "cache.shards must be greater than zero".to_string(),
        ));
    }
    if config.behavior.global_broadcast_ms == 0 {
        return Err(ConfigError::ValidationError(
            "behavior.global_broadcast_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
