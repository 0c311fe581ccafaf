//! Configuration loading and environment variable handling

use crate::domains::cluster::ClusterConfig;
use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::DroverConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "DROVER".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<DroverConfig> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path)?;
        let mut config: DroverConfig = serde_yaml::from_str(&content)?;

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config)?;

        // Validate all domains
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<DroverConfig> {
        let mut config = DroverConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<DroverConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut DroverConfig) -> ConfigResult<()> {
        self.apply_cluster_overrides(&mut config.cluster)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply cluster config overrides
    fn apply_cluster_overrides(&self, config: &mut ClusterConfig) -> ConfigResult<()> {
        if let Ok(workers) = self.get_env_var("WORKERS") {
            config.workers = workers
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid WORKERS: {}", e)))?;
        }

        if let Some(timeout) = self.get_env_millis("CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = timeout;
        }

        if let Some(timeout) = self.get_env_millis("SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = timeout;
        }

        if let Some(timeout) = self.get_env_millis("WORKER_TIMEOUT_MS")? {
            config.worker_timeout = timeout;
        }

        if let Ok(share) = self.get_env_var("SHARE_SOCKETS") {
            config.share_sockets = share
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid SHARE_SOCKETS: {}", e)))?;
        }

        if let Ok(dir) = self.get_env_var("RENDEZVOUS_DIR") {
            config.rendezvous_dir = Some(PathBuf::from(dir));
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    fn get_env_millis(&self, name: &str) -> ConfigResult<Option<Duration>> {
        match self.get_env_var(name) {
            Ok(value) => {
                let millis: u64 = value
                    .parse()
                    .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
                Ok(Some(Duration::from_millis(millis)))
            }
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
