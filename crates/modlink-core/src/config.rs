/*!
 * Configuration management for Modlink.
 *
 * This module provides functionality to load, validate, and access
 * configuration settings for the driver runtime and the status store.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for Modlink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Status store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Transport and queue configuration
    #[serde(default)]
    pub comm: CommConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Status store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store connection URL; `REDIS_URL` overrides the built-in default
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Key prefix shared platform-wide
    #[serde(default = "default_store_prefix")]
    pub prefix: String,

    /// Timeout for a single store round-trip in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl StoreConfig {
    /// Store round-trip timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        crate::utils::millis_to_duration(self.request_timeout_ms)
    }
}

/// Transport and queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommConfig {
    /// Size of the transport read buffer in bytes (at least 2 KiB)
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Initial reconnect backoff in milliseconds
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Maximum reconnect backoff in milliseconds
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Random jitter added to each backoff in milliseconds
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,

    /// Ceiling on a single framed message in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl CommConfig {
    /// Initial reconnect backoff as a [`Duration`]
    pub fn reconnect_base(&self) -> Duration {
        crate::utils::millis_to_duration(self.reconnect_base_ms)
    }

    /// Maximum reconnect backoff as a [`Duration`]
    pub fn reconnect_max(&self) -> Duration {
        crate::utils::millis_to_duration(self.reconnect_max_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            logging: LoggingConfig::default(),
            store: StoreConfig::default(),
            comm: CommConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            prefix: default_store_prefix(),
            request_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_jitter_ms: default_reconnect_jitter_ms(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

fn default_app_name() -> String {
    "modlink".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn default_store_prefix() -> String {
    "status".to_string()
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_read_buffer_size() -> usize {
    2_048
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}

fn default_reconnect_jitter_ms() -> u64 {
    500
}

fn default_max_frame_size() -> usize {
    1024 * 1024
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            config::Config::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!(
                    "Configuration file {} does not exist, using defaults",
                    config_file
                );
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!(
                "Loading configuration from environment variables with prefix {}",
                prefix
            );
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
