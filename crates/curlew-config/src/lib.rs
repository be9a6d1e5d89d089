// crates/curlew-config/src/lib.rs
// ============================================================================
// Module: Curlew Configuration
// Description: Configuration loading and validation for the readings service.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: serde, serde_json, thiserror, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with a size limit and validated
//! fail-closed: a missing file yields defaults, but a present file that does
//! not parse or violates a limit is an error. The path comes from an
//! explicit argument, the `CURLEW_CONFIG` environment variable, or the
//! default `curlew.toml` in the working directory.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "curlew.toml";
/// Environment variable used to override the config path.
pub(crate) const CONFIG_ENV_VAR: &str = "CURLEW_CONFIG";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 256 * 1024;
/// Minimum flush timeout in milliseconds.
pub(crate) const MIN_FLUSH_TIMEOUT_MS: u64 = 10;
/// Maximum flush timeout in milliseconds.
pub(crate) const MAX_FLUSH_TIMEOUT_MS: u64 = 600_000;
/// Maximum ingest queue threshold.
pub(crate) const MAX_QUEUE_THRESHOLD: usize = 100_000;
/// Maximum number of readings tables pre-allocated per database file.
pub(crate) const MAX_READINGS_TO_ALLOCATE: usize = 1_000;
/// Maximum storage connection pool size.
pub(crate) const MAX_POOL_SIZE: usize = 64;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("config io error: {0}")]
    Io(String),
    /// The file exceeded [`MAX_CONFIG_FILE_SIZE`].
    #[error("config file too large: {actual} bytes (max {max})")]
    TooLarge {
        /// Maximum allowed bytes.
        max: usize,
        /// Actual file size in bytes.
        actual: usize,
    },
    /// The file did not parse as TOML.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A value violated a documented limit.
    #[error("config invalid: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Configuration Types
// ============================================================================

/// Top-level Curlew service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CurlewConfig {
    /// Storage engine configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Ingest scheduler configuration.
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Purge engine configuration.
    #[serde(default)]
    pub purge: PurgeConfig,
    /// Management client configuration.
    #[serde(default)]
    pub management: ManagementConfig,
    /// Ordered filter pipeline.
    #[serde(default)]
    pub filters: Vec<FilterEntry>,
}

/// Storage engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the service and readings database files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Readings tables created in advance per database file.
    #[serde(default = "default_readings_to_allocate")]
    pub readings_to_allocate: usize,
    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            pool_size: default_pool_size(),
            readings_to_allocate: default_readings_to_allocate(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Ingest scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Maximum time before a queue of readings is flushed, in milliseconds.
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    /// Queue length that triggers an immediate flush.
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: usize,
    /// South service name reported in asset-tracking tuples.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// South plugin name reported in asset-tracking tuples.
    #[serde(default = "default_plugin_name")]
    pub plugin_name: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: default_flush_timeout_ms(),
            queue_threshold: default_queue_threshold(),
            service_name: default_service_name(),
            plugin_name: default_plugin_name(),
        }
    }
}

/// Purge engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PurgeConfig {
    /// Retention age in hours; zero derives the age from the oldest data.
    #[serde(default)]
    pub retain_hours: u64,
    /// Keep readings the north side has not acknowledged.
    #[serde(default = "default_true")]
    pub keep_unsent: bool,
    /// Purge cycle interval in seconds.
    #[serde(default = "default_purge_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retain_hours: 0,
            keep_unsent: default_true(),
            interval_secs: default_purge_interval_secs(),
        }
    }
}

/// Management client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagementConfig {
    /// Base URL of the management service.
    #[serde(default = "default_management_url")]
    pub base_url: String,
    /// Request timeout in milliseconds.
    #[serde(default = "default_management_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            base_url: default_management_url(),
            timeout_ms: default_management_timeout_ms(),
        }
    }
}

/// One filter in the ingest pipeline, in execution order.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterEntry {
    /// Registered filter name.
    pub name: String,
    /// Filter-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

// ============================================================================
// SECTION: Defaults
// ============================================================================

/// Returns the default data directory.
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Returns the default connection pool size.
const fn default_pool_size() -> usize {
    4
}

/// Returns the default number of pre-allocated readings tables.
const fn default_readings_to_allocate() -> usize {
    15
}

/// Returns the default SQLite busy timeout in milliseconds.
const fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Returns the default flush timeout in milliseconds.
const fn default_flush_timeout_ms() -> u64 {
    5_000
}

/// Returns the default queue flush threshold.
const fn default_queue_threshold() -> usize {
    100
}

/// Returns the default south service name.
fn default_service_name() -> String {
    "curlew-south".to_string()
}

/// Returns the default south plugin name.
fn default_plugin_name() -> String {
    "curlew".to_string()
}

/// Returns `true`; serde default helper for opt-out flags.
const fn default_true() -> bool {
    true
}

/// Returns the default purge interval in seconds.
const fn default_purge_interval_secs() -> u64 {
    3_600
}

/// Returns the default management service URL.
fn default_management_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

/// Returns the default management request timeout in milliseconds.
const fn default_management_timeout_ms() -> u64 {
    10_000
}

// ============================================================================
// SECTION: Loading
// ============================================================================

impl CurlewConfig {
    /// Loads configuration from the resolved path.
    ///
    /// A missing file yields the defaults; a present file must parse and
    /// validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read, parse, or validation failure.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_config_path(path);
        if !resolved.exists() {
            return Ok(Self::default());
        }
        let metadata =
            fs::metadata(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        let actual = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
        if actual > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::TooLarge {
                max: MAX_CONFIG_FILE_SIZE,
                actual,
            });
        }
        let raw = fs::read_to_string(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        let config: Self =
            toml::from_str(&raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates documented limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.pool_size == 0 || self.storage.pool_size > MAX_POOL_SIZE {
            return Err(ConfigError::Invalid(format!(
                "storage.pool_size out of range: {} (1..={MAX_POOL_SIZE})",
                self.storage.pool_size
            )));
        }
        if self.storage.readings_to_allocate == 0
            || self.storage.readings_to_allocate > MAX_READINGS_TO_ALLOCATE
        {
            return Err(ConfigError::Invalid(format!(
                "storage.readings_to_allocate out of range: {} (1..={MAX_READINGS_TO_ALLOCATE})",
                self.storage.readings_to_allocate
            )));
        }
        if self.ingest.flush_timeout_ms < MIN_FLUSH_TIMEOUT_MS
            || self.ingest.flush_timeout_ms > MAX_FLUSH_TIMEOUT_MS
        {
            return Err(ConfigError::Invalid(format!(
                "ingest.flush_timeout_ms out of range: {} \
                 ({MIN_FLUSH_TIMEOUT_MS}..={MAX_FLUSH_TIMEOUT_MS})",
                self.ingest.flush_timeout_ms
            )));
        }
        if self.ingest.queue_threshold == 0 || self.ingest.queue_threshold > MAX_QUEUE_THRESHOLD {
            return Err(ConfigError::Invalid(format!(
                "ingest.queue_threshold out of range: {} (1..={MAX_QUEUE_THRESHOLD})",
                self.ingest.queue_threshold
            )));
        }
        if self.ingest.service_name.is_empty() || self.ingest.plugin_name.is_empty() {
            return Err(ConfigError::Invalid(
                "ingest.service_name and ingest.plugin_name must be non-empty".to_string(),
            ));
        }
        if self.purge.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "purge.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.management.base_url.is_empty() {
            return Err(ConfigError::Invalid(
                "management.base_url must be non-empty".to_string(),
            ));
        }
        for filter in &self.filters {
            if filter.name.is_empty() {
                return Err(ConfigError::Invalid(
                    "filters entries must carry a non-empty name".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Resolves the config path from the argument, environment, or default.
fn resolve_config_path(path: Option<&Path>) -> PathBuf {
    if let Some(explicit) = path {
        return explicit.to_path_buf();
    }
    if let Ok(from_env) = env::var(CONFIG_ENV_VAR)
        && !from_env.is_empty()
    {
        return PathBuf::from(from_env);
    }
    PathBuf::from(DEFAULT_CONFIG_NAME)
}
