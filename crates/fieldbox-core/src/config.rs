//! Configuration management for fieldbox.
//!
//! Handles loading and validation of fieldbox.toml configuration files,
//! and exposes the [`ConfigProvider`] seam the coordinator consumes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::{CIRCUIT_RESET, CIRCUIT_THRESHOLD, CircuitBreakerConfig};
use crate::logging::LogConfig;
use crate::store::{
    Limits, MAX_PAYLOAD_BYTES, MAX_QUEUE_BYTES, MAX_UPLOAD_ATTEMPTS, STORAGE_CRITICAL_BYTES,
    STORAGE_WARNING_BYTES,
};

/// Configuration load/parse failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Device identity and credentials.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Upload cadence and endpoint.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Queue storage budgets.
    #[serde(default)]
    pub storage: StorageConfig,

    /// The closed set of sensor streams.
    #[serde(default)]
    pub streams: StreamsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LogConfig,
}

/// Device identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceConfig {
    /// Stable device identifier sent in wire payloads.
    #[serde(default)]
    pub device_id: String,

    /// Bearer token for the ingestion endpoint.
    #[serde(default)]
    pub device_token: String,
}

/// Upload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Ingestion endpoint URL. Uploads are disabled while unset.
    #[serde(default)]
    pub ingest_url: Option<String>,

    /// Seconds between periodic upload cycles.
    #[serde(default = "default_upload_interval")]
    pub interval_secs: u64,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds after which an in-flight upload is considered stale.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,

    /// Attempts before a record is excluded from dequeue.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,

    /// Cool-down seconds before an open circuit closes.
    #[serde(default = "default_circuit_reset")]
    pub circuit_reset_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            ingest_url: None,
            interval_secs: default_upload_interval(),
            request_timeout_secs: default_request_timeout(),
            stale_timeout_secs: default_stale_timeout(),
            max_attempts: default_max_attempts(),
            circuit_threshold: default_circuit_threshold(),
            circuit_reset_secs: default_circuit_reset(),
        }
    }
}

fn default_upload_interval() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30
}

fn default_stale_timeout() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    MAX_UPLOAD_ATTEMPTS
}

fn default_circuit_threshold() -> u32 {
    CIRCUIT_THRESHOLD
}

fn default_circuit_reset() -> u64 {
    CIRCUIT_RESET.as_secs()
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Queue database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Per-record payload cap in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,

    /// Byte budget for the whole queue.
    #[serde(default = "default_max_queue_bytes")]
    pub max_queue_bytes: u64,

    /// Free-space level that triggers aggressive cleanup.
    #[serde(default = "default_storage_warning_bytes")]
    pub storage_warning_bytes: u64,

    /// Free-space level below which enqueue is refused.
    #[serde(default = "default_storage_critical_bytes")]
    pub storage_critical_bytes: u64,

    /// Days terminal rows are retained before aged cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_payload_bytes: default_max_payload_bytes(),
            max_queue_bytes: default_max_queue_bytes(),
            storage_warning_bytes: default_storage_warning_bytes(),
            storage_critical_bytes: default_storage_critical_bytes(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("fieldbox.db")
}

fn default_max_payload_bytes() -> u64 {
    MAX_PAYLOAD_BYTES
}

fn default_max_queue_bytes() -> u64 {
    MAX_QUEUE_BYTES
}

fn default_storage_warning_bytes() -> u64 {
    STORAGE_WARNING_BYTES
}

fn default_storage_critical_bytes() -> u64 {
    STORAGE_CRITICAL_BYTES
}

fn default_retention_days() -> u32 {
    3
}

/// Stream set configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    /// Streams the store accepts. A closed set; enqueues for anything
    /// else are rejected.
    #[serde(default = "default_streams")]
    pub enabled: Vec<String>,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            enabled: default_streams(),
        }
    }
}

fn default_streams() -> Vec<String> {
    vec![
        "health".to_string(),
        "location".to_string(),
        "audio".to_string(),
    ]
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Store limits derived from this configuration.
    #[must_use]
    pub fn limits(&self) -> Limits {
        Limits {
            max_payload_bytes: self.storage.max_payload_bytes,
            max_queue_bytes: self.storage.max_queue_bytes,
            storage_warning_bytes: self.storage.storage_warning_bytes,
            storage_critical_bytes: self.storage.storage_critical_bytes,
            max_attempts: self.upload.max_attempts,
            stale_timeout: Duration::from_secs(self.upload.stale_timeout_secs),
            retention: Duration::from_secs(u64::from(self.storage.retention_days) * 24 * 3600),
        }
    }

    /// Circuit-breaker settings derived from this configuration.
    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.upload.circuit_threshold,
            reset_timeout: Duration::from_secs(self.upload.circuit_reset_secs),
        }
    }

    /// Interval between periodic upload cycles.
    #[must_use]
    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload.interval_secs)
    }
}

/// Configuration view the coordinator consumes. The dependency-injection
/// seam: anything (file-backed config, a provisioning service, a test
/// fake) can stand behind it.
pub trait ConfigProvider: Send + Sync {
    /// Whether endpoint and credentials are all present.
    fn is_configured(&self) -> bool;

    /// Ingestion endpoint, if configured.
    fn ingest_url(&self) -> Option<String>;

    /// Bearer token for uploads.
    fn device_token(&self) -> String;

    /// Stable device identifier.
    fn device_id(&self) -> String;

    /// Whether a stream participates in capture and upload.
    fn is_stream_enabled(&self, stream: &str) -> bool;
}

impl ConfigProvider for Config {
    fn is_configured(&self) -> bool {
        self.upload.ingest_url.is_some()
            && !self.device.device_token.is_empty()
            && !self.device.device_id.is_empty()
    }

    fn ingest_url(&self) -> Option<String> {
        self.upload.ingest_url.clone()
    }

    fn device_token(&self) -> String {
        self.device.device_token.clone()
    }

    fn device_id(&self) -> String {
        self.device.device_id.clone()
    }

    fn is_stream_enabled(&self, stream: &str) -> bool {
        self.streams.enabled.iter().any(|s| s == stream)
    }
}
