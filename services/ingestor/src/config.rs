//! Ingestor configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/field-telemetry/ingestor.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `device.application_id`
//! - `device.device_id`
//! - `broker.api_key_file` whenever the broker or the storage poller is enabled
//!
//! # Key file format
//! Raw API key on a single line; trimmed on read. The same key is the MQTT
//! password and the storage endpoint's bearer token.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/field-telemetry/ingestor.toml";

/// Uplinks listing many gateways in `rx_metadata` run well past 10 KiB.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 1024 * 1024;
const MIN_MAX_PACKET_BYTES: usize = 1024;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level ingestor configuration.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub schema_version: u32,
    /// The API key (read from the key file, not the file path).
    pub api_key: Option<String>,
    pub device: DeviceConfig,
    pub broker: BrokerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub application_id: String,
    pub device_id: String,
    pub tenant_id: String,
}

impl DeviceConfig {
    /// Broker user name: `{application_id}@{tenant_id}`.
    pub fn default_username(&self) -> String {
        format!("{}@{}", self.application_id, self.tenant_id)
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub keep_alive: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Largest PUBLISH accepted from the broker, in bytes.
    pub max_packet_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub enabled: bool,
    /// Scheme and authority of the storage query endpoint, no trailing slash.
    pub base_url: String,
    pub fetch_interval: Duration,
    pub window: Duration,
    pub min_poll_interval: Duration,
    pub request_timeout: Duration,
    /// Kick an on-demand poll from the read endpoints when no subscription runs.
    pub lazy_on_read: bool,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: String,
    /// Substitute the ingestion clock for a missing or unparseable event time
    /// on `POST /api/ingest` (the reading is flagged as degraded).
    pub degraded_timestamp_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    device: Option<RawDeviceConfig>,
    broker: Option<RawBrokerConfig>,
    storage: Option<RawStorageConfig>,
    database: Option<RawDatabaseConfig>,
    http: Option<RawHttpConfig>,
    pipeline: Option<RawPipelineConfig>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceConfig {
    application_id: Option<String>,
    device_id: Option<String>,
    tenant_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBrokerConfig {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    api_key_file: Option<String>,
    keep_alive_secs: Option<u64>,
    reconnect_min_secs: Option<u64>,
    reconnect_max_secs: Option<u64>,
    max_packet_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorageConfig {
    enabled: Option<bool>,
    base_url: Option<String>,
    fetch_interval_secs: Option<u64>,
    window_secs: Option<u64>,
    min_poll_interval_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    lazy_on_read: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDatabaseConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHttpConfig {
    bind: Option<String>,
    degraded_timestamp_fallback: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPipelineConfig {
    queue_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load ingestor config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<IngestorConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load ingestor config from a TOML string.
///
/// The key file path from the TOML is used directly.
pub fn load_config_from_str(toml_str: &str) -> Result<IngestorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    // Device
    let raw_device = raw
        .device
        .ok_or_else(|| ConfigError::MissingField("device".to_owned()))?;
    let device = DeviceConfig {
        application_id: required(raw_device.application_id, "device.application_id")?,
        device_id: required(raw_device.device_id, "device.device_id")?,
        tenant_id: raw_device
            .tenant_id
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "ttn".to_owned()),
    };

    // Broker
    let raw_broker = raw.broker.unwrap_or_default();
    let reconnect_min_secs = raw_broker.reconnect_min_secs.unwrap_or(1);
    let reconnect_max_secs = raw_broker.reconnect_max_secs.unwrap_or(30);
    if reconnect_min_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "broker.reconnect_min_secs must be at least 1".to_owned(),
        ));
    }
    if reconnect_max_secs < reconnect_min_secs {
        return Err(ConfigError::InvalidValue(format!(
            "broker.reconnect_max_secs ({reconnect_max_secs}) must be >= broker.reconnect_min_secs ({reconnect_min_secs})"
        )));
    }
    let keep_alive_secs = raw_broker.keep_alive_secs.unwrap_or(60);
    if keep_alive_secs < 5 {
        return Err(ConfigError::InvalidValue(format!(
            "broker.keep_alive_secs must be at least 5, got {keep_alive_secs}"
        )));
    }
    let max_packet_bytes = raw_broker.max_packet_bytes.unwrap_or(DEFAULT_MAX_PACKET_BYTES);
    if max_packet_bytes < MIN_MAX_PACKET_BYTES {
        return Err(ConfigError::InvalidValue(format!(
            "broker.max_packet_bytes must be at least {MIN_MAX_PACKET_BYTES}, got {max_packet_bytes}"
        )));
    }
    let host = raw_broker
        .host
        .unwrap_or_else(|| "eu1.cloud.thethings.network".to_owned());
    let broker = BrokerConfig {
        enabled: raw_broker.enabled.unwrap_or(true),
        username: raw_broker
            .username
            .unwrap_or_else(|| device.default_username()),
        port: raw_broker.port.unwrap_or(1883),
        keep_alive: Duration::from_secs(keep_alive_secs),
        reconnect_min: Duration::from_secs(reconnect_min_secs),
        reconnect_max: Duration::from_secs(reconnect_max_secs),
        max_packet_bytes,
        host,
    };

    // Storage poller
    let raw_storage = raw.storage.unwrap_or_default();
    let fetch_interval_secs = raw_storage.fetch_interval_secs.unwrap_or(600);
    let window_secs = raw_storage.window_secs.unwrap_or(3600);
    for (name, value) in [
        ("storage.fetch_interval_secs", fetch_interval_secs),
        ("storage.window_secs", window_secs),
    ] {
        if value == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{name} must be greater than 0"
            )));
        }
    }
    let request_timeout_secs = raw_storage.request_timeout_secs.unwrap_or(10);
    if request_timeout_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "storage.request_timeout_secs must be greater than 0".to_owned(),
        ));
    }
    if window_secs < fetch_interval_secs {
        warn!(
            window_secs,
            fetch_interval_secs,
            "storage.window_secs is shorter than storage.fetch_interval_secs; readings between polls may be missed"
        );
    }
    let storage = StorageConfig {
        enabled: raw_storage.enabled.unwrap_or(true),
        base_url: raw_storage
            .base_url
            .unwrap_or_else(|| format!("https://{}", broker.host))
            .trim_end_matches('/')
            .to_owned(),
        fetch_interval: Duration::from_secs(fetch_interval_secs),
        window: Duration::from_secs(window_secs),
        min_poll_interval: Duration::from_secs(raw_storage.min_poll_interval_secs.unwrap_or(300)),
        request_timeout: Duration::from_secs(request_timeout_secs),
        lazy_on_read: raw_storage.lazy_on_read.unwrap_or(false),
    };

    let api_key = match raw_broker.api_key_file {
        Some(path) => Some(read_key_file(&path)?),
        None if broker.enabled || storage.enabled => {
            return Err(ConfigError::MissingField("broker.api_key_file".to_owned()));
        }
        None => None,
    };

    let database = DatabaseConfig {
        sqlite_path: raw
            .database
            .and_then(|d| d.sqlite_path)
            .unwrap_or_else(|| "/var/lib/field-telemetry/readings.sqlite3".to_owned()),
    };

    let raw_http = raw.http.unwrap_or_default();
    let http = HttpConfig {
        bind: raw_http.bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
        degraded_timestamp_fallback: raw_http.degraded_timestamp_fallback.unwrap_or(false),
    };

    let queue_capacity = raw
        .pipeline
        .and_then(|p| p.queue_capacity)
        .unwrap_or(1024);
    if queue_capacity == 0 {
        return Err(ConfigError::InvalidValue(
            "pipeline.queue_capacity must be greater than 0".to_owned(),
        ));
    }

    Ok(IngestorConfig {
        schema_version,
        api_key,
        device,
        broker,
        storage,
        database,
        http,
        pipeline: PipelineConfig { queue_capacity },
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn required(value: Option<String>, field: &str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_owned()),
        Some(_) => Err(ConfigError::InvalidValue(format!("{field} must not be empty"))),
        None => Err(ConfigError::MissingField(field.to_owned())),
    }
}

fn read_key_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading key file '{path}': {e}")))?;
    let key = content.trim().to_owned();
    if key.is_empty() {
        return Err(ConfigError::InvalidValue(format!("key file '{path}' is empty")));
    }
    Ok(key)
}
