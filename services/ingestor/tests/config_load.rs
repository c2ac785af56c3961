/// Integration tests for ingestor config loading.
///
/// Tests default values, required field validation, and key file reading.
use ingestor::config::{ConfigError, load_config_from_path, load_config_from_str};
use std::io::Write;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

fn write_key_file(key: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("create temp file");
    write!(f, "{}", key).expect("write key");
    f
}

fn minimal(key_file: &tempfile::NamedTempFile) -> String {
    format!(
        r#"
schema_version = 1

[device]
application_id = "farm-sensors"
device_id = "lht65n-01"

[broker]
api_key_file = "{}"
"#,
        key_file.path().display()
    )
}

// ---------------------------------------------------------------------------
// Required fields
// ---------------------------------------------------------------------------

#[test]
fn valid_minimal_config_loads_with_defaults() {
    let key_file = write_key_file("NNSXS.SECRET\n");
    let cfg = load_config_from_str(&minimal(&key_file)).expect("should load");

    assert_eq!(cfg.schema_version, 1);
    assert_eq!(cfg.api_key.as_deref(), Some("NNSXS.SECRET"));
    assert_eq!(cfg.device.tenant_id, "ttn");

    assert!(cfg.broker.enabled);
    assert_eq!(cfg.broker.host, "eu1.cloud.thethings.network");
    assert_eq!(cfg.broker.port, 1883);
    assert_eq!(cfg.broker.username, "farm-sensors@ttn");
    assert_eq!(cfg.broker.keep_alive, Duration::from_secs(60));
    assert_eq!(cfg.broker.reconnect_min, Duration::from_secs(1));
    assert_eq!(cfg.broker.reconnect_max, Duration::from_secs(30));
    assert_eq!(cfg.broker.max_packet_bytes, 1024 * 1024);

    assert!(cfg.storage.enabled);
    assert_eq!(cfg.storage.base_url, "https://eu1.cloud.thethings.network");
    assert_eq!(cfg.storage.fetch_interval, Duration::from_secs(600));
    assert_eq!(cfg.storage.window, Duration::from_secs(3600));
    assert_eq!(cfg.storage.min_poll_interval, Duration::from_secs(300));
    assert_eq!(cfg.storage.request_timeout, Duration::from_secs(10));
    assert!(!cfg.storage.lazy_on_read);

    assert_eq!(cfg.database.sqlite_path, "/var/lib/field-telemetry/readings.sqlite3");
    assert_eq!(cfg.http.bind, "0.0.0.0:8080");
    assert!(!cfg.http.degraded_timestamp_fallback);
    assert_eq!(cfg.pipeline.queue_capacity, 1024);
}

#[test]
fn full_config_overrides_defaults() {
    let key_file = write_key_file("k");
    let toml = format!(
        r#"
schema_version = 1

[device]
application_id = "app"
device_id = "dev"
tenant_id = "acme"

[broker]
host = "nam1.cloud.thethings.network"
port = 8883
username = "custom-user"
api_key_file = "{}"
keep_alive_secs = 30
reconnect_min_secs = 2
reconnect_max_secs = 120

[storage]
base_url = "http://127.0.0.1:9999/"
fetch_interval_secs = 300
window_secs = 7200
min_poll_interval_secs = 60
request_timeout_secs = 5
lazy_on_read = true

[database]
sqlite_path = "/tmp/readings.sqlite3"

[http]
bind = "127.0.0.1:9000"
degraded_timestamp_fallback = true

[pipeline]
queue_capacity = 16
"#,
        key_file.path().display()
    );
    let cfg = load_config_from_str(&toml).expect("should load");
    assert_eq!(cfg.device.tenant_id, "acme");
    assert_eq!(cfg.broker.port, 8883);
    assert_eq!(cfg.broker.username, "custom-user");
    assert_eq!(cfg.broker.reconnect_max, Duration::from_secs(120));
    assert_eq!(cfg.storage.base_url, "http://127.0.0.1:9999");
    assert_eq!(cfg.storage.window, Duration::from_secs(7200));
    assert!(cfg.storage.lazy_on_read);
    assert!(cfg.http.degraded_timestamp_fallback);
    assert_eq!(cfg.pipeline.queue_capacity, 16);
}

#[test]
fn username_follows_tenant() {
    let key_file = write_key_file("k");
    let toml = minimal(&key_file).replace(
        "device_id = \"lht65n-01\"",
        "device_id = \"lht65n-01\"\ntenant_id = \"acme\"",
    );
    let cfg = load_config_from_str(&toml).expect("should load");
    assert_eq!(cfg.broker.username, "farm-sensors@acme");
}

#[test]
fn missing_schema_version_fails() {
    let key_file = write_key_file("k");
    let toml = minimal(&key_file).replace("schema_version = 1", "");
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::MissingField(f)) if f == "schema_version"
    ));
}

#[test]
fn wrong_schema_version_fails() {
    let key_file = write_key_file("k");
    let toml = minimal(&key_file).replace("schema_version = 1", "schema_version = 2");
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::InvalidValue(_))
    ));
}

#[test]
fn missing_device_id_fails() {
    let key_file = write_key_file("k");
    let toml = minimal(&key_file).replace("device_id = \"lht65n-01\"", "");
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::MissingField(f)) if f == "device.device_id"
    ));
}

#[test]
fn missing_key_file_setting_fails_when_channels_enabled() {
    let toml = r#"
schema_version = 1

[device]
application_id = "app"
device_id = "dev"
"#;
    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::MissingField(f)) if f == "broker.api_key_file"
    ));
}

#[test]
fn http_only_config_needs_no_key() {
    let toml = r#"
schema_version = 1

[device]
application_id = "app"
device_id = "dev"

[broker]
enabled = false

[storage]
enabled = false
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert!(cfg.api_key.is_none());
}

#[test]
fn unreadable_key_file_is_io_error() {
    let toml = r#"
schema_version = 1

[device]
application_id = "app"
device_id = "dev"

[broker]
api_key_file = "/nonexistent/field-telemetry/key"
"#;
    assert!(matches!(load_config_from_str(toml), Err(ConfigError::Io(_))));
}

#[test]
fn empty_key_file_is_rejected() {
    let key_file = write_key_file("  \n");
    assert!(matches!(
        load_config_from_str(&minimal(&key_file)),
        Err(ConfigError::InvalidValue(_))
    ));
}

// ---------------------------------------------------------------------------
// Value validation
// ---------------------------------------------------------------------------

#[test]
fn inverted_reconnect_bounds_fail() {
    let key_file = write_key_file("k");
    let toml = format!(
        "{}reconnect_min_secs = 10\nreconnect_max_secs = 5\n",
        minimal(&key_file)
    );
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::InvalidValue(_))
    ));
}

#[test]
fn short_keep_alive_fails() {
    let key_file = write_key_file("k");
    let toml = format!("{}keep_alive_secs = 2\n", minimal(&key_file));
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::InvalidValue(_))
    ));
}

#[test]
fn zero_queue_capacity_fails() {
    let key_file = write_key_file("k");
    let toml = format!("{}\n[pipeline]\nqueue_capacity = 0\n", minimal(&key_file));
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::InvalidValue(_))
    ));
}

#[test]
fn max_packet_bytes_override() {
    let key_file = write_key_file("k");
    let toml = format!("{}max_packet_bytes = 65536\n", minimal(&key_file));
    let cfg = load_config_from_str(&toml).expect("should load");
    assert_eq!(cfg.broker.max_packet_bytes, 65536);
}

#[test]
fn tiny_max_packet_bytes_fails() {
    let key_file = write_key_file("k");
    let toml = format!("{}max_packet_bytes = 512\n", minimal(&key_file));
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::InvalidValue(msg)) if msg.contains("broker.max_packet_bytes")
    ));
}

#[test]
fn zero_request_timeout_fails() {
    let key_file = write_key_file("k");
    let toml = format!(
        "{}\n[storage]\nrequest_timeout_secs = 0\n",
        minimal(&key_file)
    );
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::InvalidValue(msg)) if msg.contains("storage.request_timeout_secs")
    ));
}

#[test]
fn window_shorter_than_interval_still_loads() {
    // Logged as a warning, not rejected.
    let key_file = write_key_file("k");
    let toml = format!(
        "{}\n[storage]\nfetch_interval_secs = 600\nwindow_secs = 300\n",
        minimal(&key_file)
    );
    let cfg = load_config_from_str(&toml).expect("should load");
    assert_eq!(cfg.storage.window, Duration::from_secs(300));
    assert_eq!(cfg.storage.fetch_interval, Duration::from_secs(600));
}

#[test]
fn malformed_toml_is_parse_error() {
    assert!(matches!(
        load_config_from_str("schema_version = = 1"),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn load_from_path_reads_file() {
    let key_file = write_key_file("k");
    let mut cfg_file = tempfile::NamedTempFile::new().expect("create temp file");
    write!(cfg_file, "{}", minimal(&key_file)).expect("write config");
    let cfg = load_config_from_path(cfg_file.path()).expect("should load");
    assert_eq!(cfg.device.application_id, "farm-sensors");

    assert!(matches!(
        load_config_from_path(std::path::Path::new("/nonexistent/ingestor.toml")),
        Err(ConfigError::Io(_))
    ));
}
