//! Payload normalization.
//!
//! Maps any of the known upstream payload shapes onto a [`NormalizedReading`]:
//!
//! - **push**: a broker uplink event. Device id under
//!   `end_device_ids.device_id`, measurements under
//!   `uplink_message.decoded_payload`.
//! - **pull**: a storage-endpoint record, i.e. the push shape wrapped in a
//!   `{"result": {...}}` envelope (the envelope is optional).
//! - **flattened**: top-level `device_id` / `received_at` with measurements
//!   at the top level or under `fields`. Accepted on the HTTP channel.
//!
//! # Measurement slots
//!
//! | slot     | named alias       | field            |
//! |----------|-------------------|------------------|
//! | `field1` | `battery_voltage` | battery voltage  |
//! | `field3` | `humidity`        | relative humidity|
//! | `field4` | `motion_counts`   | motion counter   |
//! | `field5` | `temperature_c`   | temperature (°C) |
//!
//! The numbered slot wins when both are present. Unknown keys are ignored.
//! A measurement that is missing or not numeric is simply absent.

use crate::reading::{Channel, Measurements, NormalizedReading, UNKNOWN_DEVICE};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors and policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload is empty")]
    Empty,
    #[error("missing event timestamp")]
    MissingTimestamp,
    #[error("unparseable event timestamp: {0}")]
    InvalidTimestamp(String),
}

/// What to do when the event timestamp is missing or unparseable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampPolicy {
    /// Reject the payload.
    #[default]
    Strict,
    /// Use the ingestion clock and flag the reading as degraded.
    SubstituteIngestTime,
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

const BATTERY_SLOT: (&str, &str) = ("field1", "battery_voltage");
const HUMIDITY_SLOT: (&str, &str) = ("field3", "humidity");
const MOTION_SLOT: (&str, &str) = ("field4", "motion_counts");
const TEMPERATURE_SLOT: (&str, &str) = ("field5", "temperature_c");

/// Stateless payload normalizer.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    fallback_device_id: Option<String>,
    timestamp_policy: TimestampPolicy,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device id to use when the payload carries none.
    pub fn with_fallback_device(mut self, device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        self.fallback_device_id = (!device_id.trim().is_empty()).then_some(device_id);
        self
    }

    pub fn with_timestamp_policy(mut self, policy: TimestampPolicy) -> Self {
        self.timestamp_policy = policy;
        self
    }

    pub fn timestamp_policy(&self) -> TimestampPolicy {
        self.timestamp_policy
    }

    /// Decode raw message bytes (UTF-8 JSON) and normalize them.
    pub fn normalize_bytes(
        &self,
        bytes: &[u8],
        channel: Channel,
    ) -> Result<NormalizedReading, NormalizeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| NormalizeError::InvalidUtf8)?;
        let payload: Value =
            serde_json::from_str(text).map_err(|e| NormalizeError::InvalidJson(e.to_string()))?;
        self.normalize(&payload, channel)
    }

    pub fn normalize(
        &self,
        payload: &Value,
        channel: Channel,
    ) -> Result<NormalizedReading, NormalizeError> {
        self.normalize_at(payload, channel, Utc::now())
    }

    /// Normalize with an explicit ingestion clock (used for the degraded
    /// timestamp substitution).
    pub fn normalize_at(
        &self,
        payload: &Value,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<NormalizedReading, NormalizeError> {
        let outer = payload.as_object().ok_or(NormalizeError::NotAnObject)?;
        if outer.is_empty() {
            return Err(NormalizeError::Empty);
        }

        let record = match channel {
            Channel::Push => outer,
            Channel::Pull | Channel::Http => unwrap_result_envelope(outer)?,
        };

        let (received_at, timestamp_degraded) = match event_time(record) {
            Ok(ts) => (ts, false),
            Err(e) => match self.timestamp_policy {
                TimestampPolicy::Strict => return Err(e),
                TimestampPolicy::SubstituteIngestTime => (now, true),
            },
        };

        let source = measurement_source(record);
        let measurements = Measurements {
            temperature_c: slot(source, TEMPERATURE_SLOT).and_then(as_float),
            humidity: slot(source, HUMIDITY_SLOT).and_then(as_float),
            battery_voltage: slot(source, BATTERY_SLOT).and_then(as_float),
            motion_counts: slot(source, MOTION_SLOT).and_then(as_count),
        };

        Ok(NormalizedReading {
            device_id: self.device_id(record),
            received_at,
            measurements,
            timestamp_degraded,
        })
    }

    fn device_id(&self, record: &Map<String, Value>) -> String {
        record
            .get("end_device_ids")
            .and_then(|ids| ids.get("device_id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .or_else(|| {
                record
                    .get("device_id")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
            })
            .or(self.fallback_device_id.as_deref())
            .unwrap_or(UNKNOWN_DEVICE)
            .to_owned()
    }
}

// ---------------------------------------------------------------------------
// Timestamp parsing
// ---------------------------------------------------------------------------

/// Parse an upstream event time into UTC.
///
/// Accepts RFC 3339 (fractional seconds and any offset) and the
/// space-separated `YYYY-MM-DD HH:MM:SS[.f]±HH:MM` form. Timestamps without
/// a zone are rejected.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn event_time(record: &Map<String, Value>) -> Result<DateTime<Utc>, NormalizeError> {
    let raw = non_null(record.get("received_at"))
        .or_else(|| {
            record
                .get("uplink_message")
                .and_then(|u| rx_metadata_time(u.get("rx_metadata")))
        })
        .or_else(|| rx_metadata_time(record.get("rx_metadata")))
        .ok_or(NormalizeError::MissingTimestamp)?;

    match raw {
        Value::String(s) => {
            parse_timestamp(s).ok_or_else(|| NormalizeError::InvalidTimestamp(s.clone()))
        }
        other => Err(NormalizeError::InvalidTimestamp(other.to_string())),
    }
}

fn rx_metadata_time(metadata: Option<&Value>) -> Option<&Value> {
    metadata?
        .as_array()?
        .iter()
        .find_map(|entry| non_null(entry.get("time")))
}

// ---------------------------------------------------------------------------
// Shape helpers
// ---------------------------------------------------------------------------

fn unwrap_result_envelope(
    outer: &Map<String, Value>,
) -> Result<&Map<String, Value>, NormalizeError> {
    match outer.get("result") {
        Some(Value::Object(inner)) if inner.is_empty() => Err(NormalizeError::Empty),
        Some(Value::Object(inner)) => Ok(inner),
        _ => Ok(outer),
    }
}

fn measurement_source(record: &Map<String, Value>) -> &Map<String, Value> {
    let decoded = record
        .get("uplink_message")
        .and_then(|u| u.get("decoded_payload"))
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty());
    let fields = || {
        record
            .get("fields")
            .and_then(Value::as_object)
            .filter(|m| !m.is_empty())
    };
    decoded.or_else(fields).unwrap_or(record)
}

fn slot<'a>(source: &'a Map<String, Value>, (numbered, named): (&str, &str)) -> Option<&'a Value> {
    non_null(source.get(numbered)).or_else(|| non_null(source.get(named)))
}

fn non_null(v: Option<&Value>) -> Option<&Value> {
    v.filter(|v| !v.is_null())
}

fn as_float(v: &Value) -> Option<f64> {
    let f = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}

fn as_count(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

fn integral(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    (f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64)
        .then_some(f as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn numbered_slot_wins_over_named() {
        let p = json!({"device_id": "d", "received_at": "2024-01-01T10:00:00Z",
                       "field5": 21.0, "temperature_c": 99.0});
        let r = Normalizer::new().normalize(&p, Channel::Http).unwrap();
        assert_eq!(r.measurements.temperature_c, Some(21.0));
    }

    #[test]
    fn zero_is_a_value() {
        let p = json!({"device_id": "d", "received_at": "2024-01-01T10:00:00Z",
                       "field4": 0, "motion_counts": 7});
        let r = Normalizer::new().normalize(&p, Channel::Http).unwrap();
        assert_eq!(r.measurements.motion_counts, Some(0));
    }

    #[test]
    fn numeric_strings_and_garbage() {
        let p = json!({"device_id": "d", "received_at": "2024-01-01T10:00:00Z",
                       "field1": "3.07", "field3": "wet", "field4": "12", "field5": true});
        let m = Normalizer::new()
            .normalize(&p, Channel::Http)
            .unwrap()
            .measurements;
        assert_eq!(m.battery_voltage, Some(3.07));
        assert_eq!(m.humidity, None);
        assert_eq!(m.motion_counts, Some(12));
        assert_eq!(m.temperature_c, None);
    }

    #[test]
    fn motion_count_rejects_fractions() {
        assert_eq!(as_count(&json!(4.0)), Some(4));
        assert_eq!(as_count(&json!(4.5)), None);
        assert_eq!(as_count(&json!("7.0")), Some(7));
        assert_eq!(as_count(&json!(1e300)), None);
    }

    #[test]
    fn parse_timestamp_variants() {
        assert_eq!(parse_timestamp("2024-01-01T10:00:00Z"), Some(ts(10, 0, 0)));
        assert_eq!(
            parse_timestamp("2024-01-01T12:00:00+02:00"),
            Some(ts(10, 0, 0))
        );
        assert_eq!(
            parse_timestamp("2024-01-01 10:00:00.5+00:00"),
            Some(ts(10, 0, 0) + chrono::Duration::milliseconds(500))
        );
        assert_eq!(parse_timestamp("2024-01-01T10:00:00"), None);
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn rx_metadata_time_is_used_when_received_at_missing() {
        let p = json!({
            "end_device_ids": {"device_id": "dev-1"},
            "uplink_message": {
                "rx_metadata": [{"gateway_ids": {}}, {"time": "2024-01-01T10:00:00Z"}],
                "decoded_payload": {"field5": 20.0}
            }
        });
        let r = Normalizer::new().normalize(&p, Channel::Push).unwrap();
        assert_eq!(r.received_at, ts(10, 0, 0));
        assert!(!r.timestamp_degraded);
    }

    #[test]
    fn substitute_policy_flags_degraded() {
        let now = ts(11, 30, 0);
        let p = json!({"device_id": "d", "field5": 20.0});
        let n = Normalizer::new().with_timestamp_policy(TimestampPolicy::SubstituteIngestTime);
        let r = n.normalize_at(&p, Channel::Http, now).unwrap();
        assert_eq!(r.received_at, now);
        assert!(r.timestamp_degraded);

        let strict = Normalizer::new().normalize_at(&p, Channel::Http, now);
        assert_eq!(strict, Err(NormalizeError::MissingTimestamp));
    }

    #[test]
    fn non_string_timestamp_is_invalid() {
        let p = json!({"device_id": "d", "received_at": 1704103200});
        assert!(matches!(
            Normalizer::new().normalize(&p, Channel::Http),
            Err(NormalizeError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn blank_fallback_device_is_ignored() {
        let p = json!({"received_at": "2024-01-01T10:00:00Z"});
        let r = Normalizer::new()
            .with_fallback_device("  ")
            .normalize(&p, Channel::Http)
            .unwrap();
        assert_eq!(r.device_id, UNKNOWN_DEVICE);
    }
}
