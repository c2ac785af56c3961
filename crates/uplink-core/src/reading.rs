//! Canonical reading types.
//!
//! A [`NormalizedReading`] is what the normalizer produces from any upstream
//! payload; a [`CanonicalReading`] is the same reading after the store has
//! assigned it a row id and an ingestion time.
//!
//! # Event time
//!
//! `received_at` is the upstream's measurement time and is the dedup key
//! together with `device_id`. It is always held in UTC and written to storage
//! through [`canonical_timestamp`], which is fixed-width so that two spellings
//! of one instant compare equal and text order matches time order.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Device id used when neither the payload nor the caller supplies one.
pub const UNKNOWN_DEVICE: &str = "unknown-device";

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Which path delivered a payload.
///
/// Only the normalizer and the counters look at this; the stored reading
/// carries no trace of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Live broker subscription.
    Push,
    /// Storage query endpoint (backfill).
    Pull,
    /// Direct POST to the ingestion endpoint.
    Http,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Pull => "pull",
            Channel::Http => "http",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// The four sensor measurements. Each one is independently optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub temperature_c: Option<f64>,
    pub humidity: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub motion_counts: Option<i64>,
}

impl Measurements {
    /// True when no measurement is present.
    pub fn is_empty(&self) -> bool {
        self.temperature_c.is_none()
            && self.humidity.is_none()
            && self.battery_voltage.is_none()
            && self.motion_counts.is_none()
    }
}

// ---------------------------------------------------------------------------
// NormalizedReading
// ---------------------------------------------------------------------------

/// A reading that passed normalization and is ready for the ingestion gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedReading {
    pub device_id: String,
    pub received_at: DateTime<Utc>,
    pub measurements: Measurements,
    /// Set when `received_at` is the ingestion clock rather than the
    /// upstream's event time.
    pub timestamp_degraded: bool,
}

impl NormalizedReading {
    pub fn new(
        device_id: impl Into<String>,
        received_at: DateTime<Utc>,
        measurements: Measurements,
    ) -> Self {
        NormalizedReading {
            device_id: device_id.into(),
            received_at,
            measurements,
            timestamp_degraded: false,
        }
    }

    /// The `received_at` half of the dedup key, in storage form.
    pub fn received_at_key(&self) -> String {
        canonical_timestamp(&self.received_at)
    }
}

// ---------------------------------------------------------------------------
// CanonicalReading
// ---------------------------------------------------------------------------

/// A persisted reading, as returned by the store's read interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalReading {
    pub id: i64,
    pub device_id: String,
    pub received_at: DateTime<Utc>,
    pub temperature_c: Option<f64>,
    pub humidity: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub motion_counts: Option<i64>,
    pub timestamp_degraded: bool,
    pub ingested_at: DateTime<Utc>,
}

impl CanonicalReading {
    pub fn measurements(&self) -> Measurements {
        Measurements {
            temperature_c: self.temperature_c,
            humidity: self.humidity,
            battery_voltage: self.battery_voltage,
            motion_counts: self.motion_counts,
        }
    }
}

/// Fixed-width UTC form used as the stored `received_at` / `ingested_at`.
///
/// Always nanosecond precision with a `Z` suffix, e.g.
/// `2024-01-01T10:00:00.000000000Z`.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
