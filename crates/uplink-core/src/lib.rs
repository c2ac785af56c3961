// uplink-core: Canonical telemetry types and payload normalization.
//
// Shared by the ingestor's push, pull and HTTP paths so that every channel
// agrees on what a valid reading is.

pub mod body;
pub mod normalize;
pub mod reading;

pub use body::{BodyError, split_records};
pub use normalize::{NormalizeError, Normalizer, TimestampPolicy, parse_timestamp};
pub use reading::{
    CanonicalReading, Channel, Measurements, NormalizedReading, UNKNOWN_DEVICE,
    canonical_timestamp,
};
