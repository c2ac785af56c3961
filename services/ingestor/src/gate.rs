//! Ingestion gate: the single path from a normalized reading to the store.
//!
//! Every producer (subscription, backfill poller, HTTP endpoint) submits
//! through [`IngestionGate`]. Deduplication is the store's UNIQUE constraint,
//! applied under the store mutex, so concurrent submissions of the same
//! (device_id, received_at) from different channels yield exactly one row.

use crate::storage::store::{InsertResult, Store, StoreError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uplink_core::{Channel, NormalizeError, NormalizedReading, Normalizer};

/// What happened to one submitted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Inserted { id: i64 },
    /// Already stored; `id` is the existing row.
    Duplicate { id: i64 },
    /// The payload never became a reading.
    Rejected(NormalizeError),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Inserted { .. } => "inserted",
            Outcome::Duplicate { .. } => "duplicate",
            Outcome::Rejected(_) => "rejected",
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Outcome::Inserted { .. })
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ChannelCounters {
    inserted: AtomicU64,
    duplicate: AtomicU64,
    rejected: AtomicU64,
    storage_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub inserted: u64,
    pub duplicate: u64,
    pub rejected: u64,
    pub storage_failed: u64,
}

impl ChannelCounters {
    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            inserted: self.inserted.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            storage_failed: self.storage_failed.load(Ordering::Relaxed),
        }
    }
}

/// Per-channel ingestion counters, plus push-queue drops.
#[derive(Debug, Default)]
pub struct IngestCounters {
    push: ChannelCounters,
    pull: ChannelCounters,
    http: ChannelCounters,
    queue_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub push: ChannelSnapshot,
    pub pull: ChannelSnapshot,
    pub http: ChannelSnapshot,
    pub queue_dropped: u64,
}

impl IngestCounters {
    fn channel(&self, channel: Channel) -> &ChannelCounters {
        match channel {
            Channel::Push => &self.push,
            Channel::Pull => &self.pull,
            Channel::Http => &self.http,
        }
    }

    pub fn record_queue_drop(&self) {
        self.queue_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            push: self.push.snapshot(),
            pull: self.pull.snapshot(),
            http: self.http.snapshot(),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Cheap to clone; all clones share the store and the counters.
#[derive(Clone)]
pub struct IngestionGate {
    store: Arc<Mutex<Store>>,
    normalizer: Normalizer,
    counters: Arc<IngestCounters>,
}

impl IngestionGate {
    /// `normalizer` is used by the payload and byte entry points and should
    /// be strict. Callers that allow the degraded timestamp fallback
    /// normalize themselves and call [`submit`](Self::submit).
    pub fn new(store: Arc<Mutex<Store>>, normalizer: Normalizer) -> Self {
        IngestionGate {
            store,
            normalizer,
            counters: Arc::new(IngestCounters::default()),
        }
    }

    pub fn store(&self) -> &Arc<Mutex<Store>> {
        &self.store
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn counters(&self) -> &Arc<IngestCounters> {
        &self.counters
    }

    /// Persist `reading` unless its (device_id, received_at) is already
    /// stored. Exactly one store write per `Inserted`; none otherwise.
    pub async fn submit(
        &self,
        reading: &NormalizedReading,
        channel: Channel,
    ) -> Result<Outcome, StoreError> {
        let counters = self.counters.channel(channel);
        let result = self.store.lock().await.insert(reading);

        match result {
            Ok(InsertResult::Inserted(id)) => {
                counters.inserted.fetch_add(1, Ordering::Relaxed);
                if reading.timestamp_degraded {
                    warn!(
                        channel = %channel,
                        id,
                        device_id = %reading.device_id,
                        received_at = %reading.received_at,
                        degraded_timestamp = true,
                        "stored reading with substituted ingestion time"
                    );
                } else {
                    debug!(
                        channel = %channel,
                        id,
                        device_id = %reading.device_id,
                        received_at = %reading.received_at,
                        outcome = "inserted",
                        "reading stored"
                    );
                }
                Ok(Outcome::Inserted { id })
            }
            Ok(InsertResult::Duplicate(id)) => {
                counters.duplicate.fetch_add(1, Ordering::Relaxed);
                debug!(
                    channel = %channel,
                    id,
                    device_id = %reading.device_id,
                    received_at = %reading.received_at,
                    outcome = "duplicate",
                    "reading already stored"
                );
                Ok(Outcome::Duplicate { id })
            }
            Err(e) => {
                counters.storage_failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    channel = %channel,
                    device_id = %reading.device_id,
                    received_at = %reading.received_at,
                    error = %e,
                    "storage failure"
                );
                Err(e)
            }
        }
    }

    /// Normalize `payload` with the gate's normalizer, then submit it.
    pub async fn submit_payload(
        &self,
        payload: &Value,
        channel: Channel,
    ) -> Result<Outcome, StoreError> {
        let normalized = self.normalizer.normalize(payload, channel);
        self.submit_normalized(normalized, channel).await
    }

    /// Decode raw message bytes (UTF-8 JSON) and submit them.
    pub async fn submit_bytes(&self, bytes: &[u8], channel: Channel) -> Result<Outcome, StoreError> {
        let normalized = self.normalizer.normalize_bytes(bytes, channel);
        self.submit_normalized(normalized, channel).await
    }

    /// Count and log a payload that failed before reaching the gate proper.
    pub fn record_rejected(&self, channel: Channel, reason: &NormalizeError) {
        self.counters
            .channel(channel)
            .rejected
            .fetch_add(1, Ordering::Relaxed);
        warn!(channel = %channel, reason = %reason, outcome = "rejected", "payload rejected");
    }

    async fn submit_normalized(
        &self,
        normalized: Result<NormalizedReading, NormalizeError>,
        channel: Channel,
    ) -> Result<Outcome, StoreError> {
        match normalized {
            Ok(reading) => self.submit(&reading, channel).await,
            Err(reason) => {
                self.record_rejected(channel, &reason);
                Ok(Outcome::Rejected(reason))
            }
        }
    }
}
