//! Push pipeline: a bounded queue between the broker read loop and the gate.
//!
//! The subscription only enqueues; the worker does normalize + insert. A slow
//! store therefore fills the queue instead of stalling keepalives. When the
//! queue is full the message is dropped and counted; the next backfill poll
//! recovers it.

use crate::gate::{IngestionGate, Outcome};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uplink_core::Channel;

/// One PUBLISH received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub fn channel(capacity: usize) -> (mpsc::Sender<InboundMessage>, mpsc::Receiver<InboundMessage>) {
    mpsc::channel(capacity.max(1))
}

/// Drain `rx` through the gate until every sender is gone.
///
/// Rejections and storage failures are logged and counted by the gate; the
/// message is dropped either way, there is no redelivery.
pub async fn run_worker(mut rx: mpsc::Receiver<InboundMessage>, gate: IngestionGate) {
    let mut processed: u64 = 0;
    while let Some(msg) = rx.recv().await {
        processed += 1;
        if let Ok(Outcome::Rejected(reason)) = gate.submit_bytes(&msg.payload, Channel::Push).await
        {
            debug!(topic = %msg.topic, reason = %reason, "push message discarded");
        }
    }
    info!(processed, "pipeline worker drained");
}
