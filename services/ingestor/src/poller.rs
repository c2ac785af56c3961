//! Backfill poller: pulls a trailing window from the storage query endpoint.
//!
//! The window is wider than the fetch interval on purpose; the overlap is
//! absorbed by the ingestion gate's dedup. A failed request is worth zero
//! insertions and never stops the schedule.
//!
//! # Rate limiting
//! [`BackfillPoller::poll_if_due`] shares one "last poll" instant between all
//! callers. The instant lives behind a mutex that stays locked for the whole
//! poll, so a concurrent caller sees the lock held and skips instead of
//! starting a second request. The instant is recorded whether or not the
//! poll succeeds; a failure is retried on the next interval.
//!
//! Scheduled polls go through [`BackfillPoller::poll`], which takes the same
//! lock. It waits rather than skips, so at most one request is in flight.

use crate::gate::{IngestionGate, Outcome};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uplink_core::{Channel, NormalizeError, split_records};

const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("invalid storage endpoint URL: {0}")]
    InvalidUrl(String),
    #[error("storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("storage endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Where and how to reach the storage query endpoint.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Scheme and authority, e.g. `https://eu1.cloud.thethings.network`.
    pub base_url: String,
    pub application_id: String,
    pub device_id: String,
    pub api_key: String,
    pub request_timeout: Duration,
    /// Minimum spacing between on-demand polls.
    pub min_poll_interval: Duration,
}

/// Per-record tally of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Records in the response body, decodable or not.
    pub records: usize,
    pub inserted: usize,
    pub duplicate: usize,
    pub rejected: usize,
    pub storage_failed: usize,
}

/// Most recent poll result, for the metrics endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollStatus {
    pub at: DateTime<Utc>,
    pub ok: bool,
    pub inserted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct BackfillPoller {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    gate: IngestionGate,
    min_poll_interval: Duration,
    last_poll: Mutex<Option<Instant>>,
    last_status: Mutex<Option<PollStatus>>,
}

impl BackfillPoller {
    pub fn new(config: PollerConfig, gate: IngestionGate) -> Result<Self, PollError> {
        let endpoint = storage_endpoint(
            &config.base_url,
            &config.application_id,
            &config.device_id,
        )?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(BackfillPoller {
            client,
            endpoint,
            api_key: config.api_key,
            gate,
            min_poll_interval: config.min_poll_interval,
            last_poll: Mutex::new(None),
            last_status: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Pull the trailing `window` and return the number of newly inserted
    /// readings. Failures are logged and count as zero.
    ///
    /// Waits out any poll in flight instead of skipping, and records the
    /// start instant so on-demand callers back off afterwards.
    pub async fn poll(&self, window: Duration) -> usize {
        let mut last = self.last_poll.lock().await;
        *last = Some(Instant::now());
        let inserted = self
            .poll_report(window)
            .await
            .map(|report| report.inserted)
            .unwrap_or(0);
        drop(last);
        inserted
    }

    /// [`fetch`](Self::fetch) plus logging and the status kept for metrics.
    pub async fn poll_report(&self, window: Duration) -> Result<PollReport, PollError> {
        let result = self.fetch(window).await;
        let status = match &result {
            Ok(report) => {
                info!(
                    window = %format_window(window),
                    records = report.records,
                    inserted = report.inserted,
                    duplicate = report.duplicate,
                    rejected = report.rejected,
                    storage_failed = report.storage_failed,
                    "backfill poll complete"
                );
                PollStatus {
                    at: Utc::now(),
                    ok: true,
                    inserted: report.inserted,
                    error: None,
                }
            }
            Err(e) => {
                warn!(window = %format_window(window), error = %e, "backfill poll failed");
                PollStatus {
                    at: Utc::now(),
                    ok: false,
                    inserted: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        *self.last_status.lock().await = Some(status);
        result
    }

    /// Rate-limited [`poll_report`](Self::poll_report): returns `None`
    /// without polling when another poll is in flight or the last one
    /// started less than the minimum interval ago.
    pub async fn poll_if_due(&self, window: Duration) -> Option<Result<PollReport, PollError>> {
        let Ok(mut last) = self.last_poll.try_lock() else {
            debug!("on-demand poll skipped: poll in flight");
            return None;
        };
        if let Some(at) = *last {
            if at.elapsed() < self.min_poll_interval {
                debug!("on-demand poll skipped: minimum interval not elapsed");
                return None;
            }
        }
        *last = Some(Instant::now());
        Some(self.poll_report(window).await)
    }

    /// Fire-and-forget [`poll_if_due`](Self::poll_if_due) for read paths that
    /// must not wait on the upstream.
    pub fn poll_in_background(self: &Arc<Self>, window: Duration) {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            poller.poll_if_due(window).await;
        });
    }

    pub async fn last_status(&self) -> Option<PollStatus> {
        self.last_status.lock().await.clone()
    }

    /// Poll every `interval` until shutdown. The first poll happens one
    /// interval after start; the startup backfill is the caller's job.
    pub async fn run_schedule(
        self: Arc<Self>,
        interval: Duration,
        window: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = interval.as_secs(),
            window = %format_window(window),
            "backfill schedule started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll(window).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("backfill schedule stopping (shutdown)");
    }

    /// One request plus ingestion of every record in the response.
    pub async fn fetch(&self, window: Duration) -> Result<PollReport, PollError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("last", &format_window(window));

        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PollError::Status {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }
        let body = resp.text().await?;

        let mut report = PollReport::default();
        for record in split_records(&body) {
            report.records += 1;
            let payload = match record {
                Ok(payload) => payload,
                Err(e) => {
                    report.rejected += 1;
                    self.gate
                        .record_rejected(Channel::Pull, &NormalizeError::InvalidJson(e.to_string()));
                    continue;
                }
            };
            match self.gate.submit_payload(&payload, Channel::Pull).await {
                Ok(Outcome::Inserted { .. }) => report.inserted += 1,
                Ok(Outcome::Duplicate { .. }) => report.duplicate += 1,
                Ok(Outcome::Rejected(_)) => report.rejected += 1,
                // Logged by the gate; the rest of the batch continues.
                Err(_) => report.storage_failed += 1,
            }
        }
        Ok(report)
    }
}

/// `{base}/api/v3/as/applications/{app}/devices/{device}/packages/storage/uplink_message`
pub fn storage_endpoint(base_url: &str, application_id: &str, device_id: &str) -> Result<Url, PollError> {
    let mut url =
        Url::parse(base_url).map_err(|e| PollError::InvalidUrl(format!("{base_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| PollError::InvalidUrl(format!("{base_url}: cannot be a base")))?
        .pop_if_empty()
        .extend([
            "api",
            "v3",
            "as",
            "applications",
            application_id,
            "devices",
            device_id,
            "packages",
            "storage",
            "uplink_message",
        ]);
    Ok(url)
}

/// Duration as the endpoint's `last` parameter: `2h`, `90m`, or `45s`.
/// Sub-second remainders round up to the next second.
pub fn format_window(window: Duration) -> String {
    let mut secs = window.as_secs();
    if window.subsec_nanos() > 0 {
        secs += 1;
    }
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_owned(),
    }
}
