//! Runtime wiring: builds the engine from config and runs it until shutdown.
//!
//! Startup order: store, gate, HTTP server, one startup backfill, then the
//! pipeline worker, the subscription manager and the poll schedule.
//!
//! Shutdown (the `watch` channel flips to `true`): the schedule and the
//! subscription stop, the broker session is disconnected, the push queue
//! drains through the worker, and the HTTP server finishes in-flight requests.

use crate::config::IngestorConfig;
use crate::gate::IngestionGate;
use crate::http::{AppState, build_router};
use crate::pipeline;
use crate::poller::{BackfillPoller, PollError, PollReport, PollerConfig};
use crate::storage::store::{Store, StoreError};
use crate::subscription::{SubscriptionConfig, SubscriptionManager, uplink_topic};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};
use uplink_core::{Normalizer, TimestampPolicy};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("poller: {0}")]
    Poll(#[from] PollError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Config(String),
}

/// Open the store and build the gate. Push and pull normalization fall
/// back to the configured device id.
pub fn build_gate(config: &IngestorConfig) -> Result<IngestionGate, RuntimeError> {
    let store = Store::open(Path::new(&config.database.sqlite_path))?;
    info!(path = %config.database.sqlite_path, "store opened");
    let normalizer = Normalizer::new().with_fallback_device(config.device.device_id.clone());
    Ok(IngestionGate::new(Arc::new(Mutex::new(store)), normalizer))
}

/// Normalizer for `POST /api/ingest`, honouring the degraded timestamp flag.
pub fn http_normalizer(config: &IngestorConfig, gate: &IngestionGate) -> Normalizer {
    let policy = if config.http.degraded_timestamp_fallback {
        TimestampPolicy::SubstituteIngestTime
    } else {
        TimestampPolicy::Strict
    };
    gate.normalizer().clone().with_timestamp_policy(policy)
}

pub fn build_poller(
    config: &IngestorConfig,
    gate: &IngestionGate,
) -> Result<Option<Arc<BackfillPoller>>, RuntimeError> {
    if !config.storage.enabled {
        return Ok(None);
    }
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| RuntimeError::Config("storage poller requires an API key".to_owned()))?;
    let poller = BackfillPoller::new(
        PollerConfig {
            base_url: config.storage.base_url.clone(),
            application_id: config.device.application_id.clone(),
            device_id: config.device.device_id.clone(),
            api_key,
            request_timeout: config.storage.request_timeout,
            min_poll_interval: config.storage.min_poll_interval,
        },
        gate.clone(),
    )?;
    info!(endpoint = %poller.endpoint(), "storage poller configured");
    Ok(Some(Arc::new(poller)))
}

pub fn subscription_config(config: &IngestorConfig) -> Result<Option<SubscriptionConfig>, RuntimeError> {
    if !config.broker.enabled {
        return Ok(None);
    }
    let password = config
        .api_key
        .clone()
        .ok_or_else(|| RuntimeError::Config("broker subscription requires an API key".to_owned()))?;
    Ok(Some(SubscriptionConfig {
        host: config.broker.host.clone(),
        port: config.broker.port,
        client_id: format!("field-telemetry-{}", config.device.device_id),
        username: config.broker.username.clone(),
        password,
        topic: uplink_topic(&config.broker.username, &config.device.device_id),
        keep_alive: config.broker.keep_alive,
        reconnect_min: config.broker.reconnect_min,
        reconnect_max: config.broker.reconnect_max,
        max_packet_bytes: config.broker.max_packet_bytes,
    }))
}

/// One backfill poll of the configured window, then return.
pub async fn run_once(config: &IngestorConfig) -> Result<PollReport, RuntimeError> {
    let gate = build_gate(config)?;
    let poller = build_poller(config, &gate)?
        .ok_or_else(|| RuntimeError::Config("--once requires [storage] enabled".to_owned()))?;
    Ok(poller.poll_report(config.storage.window).await?)
}

/// Run the engine on an already-bound HTTP listener until `shutdown_rx`
/// turns `true`.
pub async fn run(
    config: IngestorConfig,
    listener: TcpListener,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), RuntimeError> {
    let gate = build_gate(&config)?;
    let poller = build_poller(&config, &gate)?;
    let sub_config = subscription_config(&config)?;

    let (queue_tx, queue_rx) = pipeline::channel(config.pipeline.queue_capacity);
    let manager = sub_config.map(|c| SubscriptionManager::new(c, queue_tx, gate.counters().clone()));

    let state = Arc::new(AppState {
        http_normalizer: http_normalizer(&config, &gate),
        gate: gate.clone(),
        poller: poller.clone(),
        poll_window: config.storage.window,
        poll_on_read: config.storage.lazy_on_read && manager.is_none(),
        subscription: manager.as_ref().map(SubscriptionManager::state),
    });

    let addr = listener.local_addr()?;
    let mut http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        let serve = axum::serve(listener, build_router(state)).with_graceful_shutdown(async move {
            let _ = http_shutdown.wait_for(|stop| *stop).await;
        });
        if let Err(e) = serve.await {
            warn!(error = %e, "HTTP server stopped with error");
        }
    });
    info!(addr = %addr, "HTTP server listening");

    // History first, then live.
    if let Some(poller) = &poller {
        if let Some(Ok(report)) = poller.poll_if_due(config.storage.window).await {
            info!(inserted = report.inserted, "startup backfill complete");
        }
    }

    let worker_task = tokio::spawn(pipeline::run_worker(queue_rx, gate.clone()));
    let subscription_task = manager.map(|m| tokio::spawn(m.run(shutdown_rx.clone())));
    let schedule_task = poller.map(|p| {
        tokio::spawn(p.run_schedule(
            config.storage.fetch_interval,
            config.storage.window,
            shutdown_rx.clone(),
        ))
    });

    let mut wait_rx = shutdown_rx;
    let _ = wait_rx.wait_for(|stop| *stop).await;
    info!("shutdown requested");

    if let Some(task) = schedule_task {
        let _ = task.await;
    }
    if let Some(task) = subscription_task {
        let _ = task.await;
    }
    // Every queue sender is gone now; the worker exits once drained.
    let _ = worker_task.await;
    let _ = http_task.await;

    info!("ingestor shutdown complete");
    Ok(())
}
