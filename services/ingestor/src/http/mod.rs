//! HTTP surface: the ingestion endpoint, the read interface, and ops routes.
//!
//! | route                     | method | handler                      |
//! |---------------------------|--------|------------------------------|
//! | `/api/ingest`             | POST   | [`ingest::post_ingest`]      |
//! | `/api/readings`           | GET    | [`readings::get_readings`]   |
//! | `/api/readings/latest`    | GET    | [`readings::get_latest`]     |
//! | `/api/readings/{id}`      | GET    | [`readings::get_reading`]    |
//! | `/api/fetch`              | POST   | [`ops::post_fetch`]          |
//! | `/api/v1/metrics`         | GET    | [`ops::get_metrics`]         |
//! | `/healthz`, `/readyz`     | GET    | [`ops`]                      |
//!
//! Every error body is an [`response::HttpErrorEnvelope`].

pub mod ingest;
pub mod ops;
pub mod readings;
pub mod response;

use crate::gate::IngestionGate;
use crate::poller::BackfillPoller;
use crate::subscription::SubscriptionState;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uplink_core::Normalizer;

pub struct AppState {
    pub gate: IngestionGate,
    /// Normalizer for `POST /api/ingest`; carries the configured timestamp policy.
    pub http_normalizer: Normalizer,
    pub poller: Option<Arc<BackfillPoller>>,
    pub poll_window: Duration,
    /// Kick a background poll from read endpoints.
    pub poll_on_read: bool,
    /// `None` when the broker subscription is disabled.
    pub subscription: Option<watch::Receiver<SubscriptionState>>,
}

impl AppState {
    /// State with only the gate; no poller, no subscription.
    pub fn new(gate: IngestionGate) -> Self {
        let http_normalizer = gate.normalizer().clone();
        AppState {
            gate,
            http_normalizer,
            poller: None,
            poll_window: Duration::from_secs(3600),
            poll_on_read: false,
            subscription: None,
        }
    }

    pub(crate) fn kick_poll_on_read(&self) {
        if !self.poll_on_read {
            return;
        }
        if let Some(poller) = &self.poller {
            poller.poll_in_background(self.poll_window);
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/ingest",
            post(ingest::post_ingest).fallback(ingest::wrong_method),
        )
        .route("/api/readings", get(readings::get_readings))
        .route("/api/readings/latest", get(readings::get_latest))
        .route("/api/readings/{id}", get(readings::get_reading))
        .route("/api/fetch", post(ops::post_fetch))
        .route("/api/v1/metrics", get(ops::get_metrics))
        .route("/healthz", get(ops::healthz))
        .route("/readyz", get(ops::readyz))
        .fallback(ops::no_route)
        .with_state(state)
}
