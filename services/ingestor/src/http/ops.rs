use super::AppState;
use super::response::{
    HttpResponse, bad_gateway, internal_error, not_found, service_unavailable,
};
use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::json;
use std::sync::Arc;

/// `POST /api/fetch`: on-demand backfill, subject to the poller's rate limit.
pub async fn post_fetch(State(state): State<Arc<AppState>>) -> HttpResponse {
    let Some(poller) = &state.poller else {
        return service_unavailable("storage poller is disabled");
    };
    match poller.poll_if_due(state.poll_window).await {
        Some(Ok(report)) => Json(json!({
            "status": "polled",
            "inserted": report.inserted,
            "duplicate": report.duplicate,
            "rejected": report.rejected,
        }))
        .into_response(),
        Some(Err(e)) => bad_gateway(e.to_string()),
        None => Json(json!({ "status": "skipped" })).into_response(),
    }
}

/// `GET /api/v1/metrics`: counters, subscription state and last poll.
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> HttpResponse {
    let readings = match state.gate.store().lock().await.count() {
        Ok(n) => n,
        Err(e) => return internal_error(e),
    };
    let subscription = state
        .subscription
        .as_ref()
        .map_or_else(|| "disabled".to_owned(), |rx| rx.borrow().to_string());
    let last_poll = match &state.poller {
        Some(poller) => poller.last_status().await,
        None => None,
    };

    Json(json!({
        "readings": readings,
        "counters": state.gate.counters().snapshot(),
        "subscription": subscription,
        "last_poll": last_poll,
    }))
    .into_response()
}

pub async fn healthz() -> &'static str {
    "ok"
}

/// Ready once the store answers a query.
pub async fn readyz(State(state): State<Arc<AppState>>) -> HttpResponse {
    match state.gate.store().lock().await.count() {
        Ok(_) => Json(json!({ "ready": true })).into_response(),
        Err(e) => service_unavailable(format!("store unavailable: {e}")),
    }
}

pub async fn no_route() -> HttpResponse {
    not_found("no such route")
}
