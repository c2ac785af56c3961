use super::AppState;
use super::response::{
    HttpResponse, bad_request, internal_error, json_error_with_details, method_not_allowed,
};
use crate::gate::Outcome;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use uplink_core::{Channel, NormalizeError, canonical_timestamp};

/// Body of a successful `POST /api/ingest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Id of the inserted row, or of the row it duplicates.
    pub id: i64,
    /// `inserted` or `duplicate`.
    pub outcome: String,
    pub device_id: String,
    pub received_at: String,
    pub degraded_timestamp: bool,
}

/// Accept one reading in push or flattened shape.
pub async fn post_ingest(State(state): State<Arc<AppState>>, body: Bytes) -> HttpResponse {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let reason = NormalizeError::InvalidJson(e.to_string());
            state.gate.record_rejected(Channel::Http, &reason);
            return bad_request("Invalid JSON");
        }
    };

    let reading = match state.http_normalizer.normalize(&payload, Channel::Http) {
        Ok(r) => r,
        Err(reason) => {
            state.gate.record_rejected(Channel::Http, &reason);
            return json_error_with_details(
                StatusCode::BAD_REQUEST,
                "INVALID_PAYLOAD",
                reason.to_string(),
                Some(json!({ "channel": Channel::Http })),
            );
        }
    };

    let (id, outcome) = match state.gate.submit(&reading, Channel::Http).await {
        Ok(Outcome::Inserted { id }) => (id, "inserted"),
        Ok(Outcome::Duplicate { id }) => (id, "duplicate"),
        // `submit` takes an already-normalized reading.
        Ok(Outcome::Rejected(reason)) => return bad_request(reason.to_string()),
        Err(e) => return internal_error(e),
    };

    Json(IngestResponse {
        id,
        outcome: outcome.to_owned(),
        device_id: reading.device_id.clone(),
        received_at: canonical_timestamp(&reading.received_at),
        degraded_timestamp: reading.timestamp_degraded,
    })
    .into_response()
}

pub async fn wrong_method() -> HttpResponse {
    method_not_allowed()
}
