use super::AppState;
use super::response::{HttpResponse, HttpResult, bad_request, internal_error, not_found};
use crate::storage::store::ReadingQuery;
use axum::Json;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uplink_core::parse_timestamp;

pub const DEFAULT_LIMIT: usize = 1000;
pub const MAX_LIMIT: usize = 10_000;

#[derive(Debug, Default, Deserialize)]
pub struct ReadingsParams {
    pub device_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /api/readings?device_id&from&to&limit`, ascending by event time.
pub async fn get_readings(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ReadingsParams>, QueryRejection>,
) -> HttpResponse {
    let Query(params) = match params {
        Ok(p) => p,
        Err(e) => return bad_request(e.body_text()),
    };
    let query = match to_query(params) {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    state.kick_poll_on_read();
    let result = state.gate.store().lock().await.range(&query);
    match result {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /api/readings/latest`: most recent reading per device.
pub async fn get_latest(State(state): State<Arc<AppState>>) -> HttpResponse {
    state.kick_poll_on_read();
    let result = state.gate.store().lock().await.latest_per_device();
    match result {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /api/readings/{id}`
pub async fn get_reading(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> HttpResponse {
    let Path(id) = match id {
        Ok(id) => id,
        Err(e) => return bad_request(e.body_text()),
    };
    let result = state.gate.store().lock().await.get(id);
    match result {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => not_found(format!("reading {id} not found")),
        Err(e) => internal_error(e),
    }
}

fn to_query(params: ReadingsParams) -> HttpResult<ReadingQuery> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(bad_request(format!("limit must be between 1 and {MAX_LIMIT}")));
    }
    let from = parse_bound(params.from.as_deref(), "from")?;
    let to = parse_bound(params.to.as_deref(), "to")?;
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err(bad_request("from must not be after to"));
        }
    }
    Ok(ReadingQuery {
        device_id: params.device_id.filter(|d| !d.is_empty()),
        from,
        to,
        limit: Some(limit),
    })
}

fn parse_bound(raw: Option<&str>, name: &str) -> HttpResult<Option<DateTime<Utc>>> {
    match raw {
        None => Ok(None),
        Some(s) => parse_timestamp(s)
            .map(Some)
            .ok_or_else(|| bad_request(format!("{name}: unparseable timestamp '{s}'"))),
    }
}
