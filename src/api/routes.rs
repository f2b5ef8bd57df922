//! API route definitions.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::detect::{DetectionKind, DetectionStatus, Severity};
use crate::ingest::{self, RawEvent};
use crate::storage::detections::{self, DetectionFilter};
use crate::storage::events::{self, EventField, EventFilter, Filter};
use crate::storage::Pool;

/// Evidence events returned with a detection.
const EVIDENCE_LIMIT: usize = 200;
const MAX_PAGE: usize = 500;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/detections/run", post(run_detections))
        .route("/detections", get(list_detections))
        .route("/detections/{id}", get(get_detection).patch(update_detection))
        .route("/events", get(list_events).post(ingest_events))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

/// Run `f` on a pooled connection off the async runtime.
async fn with_conn<T, F>(pool: &Pool, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        f(&conn)
    })
    .await
    .map_err(|e| ApiError::Internal(e.into()))?
    .map_err(ApiError::from)
}

fn parse_opt<T>(raw: Option<String>) -> Result<Option<T>, ApiError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<T>().map_err(|e| ApiError::BadRequest(e.to_string())))
        .transpose()
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn run_detections(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let cfg = Arc::clone(&state.config);
    let clock = Arc::clone(&state.clock);
    let report = with_conn(&state.pool, move |conn| {
        Ok(crate::run_all_rules_now(conn, &cfg, clock.as_ref()))
    })
    .await?;
    Ok(Json(json!({
        "data": report,
        "meta": meta()
    })))
}

#[derive(Debug, Deserialize)]
struct ListDetectionsParams {
    status: Option<String>,
    kind: Option<String>,
    severity: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_detections(
    State(state): State<AppState>,
    Query(params): Query<ListDetectionsParams>,
) -> Result<Json<Value>, ApiError> {
    let filter = DetectionFilter {
        status: parse_opt::<DetectionStatus>(params.status)?,
        kind: parse_opt::<DetectionKind>(params.kind)?,
        severity: parse_opt::<Severity>(params.severity)?,
        limit: params.limit.unwrap_or(50).min(MAX_PAGE),
        offset: params.offset.unwrap_or(0),
    };
    let (limit, offset) = (filter.limit, filter.offset);
    let rows = with_conn(&state.pool, move |conn| detections::list(conn, &filter)).await?;
    Ok(Json(json!({
        "data": rows,
        "meta": { "count": rows.len(), "limit": limit, "offset": offset }
    })))
}

async fn get_detection(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let found = with_conn(&state.pool, move |conn| {
        let Some(det) = detections::get(conn, id)? else {
            return Ok(None);
        };
        let evidence = events::get_many(conn, &det.event_ids, EVIDENCE_LIMIT)?;
        Ok(Some((det, evidence)))
    })
    .await?;

    let (det, evidence) =
        found.ok_or_else(|| ApiError::NotFound(format!("detection {id} not found")))?;
    let mut data = serde_json::to_value(&det).map_err(|e| ApiError::Internal(e.into()))?;
    data["evidence_events"] = json!(evidence);
    Ok(Json(json!({ "data": data, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct DetectionUpdate {
    status: Option<String>,
    /// Empty string clears the assignee.
    assignee: Option<String>,
}

async fn update_detection(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<DetectionUpdate>,
) -> Result<Json<Value>, ApiError> {
    let status = parse_opt::<DetectionStatus>(update.status)?;
    let assignee = update.assignee;

    let updated = with_conn(&state.pool, move |conn| {
        if detections::get(conn, id)?.is_none() {
            return Ok(None);
        }
        if let Some(status) = status {
            detections::set_status(conn, id, status)?;
        }
        if let Some(who) = assignee.as_deref() {
            let who = who.trim();
            detections::set_assignee(conn, id, (!who.is_empty()).then_some(who))?;
        }
        detections::get(conn, id)
    })
    .await?;

    let det = updated.ok_or_else(|| ApiError::NotFound(format!("detection {id} not found")))?;
    Ok(Json(json!({ "data": det, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct EventBatch {
    events: Vec<RawEvent>,
}

async fn ingest_events(
    State(state): State<AppState>,
    Json(batch): Json<EventBatch>,
) -> Result<Json<Value>, ApiError> {
    let summary =
        with_conn(&state.pool, move |conn| ingest::ingest_batch(conn, &batch.events)).await?;
    Ok(Json(json!({ "data": summary, "meta": meta() })))
}

#[derive(Debug, Default, Deserialize)]
struct ListEventsParams {
    #[serde(alias = "module")]
    event_module: Option<String>,
    #[serde(alias = "action")]
    event_action: Option<String>,
    src_ip: Option<String>,
    user: Option<String>,
    start: Option<String>,
    end: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl ListEventsParams {
    fn into_filter(self) -> Result<EventFilter, ApiError> {
        let bound = |raw: Option<String>| {
            raw.filter(|s| !s.trim().is_empty())
                .map(|s| {
                    ingest::parse_timestamp(&s).map_err(|e| ApiError::BadRequest(e.to_string()))
                })
                .transpose()
        };
        let filters = [
            (EventField::Module, self.event_module),
            (EventField::Action, self.event_action),
            (EventField::SrcIp, self.src_ip),
            (EventField::User, self.user),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.filter(|v| !v.is_empty()).map(|v| Filter::new(field, v)))
        .collect();

        Ok(EventFilter {
            filters,
            start: bound(self.start)?,
            end: bound(self.end)?,
            limit: self.limit.unwrap_or(50).min(MAX_PAGE),
            offset: self.offset.unwrap_or(0),
        })
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<ListEventsParams>,
) -> Result<Json<Value>, ApiError> {
    let filter = params.into_filter()?;
    let (limit, offset) = (filter.limit, filter.offset);
    let rows = with_conn(&state.pool, move |conn| events::list(conn, &filter)).await?;
    Ok(Json(json!({
        "data": rows,
        "meta": { "count": rows.len(), "limit": limit, "offset": offset }
    })))
}
