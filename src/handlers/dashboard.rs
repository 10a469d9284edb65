// llmlb — /api/dashboard/* handlers (sessions only)

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::history::{self, HistoryQuery};
use crate::models::EndpointStatus;
use crate::state::AppState;

/// GET /api/dashboard/overview
pub async fn overview(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    let total = snapshot.endpoints.len();
    let online = snapshot
        .endpoints
        .values()
        .filter(|e| e.endpoint.status == EndpointStatus::Online)
        .count();
    let models = snapshot.visible_models().len();
    let in_flight: u64 = snapshot
        .endpoints
        .values()
        .map(|e| u64::from(e.in_flight.load(std::sync::atomic::Ordering::Acquire)))
        .sum();
    let sys = state.system_monitor.read().await;

    Json(json!({
        "endpoints_total": total,
        "endpoints_online": online,
        "models_available": models,
        "requests_in_flight": in_flight,
        "requests_recorded": state.history.len(),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "update_state": state.gate.state(),
        "system": {
            "cpu_usage_percent": sys.cpu_usage_percent,
            "memory_used_mb": sys.memory_used_mb,
            "memory_total_mb": sys.memory_total_mb,
            "platform": sys.platform,
        },
    }))
}

/// GET /api/dashboard/stats — request outcome counters over the ring.
pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    let (all, total) = state.history.query(&HistoryQuery {
        offset: 0,
        limit: usize::MAX,
        model: None,
        errors_only: false,
    });
    let errors = all
        .iter()
        .filter(|r| !matches!(r.status, crate::models::RecordStatus::Success))
        .count();
    let avg_ms = if all.is_empty() {
        0
    } else {
        all.iter().map(|r| r.duration_ms).sum::<u64>() / all.len() as u64
    };

    Json(json!({
        "requests_total": total,
        "requests_failed": errors,
        "avg_duration_ms": avg_ms,
    }))
}

/// GET /api/dashboard/nodes — endpoint summaries for the nodes page.
pub async fn nodes(State(state): State<AppState>) -> Json<Value> {
    let nodes: Vec<Value> = state
        .registry
        .list()
        .iter()
        .map(|entry| {
            let e = &entry.endpoint;
            json!({
                "id": e.id,
                "name": e.name,
                "base_url": e.base_url,
                "dialect": e.dialect,
                "status": e.status,
                "latency_ms": e.latency_ms,
                "model_count": entry.models.len(),
                "excluded_models": entry.models.iter().filter(|m| m.excluded).count(),
                "in_flight": entry.in_flight.load(std::sync::atomic::Ordering::Acquire),
                "max_in_flight": e.max_in_flight,
                "last_error": e.last_error,
                "last_seen": e.last_seen,
            })
        })
        .collect();
    Json(json!({ "nodes": nodes }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// GET /api/dashboard/request-history
pub async fn request_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<Value> {
    let (records, total) = state.history.query(&HistoryQuery {
        offset: params.offset,
        limit: params.limit,
        model: params.model,
        errors_only: params.status.as_deref() == Some("error"),
    });
    // The listing omits bodies; /request-responses/:id serves them.
    let rows: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "timestamp": r.timestamp,
                "path": r.path,
                "model": r.model,
                "endpoint_id": r.endpoint_id,
                "status": r.status,
                "duration_ms": r.duration_ms,
                "total_tokens": r.total_tokens,
            })
        })
        .collect();
    Json(json!({ "records": rows, "total": total, "offset": params.offset }))
}

/// GET /api/dashboard/request-responses — most recent records with bodies.
pub async fn request_responses(State(state): State<AppState>) -> Json<Value> {
    let (records, _) = state.history.query(&HistoryQuery {
        offset: 0,
        limit: 50,
        model: None,
        errors_only: false,
    });
    Json(json!({ "records": records }))
}

/// GET /api/dashboard/request-responses/{id} — body retrieval; 404 once
/// the ring has evicted the record.
pub async fn request_response(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .history
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("request {id} is no longer in the ring")))?;
    Ok(Json(serde_json::to_value(&*record).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    #[serde(default)]
    pub format: Option<String>,
}

/// GET /api/dashboard/request-history/export?format=csv|json
pub async fn export_history(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    let records = state.history.export_snapshot();
    match params.format.as_deref().unwrap_or("json") {
        "csv" => {
            let csv = history::export_csv(&records);
            Ok((
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                    (
                        header::CONTENT_DISPOSITION,
                        "attachment; filename=\"request-history.csv\"",
                    ),
                ],
                csv,
            )
                .into_response())
        }
        "json" => Ok(Json(json!({ "records": records })).into_response()),
        other => Err(ApiError::BadRequest(format!(
            "unknown export format {other}; use csv or json"
        ))),
    }
}

/// GET /api/dashboard/stats/tokens
pub async fn tokens_total(State(state): State<AppState>) -> Json<Value> {
    let totals = state.token_stats.totals().await;
    Json(json!({
        "prompt_tokens": totals.prompt_tokens,
        "completion_tokens": totals.completion_tokens,
        "total_tokens": totals.total_tokens,
        "requests": totals.requests,
    }))
}

/// GET /api/dashboard/stats/tokens/daily
pub async fn tokens_daily(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "days": state.token_stats.daily(30).await }))
}

/// GET /api/dashboard/stats/tokens/monthly
pub async fn tokens_monthly(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "months": state.token_stats.monthly(12).await }))
}
