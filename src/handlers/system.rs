// llmlb — system & update surface
//
// The update coordinator owns drain semantics; the actual binary swap is an
// external step (`llmlb __internal apply-update`) and out of scope here.
// Apply drains, flips the state to applying, and signals graceful shutdown.

use axum::extract::{Path, Query, Request, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audit::AuditAction;
use crate::error::ApiError;
use crate::gate::{DrainOutcome, UpdateState};
use crate::state::AppState;

/// GET /api/system
pub async fn system_info(State(state): State<AppState>) -> Json<Value> {
    let sys = state.system_monitor.read().await;
    Json(json!({
        "app": "llmlb",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": sys.platform,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "accepting": state.gate.is_accepting(),
        "update_state": state.gate.state(),
        "in_flight": state.gate.in_flight(),
    }))
}

/// POST /api/system/update/check
pub async fn update_check(State(state): State<AppState>) -> Json<Value> {
    // Release discovery belongs to the external updater; the gateway only
    // reports what it is running.
    Json(json!({
        "current_version": env!("CARGO_PKG_VERSION"),
        "update_available": false,
        "state": state.gate.state(),
    }))
}

async fn apply_inner(state: &AppState, force: bool, actor: &str) -> Json<Value> {
    let (outcome, dropped) = if force {
        let dropped = state.gate.force_drain();
        (json!("forced"), dropped)
    } else {
        match state.gate.drain(state.config.drain_timeout).await {
            DrainOutcome::Completed => (json!("drained"), 0),
            DrainOutcome::TimedOut { remaining } => {
                tracing::warn!(remaining, "drain timed out; proceeding with update");
                (json!("drain_timeout"), remaining)
            }
        }
    };

    state.gate.set_state(UpdateState::Applying);
    state
        .audit
        .record(
            actor,
            AuditAction::SystemUpdateApplied,
            "gateway",
            json!({ "forced": force, "dropped_in_flight": dropped }),
        )
        .await;

    // Let the response flush before the listener goes away.
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        shutdown.notify_waiters();
    });

    Json(json!({
        "state": "applying",
        "outcome": outcome,
        "dropped_in_flight": dropped,
    }))
}

/// POST /api/system/update/apply — drain, then hand over to the updater.
pub async fn update_apply(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    Ok(apply_inner(&state, false, &ctx.actor()).await)
}

/// POST /api/system/update/apply/force — skip the drain wait.
pub async fn update_apply_force(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    Ok(apply_inner(&state, true, &ctx.actor()).await)
}

/// POST /api/system/update/rollback — reopen the gate.
pub async fn update_rollback(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    state.gate.resume();
    state
        .audit
        .record(&ctx.actor(), AuditAction::SystemRollback, "gateway", json!({}))
        .await;
    Ok(Json(json!({ "state": state.gate.state() })))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    /// Daily UTC slot, "HH:MM". None clears the schedule.
    pub at: Option<String>,
}

/// GET /api/system/update/schedule
pub async fn schedule_get(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let at: Option<String> =
        sqlx::query_scalar("SELECT update_schedule FROM dashboard_settings WHERE id = 1")
            .fetch_one(&state.db)
            .await?;
    Ok(Json(json!({ "at": at })))
}

/// POST /api/system/update/schedule
pub async fn schedule_set(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let _ctx = super::auth_context(request.extensions())?;
    let body: ScheduleRequest = super::parse_body(request).await?;

    if let Some(at) = &body.at {
        let valid = at.len() == 5
            && at.as_bytes()[2] == b':'
            && at[..2].parse::<u8>().is_ok_and(|h| h < 24)
            && at[3..].parse::<u8>().is_ok_and(|m| m < 60);
        if !valid {
            return Err(ApiError::BadRequest(
                "schedule must be HH:MM (UTC)".to_string(),
            ));
        }
    }

    sqlx::query("UPDATE dashboard_settings SET update_schedule = ? WHERE id = 1")
        .bind(&body.at)
        .execute(&state.db)
        .await?;
    Ok(Json(json!({ "at": body.at })))
}

/// DELETE /api/system/update/schedule
pub async fn schedule_delete(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    sqlx::query("UPDATE dashboard_settings SET update_schedule = NULL WHERE id = 1")
        .execute(&state.db)
        .await?;
    Ok(Json(json!({ "at": Value::Null })))
}

// ---------------------------------------------------------------------------
// Logs & metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub search: Option<String>,
}

/// GET /api/nodes/{id}/logs — recent gateway log lines mentioning the node.
pub async fn node_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("endpoint {id} not found")))?;
    let limit = q.limit.unwrap_or(200).min(500);
    // Default filter: lines touching this endpoint by name or id.
    let needle = q.search.unwrap_or_else(|| entry.endpoint.name.clone());
    let lines = state.log_buffer.recent(limit, Some(&needle));
    Ok(Json(json!({ "logs": lines, "total": lines.len() })))
}

/// GET /api/metrics — Prometheus text format.
pub async fn metrics(State(state): State<AppState>) -> String {
    let snapshot = state.registry.snapshot();
    let online = snapshot
        .endpoints
        .values()
        .filter(|e| e.endpoint.status == crate::models::EndpointStatus::Online)
        .count();
    let in_flight: u64 = snapshot
        .endpoints
        .values()
        .map(|e| u64::from(e.in_flight.load(std::sync::atomic::Ordering::Acquire)))
        .sum();
    let sys = state.system_monitor.read().await;

    format!(
        "# HELP llmlb_endpoints_total Registered endpoints\n\
         # TYPE llmlb_endpoints_total gauge\n\
         llmlb_endpoints_total {}\n\
         # HELP llmlb_endpoints_online Endpoints eligible for routing\n\
         # TYPE llmlb_endpoints_online gauge\n\
         llmlb_endpoints_online {}\n\
         # HELP llmlb_requests_in_flight In-flight proxied requests\n\
         # TYPE llmlb_requests_in_flight gauge\n\
         llmlb_requests_in_flight {}\n\
         # HELP llmlb_cpu_usage_percent CPU usage percentage\n\
         # TYPE llmlb_cpu_usage_percent gauge\n\
         llmlb_cpu_usage_percent {:.1}\n\
         # HELP llmlb_uptime_seconds Gateway uptime\n\
         # TYPE llmlb_uptime_seconds counter\n\
         llmlb_uptime_seconds {}\n",
        snapshot.endpoints.len(),
        online,
        in_flight,
        sys.cpu_usage_percent,
        state.start_time.elapsed().as_secs(),
    )
}

// ---------------------------------------------------------------------------
// Audit surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// GET /api/system/audit
pub async fn audit_list(
    State(state): State<AppState>,
    Query(q): Query<AuditQuery>,
) -> Result<Json<Value>, ApiError> {
    let entries = state
        .audit
        .list(q.offset.unwrap_or(0), q.limit.unwrap_or(100))
        .await?;
    Ok(Json(json!({ "entries": entries })))
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub from_seq: Option<i64>,
}

/// GET /api/system/audit/verify — replay the hash chain.
pub async fn audit_verify(
    State(state): State<AppState>,
    Query(q): Query<VerifyQuery>,
) -> Result<Json<Value>, ApiError> {
    let result = state.audit.verify(q.from_seq.unwrap_or(1)).await?;
    Ok(Json(serde_json::to_value(result).unwrap_or(Value::Null)))
}
