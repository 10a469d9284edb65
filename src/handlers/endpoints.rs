// llmlb — /api/endpoints* handlers

use std::sync::atomic::Ordering;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::audit::AuditAction;
use crate::detector;
use crate::error::ApiError;
use crate::health;
use crate::models::{CreateEndpointRequest, EndpointStatus, UpdateEndpointRequest};
use crate::registry::EndpointEntry;
use crate::state::AppState;

/// Endpoint as returned by the API: secrets stay out, runtime counters come
/// along.
fn endpoint_json(entry: &EndpointEntry, include_models: bool) -> Value {
    let e = &entry.endpoint;
    let mut out = json!({
        "id": e.id,
        "name": e.name,
        "base_url": e.base_url,
        "dialect": e.dialect,
        "supported_apis": e.supported_apis,
        "status": e.status,
        "latency_ms": e.latency_ms,
        "model_count": entry.models.len(),
        "error_count": e.error_count,
        "last_error": e.last_error,
        "last_seen": e.last_seen,
        "registered_at": e.registered_at,
        "probe_interval_secs": e.probe_interval_secs,
        "max_in_flight": e.max_in_flight,
        "request_timeout_secs": e.request_timeout_secs,
        "in_flight": entry.in_flight.load(Ordering::Acquire),
        "has_api_key": e.has_api_key(),
    });
    if include_models {
        out["models"] = serde_json::to_value(&entry.models).unwrap_or(Value::Null);
    }
    out
}

/// GET /api/endpoints
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let endpoints: Vec<Value> = state
        .registry
        .list()
        .iter()
        .map(|e| endpoint_json(e, false))
        .collect();
    Json(json!({ "endpoints": endpoints, "total": endpoints.len() }))
}

/// GET /api/endpoints/{id}
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("endpoint {id} not found")))?;
    Ok(Json(endpoint_json(&entry, true)))
}

/// POST /api/endpoints
pub async fn create(
    State(state): State<AppState>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let body: CreateEndpointRequest = super::parse_body(request).await?;

    let sealed = match body.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => Some(
            state
                .secrets
                .seal(key)
                .map_err(|e| ApiError::Internal(format!("sealing upstream key failed: {e}")))?,
        ),
        None => None,
    };

    let defaults = (
        state.config.default_probe_interval.as_secs() as u32,
        state.config.default_max_in_flight,
        state.config.unary_timeout.as_secs() as u32,
    );
    let endpoint = state.registry.add(&body, sealed, defaults).await?;

    state
        .audit
        .record(
            &ctx.actor(),
            AuditAction::EndpointCreated,
            &endpoint.id,
            json!({ "name": endpoint.name, "base_url": endpoint.base_url }),
        )
        .await;

    let entry = state
        .registry
        .get(&endpoint.id)
        .ok_or_else(|| ApiError::Internal("endpoint vanished after create".to_string()))?;
    Ok((StatusCode::CREATED, Json(endpoint_json(&entry, false))))
}

/// PUT /api/endpoints/{id}
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let body: UpdateEndpointRequest = super::parse_body(request).await?;

    let sealed = match &body.api_key {
        None => None,
        Some(None) => Some(None),
        Some(Some(key)) if key.is_empty() => Some(None),
        Some(Some(key)) => Some(Some(state.secrets.seal(key).map_err(|e| {
            ApiError::Internal(format!("sealing upstream key failed: {e}"))
        })?)),
    };

    let endpoint = state.registry.update(&id, &body, sealed).await?;
    state
        .audit
        .record(
            &ctx.actor(),
            AuditAction::EndpointUpdated,
            &id,
            json!({ "name": endpoint.name }),
        )
        .await;

    let entry = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("endpoint {id} not found")))?;
    Ok(Json(endpoint_json(&entry, false)))
}

/// DELETE /api/endpoints/{id}
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    state.registry.delete(&id).await?;
    state
        .audit
        .record(&ctx.actor(), AuditAction::EndpointDeleted, &id, json!({}))
        .await;
    Ok(Json(json!({ "deleted": true, "id": id })))
}

/// POST /api/endpoints/{id}/test — run a detection probe right now and
/// report what came back.
pub async fn test(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let entry = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("endpoint {id} not found")))?;

    let api_key = entry
        .endpoint
        .api_key_sealed
        .as_deref()
        .and_then(|sealed| state.secrets.unseal(sealed).ok());

    let result = detector::detect(&state.client, &entry.endpoint.base_url, api_key.as_deref()).await;
    state
        .audit
        .record(
            &ctx.actor(),
            AuditAction::EndpointTested,
            &id,
            json!({ "ok": result.is_ok() }),
        )
        .await;

    match result {
        Ok(detection) => {
            state
                .registry
                .set_detection(
                    &id,
                    detection.dialect,
                    detection.supported_apis.clone(),
                    detection.latency_ms,
                )
                .await?;
            let _ = state
                .registry
                .set_status(&id, EndpointStatus::Online, Some(detection.latency_ms), None)
                .await;
            Ok(Json(json!({
                "ok": true,
                "dialect": detection.dialect,
                "supported_apis": detection.supported_apis,
                "probed_models": detection.probed_models,
                "latency_ms": detection.latency_ms,
            })))
        }
        Err(e) => {
            let _ = state
                .registry
                .set_status(&id, EndpointStatus::Error, None, Some(e.to_string()))
                .await;
            Ok(Json(json!({ "ok": false, "error": e.to_string() })))
        }
    }
}

/// POST /api/endpoints/{id}/sync — reconcile EndpointModel rows now.
pub async fn sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    if state.registry.get(&id).is_none() {
        return Err(ApiError::NotFound(format!("endpoint {id} not found")));
    }

    let result =
        health::sync_endpoint_models(&state.registry, &state.client, &state.secrets, &id).await;
    state
        .audit
        .record(
            &ctx.actor(),
            AuditAction::EndpointSynced,
            &id,
            json!({ "ok": result.is_ok() }),
        )
        .await;

    match result {
        Ok(count) => Ok(Json(json!({ "synced": true, "models": count }))),
        Err(e) => Err(ApiError::Upstream(format!("model sync failed: {e}"))),
    }
}

