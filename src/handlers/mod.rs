// llmlb — HTTP handlers
//
// One module per route class; shared helpers live here.

pub mod api_keys;
pub mod auth_api;
pub mod dashboard;
pub mod endpoints;
pub mod invitations;
pub mod models_api;
pub mod openai;
pub mod system;
pub mod users;

use axum::extract::State;
use axum::Json;

use crate::models::{EndpointStatus, HealthResponse};
use crate::state::AppState;

/// GET /api/health — liveness plus a routing summary (public).
#[utoipa::path(get, path = "/api/health", tag = "health",
    responses((status = 200, description = "Gateway health", body = HealthResponse))
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.registry.snapshot();
    let total = snapshot.endpoints.len();
    let online = snapshot
        .endpoints
        .values()
        .filter(|e| e.endpoint.status == EndpointStatus::Online)
        .count();
    Json(HealthResponse {
        status: if state.gate.is_accepting() {
            "ok"
        } else {
            "draining"
        }
        .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        app: "llmlb".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        endpoints_online: online,
        endpoints_total: total,
    })
}

/// GET /api/health/ready — readiness probe (no locks beyond the snapshot).
#[utoipa::path(get, path = "/api/health/ready", tag = "health",
    responses((status = 200, description = "Ready", body = serde_json::Value))
)]
pub async fn readiness(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ready": true,
        "accepting": state.gate.is_accepting(),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

/// Deserialize a JSON body from a Request consumed after the auth
/// middleware (handlers that also need the request extensions take the raw
/// Request and parse here).
pub(crate) async fn parse_body<T: serde::de::DeserializeOwned>(
    request: axum::extract::Request,
) -> Result<T, crate::error::ApiError> {
    use crate::error::ApiError;
    let bytes = axum::body::to_bytes(request.into_body(), 1024 * 1024)
        .await
        .map_err(|e| ApiError::BadRequest(format!("unreadable body: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

/// Pull the authenticated principal that the auth middleware stored.
pub(crate) fn auth_context(
    extensions: &http::Extensions,
) -> Result<crate::auth::AuthContext, crate::error::ApiError> {
    extensions
        .get::<crate::auth::AuthContext>()
        .cloned()
        .ok_or_else(|| {
            crate::error::ApiError::Internal("auth context missing from request".to_string())
        })
}
