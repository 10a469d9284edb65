// llmlb — model registration surface
//
// /api/models/register is the canonical path; the legacy /v0 variant
// answers 410 Gone. Registered models are repo references synced by nodes
// (LLMLB_MODELS_DIR / HF_TOKEN are passed through); the gateway itself
// never downloads weights.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::models::RegisterModelRequest;
use crate::state::AppState;

#[derive(sqlx::FromRow)]
struct RegisteredModelRow {
    id: String,
    repo: String,
    filename: Option<String>,
    registered_by: Option<String>,
    registered_at: String,
}

/// GET /api/models/registered
pub async fn list_registered(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows: Vec<RegisteredModelRow> =
        sqlx::query_as("SELECT * FROM registered_models ORDER BY registered_at ASC")
            .fetch_all(&state.db)
            .await?;
    let models: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "repo": r.repo,
                "filename": r.filename,
                "registered_by": r.registered_by,
                "registered_at": r.registered_at,
            })
        })
        .collect();
    Ok(Json(json!({
        "models": models,
        "total": models.len(),
        "models_dir": state.config.models_dir.as_ref().map(|p| p.display().to_string()),
        // Nodes fetch gated repos themselves; they only need to know
        // whether the gateway can hand them a token.
        "hf_token_configured": state.config.hf_token.is_some(),
    })))
}

/// POST /api/models/register — 201 on first registration, 200 when the
/// (repo, filename) pair is already known.
pub async fn register(
    State(state): State<AppState>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let body: RegisterModelRequest = super::parse_body(request).await?;

    let repo = body.repo.trim();
    if repo.is_empty() || !repo.contains('/') {
        return Err(ApiError::BadRequest(
            "repo must look like 'owner/name'".to_string(),
        ));
    }
    let filename = body.filename.as_deref().map(str::trim).filter(|f| !f.is_empty());

    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM registered_models WHERE repo = ? AND filename IS ?",
    )
    .bind(repo)
    .bind(filename)
    .fetch_optional(&state.db)
    .await?;

    if let Some(id) = existing {
        return Ok((
            StatusCode::OK,
            Json(json!({ "id": id, "repo": repo, "filename": filename, "registered": false })),
        ));
    }

    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO registered_models (id, repo, filename, registered_by, registered_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(repo)
    .bind(filename)
    .bind(ctx.user_id())
    .bind(Utc::now().to_rfc3339())
    .execute(&state.db)
    .await?;

    tracing::info!(repo, ?filename, "model registered");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": id, "repo": repo, "filename": filename, "registered": true })),
    ))
}

/// POST /v0/models/register — retired path.
pub async fn register_v0_gone() -> ApiError {
    ApiError::Gone("this path moved to /api/models/register".to_string())
}
