// llmlb — /api/api-keys* handlers
//
// The plaintext key appears exactly once, in the POST response. Only the
// argon2id hash and the display prefix are stored.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::audit::AuditAction;
use crate::auth;
use crate::error::ApiError;
use crate::models::{ApiKeyRow, CreateApiKeyRequest, UpdateApiKeyRequest};
use crate::state::AppState;

fn key_json(row: &ApiKeyRow) -> Value {
    json!({
        "id": row.id,
        "name": row.name,
        "key_prefix": row.key_prefix,
        "permissions": row.permission_set(),
        "created_by": row.created_by,
        "created_at": row.created_at,
        "expires_at": row.expires_at,
    })
}

/// GET /api/api-keys
pub async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows: Vec<ApiKeyRow> = sqlx::query_as("SELECT * FROM api_keys ORDER BY created_at ASC")
        .fetch_all(&state.db)
        .await?;
    let keys: Vec<Value> = rows.iter().map(key_json).collect();
    Ok(Json(json!({ "api_keys": keys, "total": keys.len() })))
}

/// POST /api/api-keys
pub async fn create(
    State(state): State<AppState>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let body: CreateApiKeyRequest = super::parse_body(request).await?;

    if body.permissions.is_empty() {
        return Err(ApiError::BadRequest(
            "an API key needs at least one permission".to_string(),
        ));
    }
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }

    let (plaintext, prefix) = auth::generate_api_key();
    let key_hash = auth::hash_password(&plaintext)?;
    let id = uuid::Uuid::new_v4().to_string();
    let permissions = serde_json::to_string(&body.permissions)
        .map_err(|e| ApiError::Internal(format!("permission encode failed: {e}")))?;

    sqlx::query(
        "INSERT INTO api_keys (id, name, key_hash, key_prefix, permissions, created_by, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(body.name.trim())
    .bind(&key_hash)
    .bind(&prefix)
    .bind(&permissions)
    .bind(ctx.user_id())
    .bind(Utc::now().to_rfc3339())
    .bind(body.expires_at.map(|t| t.to_rfc3339()))
    .execute(&state.db)
    .await?;

    state
        .audit
        .record(
            &ctx.actor(),
            AuditAction::ApiKeyCreated,
            &id,
            json!({ "name": body.name, "permissions": body.permissions }),
        )
        .await;

    // The only response that ever carries the plaintext.
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": id,
            "name": body.name.trim(),
            "key": plaintext,
            "key_prefix": prefix,
            "permissions": body.permissions,
            "expires_at": body.expires_at,
        })),
    ))
}

/// PUT /api/api-keys/{id}
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let body: UpdateApiKeyRequest = super::parse_body(request).await?;

    let row: ApiKeyRow = sqlx::query_as("SELECT * FROM api_keys WHERE id = ?")
        .bind(&id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("API key {id} not found")))?;

    let name = body.name.unwrap_or(row.name);
    let permissions = match body.permissions {
        Some(p) if p.is_empty() => {
            return Err(ApiError::BadRequest(
                "an API key needs at least one permission".to_string(),
            ))
        }
        Some(p) => serde_json::to_string(&p)
            .map_err(|e| ApiError::Internal(format!("permission encode failed: {e}")))?,
        None => row.permissions,
    };
    let expires_at = match body.expires_at {
        None => row.expires_at,
        Some(None) => None,
        Some(Some(t)) => Some(t.to_rfc3339()),
    };

    sqlx::query("UPDATE api_keys SET name = ?, permissions = ?, expires_at = ? WHERE id = ?")
        .bind(&name)
        .bind(&permissions)
        .bind(&expires_at)
        .bind(&id)
        .execute(&state.db)
        .await?;

    state
        .audit
        .record(&ctx.actor(), AuditAction::ApiKeyUpdated, &id, json!({ "name": name }))
        .await;

    let row: ApiKeyRow = sqlx::query_as("SELECT * FROM api_keys WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;
    Ok(Json(key_json(&row)))
}

/// DELETE /api/api-keys/{id}
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let deleted = sqlx::query("DELETE FROM api_keys WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(ApiError::NotFound(format!("API key {id} not found")));
    }
    state
        .audit
        .record(&ctx.actor(), AuditAction::ApiKeyDeleted, &id, json!({}))
        .await;
    Ok(Json(json!({ "deleted": true, "id": id })))
}
