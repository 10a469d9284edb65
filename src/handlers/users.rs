// llmlb — /api/users* handlers

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::audit::AuditAction;
use crate::auth;
use crate::error::ApiError;
use crate::models::{CreateUserRequest, Role, UpdateUserRequest, UserRow};
use crate::state::AppState;

fn user_json(u: &UserRow) -> Value {
    json!({
        "id": u.id,
        "username": u.username,
        "role": u.role,
        "must_change_password": u.must_change_password,
        "created_at": u.created_at,
        "updated_at": u.updated_at,
    })
}

/// GET /api/users
pub async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let users: Vec<UserRow> = sqlx::query_as("SELECT * FROM users ORDER BY created_at ASC")
        .fetch_all(&state.db)
        .await?;
    let users: Vec<Value> = users.iter().map(user_json).collect();
    Ok(Json(json!({ "users": users, "total": users.len() })))
}

/// POST /api/users
pub async fn create(
    State(state): State<AppState>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let body: CreateUserRequest = super::parse_body(request).await?;

    auth::validate_username(&body.username)?;
    if body.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "password must be at least 8 characters".to_string(),
        ));
    }

    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE username = ?")
        .bind(&body.username)
        .fetch_one(&state.db)
        .await?;
    if existing > 0 {
        return Err(ApiError::Conflict("username is taken".to_string()));
    }

    let role = body.role.unwrap_or(Role::Viewer);
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO users (id, username, password_hash, role, must_change_password, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&id)
    .bind(&body.username)
    .bind(auth::hash_password(&body.password)?)
    .bind(role.as_str())
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    state
        .audit
        .record(
            &ctx.actor(),
            AuditAction::UserCreated,
            &id,
            json!({ "username": body.username, "role": role }),
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": id, "username": body.username, "role": role })),
    ))
}

/// PUT /api/users/{id}
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let body: UpdateUserRequest = super::parse_body(request).await?;

    let user: UserRow = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user {id} not found")))?;

    // Demoting the last admin would lock everyone out, same as deleting it.
    if let Some(new_role) = body.role {
        if user.role == "admin" && new_role == Role::Viewer {
            let admins: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = 'admin'")
                    .fetch_one(&state.db)
                    .await?;
            if admins <= 1 {
                return Err(ApiError::Conflict(
                    "cannot demote the last admin".to_string(),
                ));
            }
        }
    }

    let role = body.role.map(|r| r.as_str().to_string()).unwrap_or(user.role);
    let password_hash = match &body.password {
        Some(p) if p.len() >= 8 => auth::hash_password(p)?,
        Some(_) => {
            return Err(ApiError::BadRequest(
                "password must be at least 8 characters".to_string(),
            ))
        }
        None => user.password_hash,
    };
    let must_change = body
        .must_change_password
        .unwrap_or(user.must_change_password);

    sqlx::query(
        "UPDATE users SET role = ?, password_hash = ?, must_change_password = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(&role)
    .bind(&password_hash)
    .bind(must_change)
    .bind(Utc::now().to_rfc3339())
    .bind(&id)
    .execute(&state.db)
    .await?;

    state
        .audit
        .record(&ctx.actor(), AuditAction::UserUpdated, &id, json!({ "role": role }))
        .await;
    Ok(Json(json!({ "id": id, "role": role })))
}

/// DELETE /api/users/{id}
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;

    let user: UserRow = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user {id} not found")))?;

    if user.role == "admin" {
        let admins: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = 'admin'")
            .fetch_one(&state.db)
            .await?;
        if admins <= 1 {
            return Err(ApiError::Conflict(
                "cannot delete the last admin".to_string(),
            ));
        }
    }

    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;

    state
        .audit
        .record(
            &ctx.actor(),
            AuditAction::UserDeleted,
            &id,
            json!({ "username": user.username }),
        )
        .await;
    Ok(Json(json!({ "deleted": true, "id": id })))
}

