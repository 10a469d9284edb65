// llmlb — /api/auth/* handlers
//
// Session lifecycle for dashboard users. Login sets the JWT session cookie
// plus the CSRF double-submit cookie; registration consumes a single-use
// invitation atomically.

use axum::extract::{Request, State};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use serde_json::{json, Value};

use crate::audit::AuditAction;
use crate::auth::{self, CSRF_COOKIE, SESSION_COOKIE};
use crate::error::ApiError;
use crate::models::{ChangePasswordRequest, LoginRequest, RegisterRequest, UserRow};
use crate::state::AppState;

fn session_cookies(state: &AppState, user: &UserRow) -> Result<CookieJar, ApiError> {
    let token = auth::issue_session(&state.config.jwt_secret, user)?;
    let csrf = auth::generate_csrf_token();

    let session = Cookie::build((SESSION_COOKIE, token))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    // Readable by the SPA so it can echo the value in X-CSRF-Token.
    let csrf = Cookie::build((CSRF_COOKIE, csrf))
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    Ok(CookieJar::new().add(session).add(csrf))
}

fn clear_cookies() -> CookieJar {
    CookieJar::new()
        .remove(Cookie::build((SESSION_COOKIE, "")).path("/").build())
        .remove(Cookie::build((CSRF_COOKIE, "")).path("/").build())
}

fn user_json(user: &UserRow) -> Value {
    json!({
        "id": user.id,
        "username": user.username,
        "role": user.role,
        "must_change_password": user.must_change_password,
    })
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<(CookieJar, Json<Value>), ApiError> {
    let user: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE username = ?")
        .bind(&body.username)
        .fetch_optional(&state.db)
        .await?;

    let user = user
        .filter(|u| auth::verify_password(&body.password, &u.password_hash))
        .ok_or_else(|| ApiError::Unauthorized("invalid username or password".to_string()))?;

    let jar = session_cookies(&state, &user)?;
    tracing::info!(username = %user.username, "login");
    Ok((jar, Json(user_json(&user))))
}

/// POST /api/auth/logout
pub async fn logout() -> (CookieJar, Json<Value>) {
    (clear_cookies(), Json(json!({ "logged_out": true })))
}

/// GET /api/auth/me
pub async fn me(State(state): State<AppState>, request: Request) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let user_id = ctx
        .user_id()
        .ok_or_else(|| ApiError::Forbidden("sessions only".to_string()))?;
    let user: UserRow = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("session user no longer exists".to_string()))?;
    Ok(Json(user_json(&user)))
}

/// PUT /api/auth/change-password
pub async fn change_password(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let user_id = ctx
        .user_id()
        .ok_or_else(|| ApiError::Forbidden("sessions only".to_string()))?
        .to_string();
    let body: ChangePasswordRequest = super::parse_body(request).await?;

    let user: UserRow = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&user_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("session user no longer exists".to_string()))?;

    if !auth::verify_password(&body.current_password, &user.password_hash) {
        return Err(ApiError::Forbidden("current password is incorrect".to_string()));
    }
    if body.new_password.len() < 8 {
        return Err(ApiError::BadRequest(
            "new password must be at least 8 characters".to_string(),
        ));
    }

    let hash = auth::hash_password(&body.new_password)?;
    sqlx::query(
        "UPDATE users SET password_hash = ?, must_change_password = 0, updated_at = ? WHERE id = ?",
    )
    .bind(&hash)
    .bind(Utc::now().to_rfc3339())
    .bind(&user_id)
    .execute(&state.db)
    .await?;

    state
        .audit
        .record(&ctx.actor(), AuditAction::UserPasswordChanged, &user_id, json!({}))
        .await;
    Ok(Json(json!({ "changed": true })))
}

/// POST /api/auth/register — invitation-based signup (public route).
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(axum::http::StatusCode, Json<Value>), ApiError> {
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

    // Atomic single-use consumption: the UPDATE only wins once.
    let now = Utc::now().to_rfc3339();
    let consumed = sqlx::query(
        "UPDATE invitations SET consumed = 1, consumed_at = ? \
         WHERE code = ? AND consumed = 0 AND (expires_at IS NULL OR expires_at > ?)",
    )
    .bind(&now)
    .bind(&body.invitation_code)
    .bind(&now)
    .execute(&state.db)
    .await?;
    if consumed.rows_affected() == 0 {
        return Err(ApiError::BadRequest(
            "invitation code is invalid, expired, or already used".to_string(),
        ));
    }

    let role: String = sqlx::query_scalar("SELECT role FROM invitations WHERE code = ?")
        .bind(&body.invitation_code)
        .fetch_one(&state.db)
        .await?;

    let user_id = uuid::Uuid::new_v4().to_string();
    let hash = auth::hash_password(&body.password)?;
    sqlx::query(
        "INSERT INTO users (id, username, password_hash, role, must_change_password, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(&user_id)
    .bind(&body.username)
    .bind(&hash)
    .bind(&role)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let actor = format!("user:{}", body.username);
    state
        .audit
        .record(&actor, AuditAction::InvitationConsumed, &body.invitation_code, json!({}))
        .await;
    state
        .audit
        .record(
            &actor,
            AuditAction::UserCreated,
            &user_id,
            json!({ "via": "invitation", "role": role }),
        )
        .await;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(json!({ "id": user_id, "username": body.username, "role": role })),
    ))
}

