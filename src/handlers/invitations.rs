// llmlb — /api/invitations* handlers

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::audit::AuditAction;
use crate::auth;
use crate::error::ApiError;
use crate::models::{CreateInvitationRequest, InvitationRow, Role};
use crate::state::AppState;

fn invitation_json(row: &InvitationRow) -> Value {
    json!({
        "code": row.code,
        "role": row.role,
        "created_by": row.created_by,
        "created_at": row.created_at,
        "expires_at": row.expires_at,
        "consumed": row.consumed,
        "consumed_at": row.consumed_at,
    })
}

/// GET /api/invitations
pub async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows: Vec<InvitationRow> =
        sqlx::query_as("SELECT * FROM invitations ORDER BY created_at DESC")
            .fetch_all(&state.db)
            .await?;
    let invitations: Vec<Value> = rows.iter().map(invitation_json).collect();
    Ok(Json(json!({ "invitations": invitations, "total": invitations.len() })))
}

/// POST /api/invitations
pub async fn create(
    State(state): State<AppState>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ctx = super::auth_context(request.extensions())?;
    let body: CreateInvitationRequest = super::parse_body(request).await?;

    let code = auth::generate_invitation_code();
    let role = body.role.unwrap_or(Role::Viewer);

    sqlx::query(
        "INSERT INTO invitations (code, role, created_by, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&code)
    .bind(role.as_str())
    .bind(ctx.user_id())
    .bind(Utc::now().to_rfc3339())
    .bind(body.expires_at.map(|t| t.to_rfc3339()))
    .execute(&state.db)
    .await?;

    state
        .audit
        .record(
            &ctx.actor(),
            AuditAction::InvitationCreated,
            &code,
            json!({ "role": role }),
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "code": code, "role": role, "expires_at": body.expires_at })),
    ))
}
