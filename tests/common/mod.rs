// Shared helpers for integration tests: in-memory state, seeded
// principals, and mock upstream servers.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use llmlb::config::Config;
use llmlb::logs::LogBuffer;
use llmlb::models::Permission;
use llmlb::state::AppState;

pub const ADMIN_PASSWORD: &str = "admin-password-123";

/// Fresh AppState over an in-memory sqlite database.
pub async fn test_state() -> AppState {
    let pool = llmlb::db::connect_in_memory()
        .await
        .expect("in-memory store");
    let mut config = Config::from_env();
    config.admission_timeout = Duration::from_millis(200);
    AppState::new(pool, Arc::new(config), LogBuffer::new())
        .await
        .expect("app state")
}

pub fn app(state: AppState) -> axum::Router {
    llmlb::create_router(state)
}

/// Collect a response body into a serde_json::Value.
pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

/// Insert an admin user with a known password.
pub async fn seed_admin(state: &AppState) {
    let hash = llmlb::auth::hash_password(ADMIN_PASSWORD).unwrap();
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO users (id, username, password_hash, role, must_change_password, created_at, updated_at) \
         VALUES ('u-admin', 'admin', ?, 'admin', 0, ?, ?)",
    )
    .bind(&hash)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await
    .unwrap();
}

/// Session credentials extracted from a login response.
pub struct Session {
    pub cookie_header: String,
    pub csrf: String,
}

/// Log in through the router and return the cookie header + CSRF token.
pub async fn login(state: &AppState) -> Session {
    let response = app(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "username": "admin", "password": ADMIN_PASSWORD }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK, "login failed");

    let mut session = String::new();
    let mut csrf = String::new();
    for value in response.headers().get_all("set-cookie") {
        let raw = value.to_str().unwrap();
        let pair = raw.split(';').next().unwrap();
        if pair.starts_with("llmlb_session=") {
            session = pair.to_string();
        } else if let Some(v) = pair.strip_prefix("llmlb_csrf=") {
            csrf = v.to_string();
        }
    }
    assert!(!session.is_empty(), "no session cookie set");
    assert!(!csrf.is_empty(), "no csrf cookie set");

    Session {
        cookie_header: format!("{session}; llmlb_csrf={csrf}"),
        csrf,
    }
}

/// Create an API key with the given permissions directly in the store.
/// Returns the plaintext.
pub async fn seed_api_key(state: &AppState, name: &str, permissions: &[Permission]) -> String {
    let (plaintext, prefix) = llmlb::auth::generate_api_key();
    let hash = llmlb::auth::hash_password(&plaintext).unwrap();
    sqlx::query(
        "INSERT INTO api_keys (id, name, key_hash, key_prefix, permissions, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(name)
    .bind(&hash)
    .bind(&prefix)
    .bind(serde_json::to_string(permissions).unwrap())
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(&state.db)
    .await
    .unwrap();
    plaintext
}

/// Register an endpoint in the registry, attach models, and mark it online,
/// bypassing the health supervisor.
pub async fn seed_endpoint(
    state: &AppState,
    name: &str,
    base_url: &str,
    dialect: llmlb::models::Dialect,
    models: Vec<llmlb::models::EndpointModel>,
) -> String {
    let ep = state
        .registry
        .add(
            &llmlb::models::CreateEndpointRequest {
                name: name.to_string(),
                base_url: base_url.to_string(),
                dialect: Some(dialect),
                api_key: None,
                probe_interval_secs: None,
                max_in_flight: None,
                request_timeout_secs: None,
            },
            None,
            (15, 64, 120),
        )
        .await
        .unwrap();
    state.registry.set_models(&ep.id, models).await.unwrap();
    state
        .registry
        .set_status(&ep.id, llmlb::models::EndpointStatus::Online, Some(5), None)
        .await
        .unwrap();
    ep.id
}

/// Bind a mock upstream router on an ephemeral port; returns its base URL.
pub async fn spawn_upstream(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    format!("http://{addr}")
}
