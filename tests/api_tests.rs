// Administrative surface integration tests: sessions, CSRF, the
// permission matrix, endpoint CRUD, invitations, API keys, and the update
// coordinator.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use common::{app, body_json, login, seed_admin, seed_api_key, test_state, ADMIN_PASSWORD};
use llmlb::models::Permission;

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn bearer(method: &str, uri: &str, key: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json");
    match body {
        Some(v) => builder.body(Body::from(v.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn with_session(
    method: &str,
    uri: &str,
    session: &common::Session,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("cookie", &session.cookie_header)
        .header("x-csrf-token", &session.csrf)
        .header("content-type", "application/json");
    match body {
        Some(v) => builder.body(Body::from(v.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Sessions
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn login_me_logout_roundtrip() {
    let state = test_state().await;
    seed_admin(&state).await;

    // Unauthenticated /api/auth/me is 401.
    let response = app(state.clone()).oneshot(get("/api/auth/me")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let session = login(&state).await;
    let response = app(state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/auth/me")
                .header("cookie", &session.cookie_header)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let me = body_json(response).await;
    assert_eq!(me["username"], "admin");
    assert_eq!(me["role"], "admin");
}

#[tokio::test]
async fn bad_password_is_401() {
    let state = test_state().await;
    seed_admin(&state).await;

    let response = app(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "username": "admin", "password": "wrong" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn session_writes_need_csrf() {
    let state = test_state().await;
    seed_admin(&state).await;
    let session = login(&state).await;

    // Same cookie, missing header → 403.
    let response = app(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/endpoints")
                .header("cookie", &session.cookie_header)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "name": "e", "base_url": "http://h:1" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // With the header it goes through.
    let response = app(state)
        .oneshot(with_session(
            "POST",
            "/api/endpoints",
            &session,
            Some(json!({ "name": "e", "base_url": "http://h:1" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Permission matrix (key with endpoints.read only)
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn api_key_permission_matrix() {
    let state = test_state().await;
    let key = seed_api_key(&state, "ro", &[Permission::EndpointsRead]).await;

    // Inference denied.
    let response = app(state.clone())
        .oneshot(bearer(
            "POST",
            "/v1/chat/completions",
            &key,
            Some(json!({ "model": "mock-a", "messages": [] })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Model listing denied.
    let response = app(state.clone())
        .oneshot(bearer("GET", "/v1/models", &key, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Endpoint listing allowed.
    let response = app(state.clone())
        .oneshot(bearer("GET", "/api/endpoints", &key, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Dashboard is never key-accessible.
    let response = app(state)
        .oneshot(bearer("GET", "/api/dashboard/overview", &key, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_key_is_401() {
    let state = test_state().await;
    let response = app(state)
        .oneshot(bearer("GET", "/api/endpoints", "sk_does-not-exist", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Endpoint CRUD
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn endpoint_crud_flow() {
    let state = test_state().await;
    let key = seed_api_key(
        &state,
        "mgr",
        &[Permission::EndpointsManage, Permission::EndpointsRead],
    )
    .await;

    // Create
    let response = app(state.clone())
        .oneshot(bearer(
            "POST",
            "/api/endpoints",
            &key,
            Some(json!({ "name": "node-a", "base_url": "http://mock:9001", "api_key": "sk-upstream" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "pending");
    assert_eq!(created["has_api_key"], true);

    // The secret never shows up in list responses.
    let response = app(state.clone())
        .oneshot(bearer("GET", "/api/endpoints", &key, None))
        .await
        .unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed["total"], 1);
    assert!(listed.to_string().find("sk-upstream").is_none());

    // Duplicate (name, base_url) is rejected.
    let response = app(state.clone())
        .oneshot(bearer(
            "POST",
            "/api/endpoints",
            &key,
            Some(json!({ "name": "node-a", "base_url": "http://mock:9001" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Invalid URL is a 400.
    let response = app(state.clone())
        .oneshot(bearer(
            "POST",
            "/api/endpoints",
            &key,
            Some(json!({ "name": "bad", "base_url": "ftp://nope" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Update
    let response = app(state.clone())
        .oneshot(bearer(
            "PUT",
            &format!("/api/endpoints/{id}"),
            &key,
            Some(json!({ "max_in_flight": 8 })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["max_in_flight"], 8);

    // Delete, then 404.
    let response = app(state.clone())
        .oneshot(bearer("DELETE", &format!("/api/endpoints/{id}"), &key, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app(state)
        .oneshot(bearer("GET", &format!("/api/endpoints/{id}"), &key, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ═══════════════════════════════════════════════════════════════════════════
//  API keys
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn api_key_create_returns_plaintext_once() {
    let state = test_state().await;
    seed_admin(&state).await;
    let session = login(&state).await;

    let response = app(state.clone())
        .oneshot(with_session(
            "POST",
            "/api/api-keys",
            &session,
            Some(json!({ "name": "ci", "permissions": ["openai.inference"] })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let plaintext = created["key"].as_str().unwrap();
    assert!(plaintext.starts_with("sk_"));
    assert_eq!(created["key_prefix"], plaintext[..7]);

    // The listing carries the prefix but never the key.
    let response = app(state.clone())
        .oneshot(with_session("GET", "/api/api-keys", &session, None))
        .await
        .unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed["total"], 1);
    assert!(listed.to_string().find(plaintext).is_none());

    // Empty permission sets are rejected.
    let response = app(state)
        .oneshot(with_session(
            "POST",
            "/api/api-keys",
            &session,
            Some(json!({ "name": "useless", "permissions": [] })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Invitations & registration
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn invitation_flow_is_single_use() {
    let state = test_state().await;
    seed_admin(&state).await;
    let session = login(&state).await;

    let response = app(state.clone())
        .oneshot(with_session(
            "POST",
            "/api/invitations",
            &session,
            Some(json!({ "role": "viewer" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let code = body_json(response).await["code"].as_str().unwrap().to_string();

    let register = |username: &str| {
        json!({ "invitation_code": code, "username": username, "password": "long-enough-pw" })
    };

    let response = app(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/register")
                .header("content-type", "application/json")
                .body(Body::from(register("newuser").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["role"], "viewer");

    // Second use of the same code fails.
    let response = app(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/register")
                .header("content-type", "application/json")
                .body(Body::from(register("another").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Users
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn last_admin_cannot_be_deleted() {
    let state = test_state().await;
    seed_admin(&state).await;
    let session = login(&state).await;

    let response = app(state)
        .oneshot(with_session("DELETE", "/api/users/u-admin", &session, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn change_password_requires_current() {
    let state = test_state().await;
    seed_admin(&state).await;
    let session = login(&state).await;

    let response = app(state.clone())
        .oneshot(with_session(
            "PUT",
            "/api/auth/change-password",
            &session,
            Some(json!({ "current_password": "nope", "new_password": "new-password-1" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(state)
        .oneshot(with_session(
            "PUT",
            "/api/auth/change-password",
            &session,
            Some(json!({
                "current_password": ADMIN_PASSWORD,
                "new_password": "new-password-1"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Model registration
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn model_registration_is_idempotent_and_v0_is_gone() {
    let state = test_state().await;
    let key = seed_api_key(&state, "mm", &[Permission::ModelsManage]).await;

    let body = json!({ "repo": "org/model", "filename": "model.gguf" });
    let response = app(state.clone())
        .oneshot(bearer("POST", "/api/models/register", &key, Some(body.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app(state.clone())
        .oneshot(bearer("POST", "/api/models/register", &key, Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Retired path answers 410 without auth.
    let response = app(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v0/models/register")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Audit chain over the API
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn admin_actions_land_in_audit_chain() {
    let state = test_state().await;
    seed_admin(&state).await;
    let session = login(&state).await;

    let response = app(state.clone())
        .oneshot(with_session(
            "POST",
            "/api/endpoints",
            &session,
            Some(json!({ "name": "audited", "base_url": "http://h:2" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app(state.clone())
        .oneshot(with_session("GET", "/api/system/audit", &session, None))
        .await
        .unwrap();
    let audit = body_json(response).await;
    let entries = audit["entries"].as_array().unwrap();
    assert!(entries
        .iter()
        .any(|e| e["action"] == "endpoint.created" && e["actor"] == "user:admin"));

    let response = app(state)
        .oneshot(with_session("GET", "/api/system/audit/verify", &session, None))
        .await
        .unwrap();
    let verify = body_json(response).await;
    assert_eq!(verify["result"], "ok");
}

// ═══════════════════════════════════════════════════════════════════════════
//  Update coordinator
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn drain_rejects_new_inference_and_force_reports_dropped() {
    let state = test_state().await;
    seed_admin(&state).await;
    let session = login(&state).await;
    let key = seed_api_key(&state, "inf", &[Permission::OpenaiInference]).await;

    // Two requests in flight.
    let _g1 = state.gate.try_acquire().unwrap();
    let _g2 = state.gate.try_acquire().unwrap();

    let response = app(state.clone())
        .oneshot(with_session(
            "POST",
            "/api/system/update/apply/force",
            &session,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let applied = body_json(response).await;
    assert_eq!(applied["dropped_in_flight"], 2);
    assert_eq!(applied["state"], "applying");

    // New inference requests now answer 503.
    let response = app(state.clone())
        .oneshot(bearer(
            "POST",
            "/v1/chat/completions",
            &key,
            Some(json!({ "model": "mock-a", "messages": [] })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "service_unavailable");

    // Rollback reopens the gate.
    let response = app(state.clone())
        .oneshot(with_session(
            "POST",
            "/api/system/update/rollback",
            &session,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.gate.is_accepting());
}
