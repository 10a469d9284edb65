// Proxy engine scenarios against live mock upstreams: simple routing,
// capability filtering, SSE streaming, model exclusion, and Ollama
// translation.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{app, body_json, body_text, seed_api_key, seed_endpoint, spawn_upstream, test_state};
use llmlb::models::{ApiFamily, Dialect, EndpointModel, Permission};

fn chat_request(key: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {key}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn mock_openai() -> Router {
    async fn models() -> Json<Value> {
        Json(json!({ "object": "list", "data": [{ "id": "mock-a" }] }))
    }
    async fn chat(Json(body): Json<Value>) -> axum::response::Response {
        if body["stream"].as_bool().unwrap_or(false) {
            let sse = "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"MOCK_\"}}]}\n\n\
                       data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"OK\"}}],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":3,\"total_tokens\":5}}\n\n\
                       data: [DONE]\n\n";
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                sse.to_string(),
            )
                .into_response()
        } else {
            Json(json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion",
                "model": body["model"],
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "MOCK_OK" },
                    "finish_reason": "stop",
                }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7 }
            }))
            .into_response()
        }
    }
    Router::new()
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat))
}

// ═══════════════════════════════════════════════════════════════════════════
//  Scenario: simple routing
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unary_chat_routes_and_releases_in_flight() {
    let state = test_state().await;
    let key = seed_api_key(&state, "inf", &[Permission::OpenaiInference]).await;
    let base = spawn_upstream(mock_openai()).await;
    let id = seed_endpoint(
        &state,
        "e1",
        &base,
        Dialect::OpenAi,
        vec![EndpointModel::new("mock-a", vec![ApiFamily::ChatCompletions])],
    )
    .await;

    let response = app(state.clone())
        .oneshot(chat_request(
            &key,
            json!({ "model": "mock-a", "messages": [{ "role": "user", "content": "hi" }] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "MOCK_OK");

    // Guard released on completion.
    let entry = state.registry.get(&id).unwrap();
    assert_eq!(entry.in_flight.load(Ordering::Acquire), 0);

    // Usage landed in the history ring.
    let (records, total) = state.history.query(&llmlb::history::HistoryQuery {
        offset: 0,
        limit: 10,
        model: None,
        errors_only: false,
    });
    assert_eq!(total, 1);
    assert_eq!(records[0].total_tokens, 7);
}

#[tokio::test]
async fn unknown_model_is_404_and_wrong_capability_is_503() {
    let state = test_state().await;
    let key = seed_api_key(&state, "inf", &[Permission::OpenaiInference]).await;
    let base = spawn_upstream(mock_openai()).await;
    seed_endpoint(
        &state,
        "e1",
        &base,
        Dialect::OpenAi,
        vec![EndpointModel::new("mock-a", vec![ApiFamily::ChatCompletions])],
    )
    .await;

    // Unknown model → 404 model_not_found.
    let response = app(state.clone())
        .oneshot(chat_request(&key, json!({ "model": "ghost", "messages": [] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "model_not_found");

    // Known model, unsupported capability → 503 service_unavailable.
    let response = app(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/embeddings")
                .header("authorization", format!("Bearer {key}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "model": "mock-a", "input": "x" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "service_unavailable");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("no_capable_endpoints"));
}

// ═══════════════════════════════════════════════════════════════════════════
//  Scenario: streaming
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn sse_stream_is_forwarded_with_single_done() {
    let state = test_state().await;
    let key = seed_api_key(&state, "inf", &[Permission::OpenaiInference]).await;
    let base = spawn_upstream(mock_openai()).await;
    seed_endpoint(
        &state,
        "e1",
        &base,
        Dialect::OpenAi,
        vec![EndpointModel::new("mock-a", vec![ApiFamily::ChatCompletions])],
    )
    .await;

    let response = app(state.clone())
        .oneshot(chat_request(
            &key,
            json!({ "model": "mock-a", "messages": [], "stream": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let text = body_text(response).await;
    let data_lines: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("data: "))
        .collect();
    assert!(data_lines.len() >= 3, "stream too short: {text}");
    assert_eq!(*data_lines.last().unwrap(), "data: [DONE]");
    assert_eq!(
        data_lines
            .iter()
            .filter(|l| l.contains("[DONE]"))
            .count(),
        1
    );

    // Concatenated deltas carry the payload.
    let mut content = String::new();
    for line in &data_lines {
        if let Ok(v) = serde_json::from_str::<Value>(&line[6..]) {
            if let Some(c) = v["choices"][0]["delta"]["content"].as_str() {
                content.push_str(c);
            }
        }
    }
    assert_eq!(content, "MOCK_OK");

    // Usage from the final chunk reaches the ring.
    let (records, _) = state.history.query(&llmlb::history::HistoryQuery {
        offset: 0,
        limit: 1,
        model: None,
        errors_only: false,
    });
    assert_eq!(records[0].total_tokens, 5);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Scenario: model exclusion after K consecutive failures
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn three_upstream_500s_exclude_the_model() {
    let state = test_state().await;
    let key = seed_api_key(&state, "inf", &[Permission::OpenaiInference]).await;

    let failures = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&failures);
    let failing = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { StatusCode::INTERNAL_SERVER_ERROR }
        }),
    );
    let base = spawn_upstream(failing).await;
    let id = seed_endpoint(
        &state,
        "e1",
        &base,
        Dialect::OpenAi,
        vec![EndpointModel::new("mock-a", vec![ApiFamily::ChatCompletions])],
    )
    .await;

    for _ in 0..3 {
        let response = app(state.clone())
            .oneshot(chat_request(&key, json!({ "model": "mock-a", "messages": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
    assert_eq!(failures.load(Ordering::SeqCst), 3);

    // The exclusion lands via a background task; give it a moment.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let entry = state.registry.get(&id).unwrap();
    assert!(entry.model("mock-a").unwrap().excluded);

    // With the only endpoint excluded, the next request is 503 — but the
    // model is still known (not 404).
    let response = app(state.clone())
        .oneshot(chat_request(&key, json!({ "model": "mock-a", "messages": [] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Clearing the exclusion restores routing eligibility.
    state
        .registry
        .set_excluded(&id, "mock-a", false, None)
        .await
        .unwrap();
    let candidates = state
        .registry
        .snapshot()
        .models_for_request("mock-a", ApiFamily::ChatCompletions);
    assert_eq!(candidates.len(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Scenario: upstream 4xx passes through untouched
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn upstream_4xx_passes_through() {
    let state = test_state().await;
    let key = seed_api_key(&state, "inf", &[Permission::OpenaiInference]).await;

    let teapot = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": { "message": "bad prompt" } })),
            )
        }),
    );
    let base = spawn_upstream(teapot).await;
    let id = seed_endpoint(
        &state,
        "e1",
        &base,
        Dialect::OpenAi,
        vec![EndpointModel::new("mock-a", vec![ApiFamily::ChatCompletions])],
    )
    .await;

    let response = app(state.clone())
        .oneshot(chat_request(&key, json!({ "model": "mock-a", "messages": [] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "bad prompt");

    // Client errors do not exclude the model.
    let entry = state.registry.get(&id).unwrap();
    assert!(!entry.model("mock-a").unwrap().excluded);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Scenario: Ollama translation
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn ollama_backend_answers_in_openai_shape() {
    let state = test_state().await;
    let key = seed_api_key(&state, "inf", &[Permission::OpenaiInference]).await;

    async fn ollama_chat(Json(body): Json<Value>) -> Json<Value> {
        // The gateway must have rewritten the request into Ollama shape.
        assert!(body.get("messages").is_some());
        assert!(body.get("stream").is_some());
        Json(json!({
            "model": body["model"],
            "message": { "role": "assistant", "content": "MOCK_OK" },
            "done": true,
            "prompt_eval_count": 5,
            "eval_count": 6,
        }))
    }
    let upstream = Router::new().route("/api/chat", post(ollama_chat));
    let base = spawn_upstream(upstream).await;
    seed_endpoint(
        &state,
        "ollama-node",
        &base,
        Dialect::Ollama,
        vec![EndpointModel::new("llama3", vec![ApiFamily::ChatCompletions])],
    )
    .await;

    let response = app(state.clone())
        .oneshot(chat_request(&key, json!({ "model": "llama3", "messages": [
            { "role": "user", "content": "hi" }
        ]})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "MOCK_OK");
    assert_eq!(body["usage"]["total_tokens"], 11);
}

// ═══════════════════════════════════════════════════════════════════════════
//  /v1/models reflects exclusions and status
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn v1_models_lists_only_routable_models() {
    let state = test_state().await;
    let key = seed_api_key(&state, "mr", &[Permission::OpenaiModelsRead]).await;
    let base = spawn_upstream(mock_openai()).await;
    let id = seed_endpoint(
        &state,
        "e1",
        &base,
        Dialect::OpenAi,
        vec![
            EndpointModel::new("mock-a", vec![ApiFamily::ChatCompletions]),
            EndpointModel::new("mock-b", vec![ApiFamily::ChatCompletions]),
        ],
    )
    .await;

    let list = |state: llmlb::state::AppState, key: String| async move {
        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header("authorization", format!("Bearer {key}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    };

    let body = list(state.clone(), key.clone()).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    // Excluding one model hides it from the listing.
    state
        .registry
        .set_excluded(&id, "mock-b", true, Some("broken".into()))
        .await
        .unwrap();
    let body = list(state.clone(), key.clone()).await;
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["mock-a"]);

    // Taking the endpoint offline empties the listing.
    state
        .registry
        .set_status(&id, llmlb::models::EndpointStatus::Offline, None, None)
        .await
        .unwrap();
    let body = list(state, key).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
}
