// llmlb — OpenAI-compatible /v1 surface
//
// Every handler runs behind the auth middleware and the inference gate:
// gate admission first (503 while draining), then model routing, then the
// proxy engine. The in-flight and gate guards travel into the proxy so
// release happens on every exit path.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::gate::GateGuard;
use crate::models::ApiFamily;
use crate::proxy::{self, RequestGuards};
use crate::state::AppState;

const DRAINING_MESSAGE: &str = "Node is syncing / draining";

fn acquire_gate(state: &AppState) -> Result<GateGuard, ApiError> {
    state
        .gate
        .try_acquire()
        .ok_or_else(|| ApiError::Unavailable(DRAINING_MESSAGE.to_string()))
}

/// Shared unary/SSE JSON inference path.
async fn infer_json(
    state: AppState,
    family: ApiFamily,
    body: Value,
) -> Result<Response, ApiError> {
    let gate = acquire_gate(&state)?;

    let model_id = body["model"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError::BadRequest("request is missing the model field".to_string()))?;

    let (entry, endpoint_model, in_flight) =
        state.balancer.select_endpoint(&model_id, family).await?;

    proxy::forward_json(
        state.clone(),
        entry,
        endpoint_model,
        family,
        body,
        RequestGuards { in_flight, gate },
    )
    .await
}

/// Multipart passthrough path; the endpoint is chosen by capability because
/// the model id sits inside the multipart body.
async fn infer_multipart(
    state: AppState,
    family: ApiFamily,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let gate = acquire_gate(&state)?;
    let (entry, endpoint_model, in_flight) =
        state.balancer.select_for_capability(family).await?;

    proxy::forward_multipart(
        state.clone(),
        entry,
        endpoint_model,
        family,
        headers,
        body,
        RequestGuards { in_flight, gate },
    )
    .await
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    infer_json(state, ApiFamily::ChatCompletions, body).await
}

pub async fn completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    infer_json(state, ApiFamily::Completions, body).await
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    infer_json(state, ApiFamily::Embeddings, body).await
}

pub async fn responses(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    infer_json(state, ApiFamily::Responses, body).await
}

/// POST /v1/audio/speech — JSON body, binary response.
pub async fn audio_speech(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    infer_json(state, ApiFamily::AudioSpeech, body).await
}

/// POST /v1/audio/transcriptions — multipart audio upload.
pub async fn audio_transcriptions(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    infer_multipart(state, ApiFamily::AudioTranscription, parts.headers, body).await
}

/// POST /v1/images/generations — JSON body.
pub async fn image_generations(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    infer_json(state, ApiFamily::ImageGeneration, body).await
}

/// POST /v1/images/edits — multipart image upload.
pub async fn image_edits(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    infer_multipart(state, ApiFamily::ImageEdits, parts.headers, body).await
}

/// POST /v1/images/variations — multipart image upload.
pub async fn image_variations(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    infer_multipart(state, ApiFamily::ImageVariations, parts.headers, body).await
}

/// GET /v1/models — union of non-excluded models on online endpoints, in
/// the OpenAI list shape.
pub async fn list_models(State(state): State<AppState>) -> Result<Response, ApiError> {
    let _gate = acquire_gate(&state)?;
    let snapshot = state.registry.snapshot();
    let data: Vec<Value> = snapshot
        .visible_models()
        .into_iter()
        .map(|(id, created)| {
            json!({
                "id": id,
                "object": "model",
                "created": created.timestamp(),
                "owned_by": "llmlb",
            })
        })
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

/// GET /v1/models/{id}
pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let _gate = acquire_gate(&state)?;
    let snapshot = state.registry.snapshot();
    let found = snapshot
        .visible_models()
        .into_iter()
        .find(|(model, _)| model == &id);
    match found {
        Some((model, created)) => Ok(Json(json!({
            "id": model,
            "object": "model",
            "created": created.timestamp(),
            "owned_by": "llmlb",
        }))
        .into_response()),
        None => Err(ApiError::ModelNotFound(format!("model {id} not found"))),
    }
}
