// llmlb — proxy / protocol-translation engine
//
// Forwards an admitted request to its selected endpoint and returns the
// response to the client: unary JSON, SSE token streams, or multipart
// passthrough. Translation happens per dialect (only Ollama needs one);
// OpenAI-native backends are forwarded with their envelopes verified and
// re-serialized.
//
// Failure policy: upstream 4xx goes back to the client untouched; 5xx,
// timeouts and connect errors count against (endpoint, model) and flip the
// exclusion flag after K consecutive failures inside window W. Streams that
// die mid-flight close the downstream with one SSE error event.

pub mod ollama;
pub mod sse;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;

use crate::balancer::InFlightGuard;
use crate::error::ApiError;
use crate::gate::GateGuard;
use crate::history::HistoryRing;
use crate::models::{
    ApiFamily, Dialect, EndpointModel, RecordStatus, RequestRecord, Usage,
};
use crate::registry::EndpointEntry;
use crate::state::AppState;

/// Guards that must stay alive for the duration of the upstream exchange.
/// For SSE they move into the response stream.
pub struct RequestGuards {
    pub in_flight: InFlightGuard,
    pub gate: GateGuard,
}

// ---------------------------------------------------------------------------
// Consecutive-failure tracking (exclusion trigger)
// ---------------------------------------------------------------------------

pub struct FailureTracker {
    inner: Mutex<HashMap<(String, String), FailureWindow>>,
    threshold: u32,
    window: Duration,
}

struct FailureWindow {
    count: u32,
    first: Instant,
}

impl FailureTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            threshold,
            window,
        }
    }

    /// Returns true when the failure crosses the exclusion threshold.
    pub fn record_failure(&self, endpoint_id: &str, model_id: &str) -> bool {
        let key = (endpoint_id.to_string(), model_id.to_string());
        let mut inner = self.inner.lock().expect("failure tracker");
        let entry = inner.entry(key).or_insert(FailureWindow {
            count: 0,
            first: Instant::now(),
        });
        if entry.first.elapsed() > self.window {
            entry.count = 0;
            entry.first = Instant::now();
        }
        entry.count += 1;
        if entry.count >= self.threshold {
            entry.count = 0;
            entry.first = Instant::now();
            true
        } else {
            false
        }
    }

    pub fn record_success(&self, endpoint_id: &str, model_id: &str) {
        self.inner
            .lock()
            .expect("failure tracker")
            .remove(&(endpoint_id.to_string(), model_id.to_string()));
    }
}

// ---------------------------------------------------------------------------
// History recording with cancellation safety
// ---------------------------------------------------------------------------

/// Records exactly one history entry per request. If the holder is dropped
/// before `complete` (client went away mid-stream), a client_cancelled
/// record is written.
struct Recorder {
    ring: Arc<HistoryRing>,
    template: Option<RequestRecord>,
    started: Instant,
}

impl Recorder {
    fn new(state: &AppState, path: &str, model: &str, endpoint_id: &str, body: Option<&Value>) -> Self {
        let request_body = body.and_then(|b| {
            state
                .record_bodies
                .then(|| truncate_utf8(&b.to_string(), state.body_cap_bytes))
        });
        Self {
            ring: Arc::clone(&state.history),
            template: Some(RequestRecord {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
                path: path.to_string(),
                model: model.to_string(),
                endpoint_id: Some(endpoint_id.to_string()),
                status: RecordStatus::Error("client_cancelled".to_string()),
                duration_ms: 0,
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
                request_body,
                response_body: None,
            }),
            started: Instant::now(),
        }
    }

    fn complete(mut self, status: RecordStatus, usage: Usage, response_body: Option<String>) {
        if let Some(mut record) = self.template.take() {
            record.status = status;
            record.duration_ms = self.started.elapsed().as_millis() as u64;
            record.prompt_tokens = usage.prompt_tokens;
            record.completion_tokens = usage.completion_tokens;
            record.total_tokens = usage.total_tokens;
            record.response_body = response_body;
            self.ring.record(record);
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(mut record) = self.template.take() {
            record.duration_ms = self.started.elapsed().as_millis() as u64;
            self.ring.record(record);
        }
    }
}

fn truncate_utf8(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let boundary = s
        .char_indices()
        .take_while(|(i, _)| *i < cap)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    s[..boundary].to_string()
}

// ---------------------------------------------------------------------------
// JSON forwarding (unary + SSE)
// ---------------------------------------------------------------------------

pub async fn forward_json(
    state: AppState,
    entry: Arc<EndpointEntry>,
    model: EndpointModel,
    family: ApiFamily,
    body: Value,
    guards: RequestGuards,
) -> Result<Response, ApiError> {
    let streaming = body["stream"].as_bool().unwrap_or(false);
    let recorder = Recorder::new(
        &state,
        family.v1_path(),
        &model.model_id,
        &entry.endpoint.id,
        Some(&body),
    );

    if streaming
        && matches!(
            family,
            ApiFamily::ChatCompletions | ApiFamily::Completions | ApiFamily::Responses
        )
    {
        forward_sse(state, entry, model, family, body, guards, recorder).await
    } else {
        forward_unary(state, entry, model, family, body, guards, recorder).await
    }
}

fn upstream_url(entry: &EndpointEntry, family: ApiFamily) -> Result<String, ApiError> {
    let base = entry.endpoint.base_url.trim_end_matches('/');
    let path = match entry.endpoint.dialect {
        Dialect::Ollama => ollama::upstream_path(family).ok_or_else(|| {
            ApiError::NoCapableEndpoints(format!(
                "endpoint {} cannot serve {}",
                entry.endpoint.name,
                family.v1_path()
            ))
        })?,
        _ => family.v1_path(),
    };
    Ok(format!("{base}{path}"))
}

fn upstream_request(
    state: &AppState,
    entry: &EndpointEntry,
    url: &str,
    timeout: Option<Duration>,
) -> reqwest::RequestBuilder {
    let mut req = state.client.post(url);
    if let Some(t) = timeout {
        req = req.timeout(t);
    }
    // The caller's authorization header is never forwarded; the endpoint's
    // own key is injected instead.
    if let Some(sealed) = entry.endpoint.api_key_sealed.as_deref() {
        if let Ok(key) = state.secrets.unseal(sealed) {
            req = req.bearer_auth(key);
        }
    }
    req
}

fn translate_request(entry: &EndpointEntry, family: ApiFamily, body: &Value, stream: bool) -> Value {
    match (entry.endpoint.dialect, family) {
        (Dialect::Ollama, ApiFamily::ChatCompletions) => {
            ollama::translate_chat_request(body, stream)
        }
        (Dialect::Ollama, ApiFamily::Embeddings) => ollama::translate_embeddings_request(body),
        _ => body.clone(),
    }
}

/// Handle a failed upstream exchange: bump counters, maybe exclude, log.
fn note_upstream_failure(state: &AppState, entry: &EndpointEntry, model_id: &str, reason: &str) {
    tracing::warn!(
        endpoint = %entry.endpoint.name,
        model = model_id,
        "upstream failure: {reason}"
    );
    if state
        .failures
        .record_failure(&entry.endpoint.id, model_id)
    {
        let registry = Arc::clone(&state.registry);
        let endpoint_id = entry.endpoint.id.clone();
        let model_id = model_id.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            tracing::warn!(
                endpoint = %endpoint_id,
                model = %model_id,
                "excluding model after repeated failures"
            );
            let _ = registry
                .set_excluded(&endpoint_id, &model_id, true, Some(reason))
                .await;
        });
    }
}

fn note_upstream_success(state: &AppState, entry: &EndpointEntry, model_id: &str, usage: Usage) {
    state.failures.record_success(&entry.endpoint.id, model_id);
    let registry = Arc::clone(&state.registry);
    let stats = state.token_stats.clone();
    let endpoint_id = entry.endpoint.id.clone();
    let model_id = model_id.to_string();
    tokio::spawn(async move {
        registry.touch_model(&endpoint_id, &model_id).await;
        stats.record(&endpoint_id, &model_id, usage).await;
    });
}

async fn forward_unary(
    state: AppState,
    entry: Arc<EndpointEntry>,
    model: EndpointModel,
    family: ApiFamily,
    body: Value,
    guards: RequestGuards,
    recorder: Recorder,
) -> Result<Response, ApiError> {
    let url = upstream_url(&entry, family)?;
    let translated = translate_request(&entry, family, &body, false);
    let timeout = Duration::from_secs(u64::from(entry.endpoint.request_timeout_secs));

    let resp = match upstream_request(&state, &entry, &url, Some(timeout))
        .json(&translated)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            let reason = if e.is_timeout() {
                "upstream timeout".to_string()
            } else {
                format!("upstream connect error: {e}")
            };
            note_upstream_failure(&state, &entry, &model.model_id, &reason);
            recorder.complete(RecordStatus::Error(reason.clone()), Usage::default(), None);
            drop(guards);
            return Err(ApiError::Upstream(reason));
        }
    };

    let status = resp.status();
    if status.is_client_error() {
        // Client mistakes pass through untouched.
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or(HeaderValue::from_static("application/json"));
        let bytes = resp.bytes().await.unwrap_or_default();
        recorder.complete(
            RecordStatus::Error(format!("upstream {status}")),
            Usage::default(),
            None,
        );
        drop(guards);
        return Ok((
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_REQUEST),
            [(header::CONTENT_TYPE, content_type)],
            bytes,
        )
            .into_response());
    }
    if !status.is_success() {
        let reason = format!("upstream returned {status}");
        note_upstream_failure(&state, &entry, &model.model_id, &reason);
        recorder.complete(RecordStatus::Error(reason.clone()), Usage::default(), None);
        drop(guards);
        return Err(ApiError::Upstream(reason));
    }

    // Speech synthesis answers with raw audio bytes; pass them through.
    if family == ApiFamily::AudioSpeech {
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or(HeaderValue::from_static("application/octet-stream"));
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                let reason = format!("upstream body error: {e}");
                note_upstream_failure(&state, &entry, &model.model_id, &reason);
                recorder.complete(RecordStatus::Error(reason.clone()), Usage::default(), None);
                drop(guards);
                return Err(ApiError::Upstream(reason));
            }
        };
        note_upstream_success(&state, &entry, &model.model_id, Usage::default());
        recorder.complete(RecordStatus::Success, Usage::default(), None);
        drop(guards);
        return Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response());
    }

    // Deserialize to verify the envelope before re-serializing.
    let upstream_body: Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => {
            let reason = format!("unparseable upstream response: {e}");
            note_upstream_failure(&state, &entry, &model.model_id, &reason);
            recorder.complete(RecordStatus::Error(reason.clone()), Usage::default(), None);
            drop(guards);
            return Err(ApiError::Upstream(reason));
        }
    };

    let (out, usage) = match (entry.endpoint.dialect, family) {
        (Dialect::Ollama, ApiFamily::ChatCompletions) => {
            ollama::translate_chat_response(&upstream_body, &model.model_id)
        }
        (Dialect::Ollama, ApiFamily::Embeddings) => {
            ollama::translate_embeddings_response(&upstream_body, &model.model_id)
        }
        _ => {
            let usage: Usage = serde_json::from_value(upstream_body["usage"].clone())
                .unwrap_or_default();
            (upstream_body, usage)
        }
    };

    note_upstream_success(&state, &entry, &model.model_id, usage);
    let response_body = state
        .record_bodies
        .then(|| truncate_utf8(&out.to_string(), state.body_cap_bytes));
    recorder.complete(RecordStatus::Success, usage, response_body);
    drop(guards);
    Ok(axum::Json(out).into_response())
}

// ---------------------------------------------------------------------------
// SSE forwarding
// ---------------------------------------------------------------------------

async fn forward_sse(
    state: AppState,
    entry: Arc<EndpointEntry>,
    model: EndpointModel,
    family: ApiFamily,
    body: Value,
    guards: RequestGuards,
    recorder: Recorder,
) -> Result<Response, ApiError> {
    let url = upstream_url(&entry, family)?;
    let translated = translate_request(&entry, family, &body, true);

    // No total timeout on streams; only the idle timeout below applies.
    let resp = match upstream_request(&state, &entry, &url, None)
        .json(&translated)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            let reason = format!("upstream connect error: {e}");
            note_upstream_failure(&state, &entry, &model.model_id, &reason);
            recorder.complete(RecordStatus::Error(reason.clone()), Usage::default(), None);
            drop(guards);
            return Err(ApiError::Upstream(reason));
        }
    };

    let status = resp.status();
    if !status.is_success() {
        let reason = format!("upstream returned {status}");
        if status.is_server_error() {
            note_upstream_failure(&state, &entry, &model.model_id, &reason);
        }
        recorder.complete(RecordStatus::Error(reason.clone()), Usage::default(), None);
        drop(guards);
        if status.is_client_error() {
            return Err(ApiError::BadRequest(reason));
        }
        return Err(ApiError::Upstream(reason));
    }

    let idle_timeout = state.config.sse_idle_timeout;
    let dialect = entry.endpoint.dialect;
    let model_id = model.model_id.clone();
    let state2 = state.clone();
    let entry2 = Arc::clone(&entry);

    let stream = async_stream::stream! {
        // Guards and recorder live inside the stream: dropping the body
        // (client disconnect) releases the slot and records cancellation.
        let _guards = guards;
        let recorder = recorder;
        let mut upstream = resp.bytes_stream();
        let mut parser = sse::SseParser::new();
        let mut ndjson_buf = String::new();
        let stream_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        let created = Utc::now().timestamp();
        let mut usage = Usage::default();
        let mut emitted_done = false;

        'outer: loop {
            let chunk = match tokio::time::timeout(idle_timeout, upstream.next()).await {
                Err(_) => {
                    note_upstream_failure(&state2, &entry2, &model_id, "stream idle timeout");
                    recorder.complete(
                        RecordStatus::Error("stream idle timeout".to_string()),
                        usage,
                        None,
                    );
                    yield Ok::<_, std::convert::Infallible>(error_event("stream idle timeout"));
                    return;
                }
                Ok(None) => break 'outer,
                Ok(Some(Err(e))) => {
                    note_upstream_failure(&state2, &entry2, &model_id, "stream aborted");
                    recorder.complete(
                        RecordStatus::Error(format!("upstream stream error: {e}")),
                        usage,
                        None,
                    );
                    yield Ok(error_event("upstream disconnected"));
                    return;
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            let text = String::from_utf8_lossy(&chunk);
            match dialect {
                Dialect::Ollama => {
                    ndjson_buf.push_str(&text);
                    while let Some(pos) = ndjson_buf.find('\n') {
                        let line = ndjson_buf[..pos].trim().to_string();
                        ndjson_buf = ndjson_buf[pos + 1..].to_string();
                        if line.is_empty() {
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<Value>(&line) else {
                            continue;
                        };
                        let done = value["done"].as_bool().unwrap_or(false);
                        let (chunk, final_usage) =
                            ollama::translate_chat_chunk(&value, &model_id, &stream_id, created);
                        if let Some(u) = final_usage {
                            usage = u;
                        }
                        yield Ok(sse::format_event(&chunk).into_bytes());
                        if done {
                            yield Ok(sse::DONE_EVENT.as_bytes().to_vec());
                            emitted_done = true;
                            break 'outer;
                        }
                    }
                }
                _ => {
                    for event in parser.feed(&text) {
                        match event {
                            sse::SseEvent::Data(value) => {
                                if let Ok(u) =
                                    serde_json::from_value::<Usage>(value["usage"].clone())
                                {
                                    if u.total_tokens > 0 {
                                        usage = u;
                                    }
                                }
                                yield Ok(sse::format_event(&value).into_bytes());
                            }
                            sse::SseEvent::Done => {
                                yield Ok(sse::DONE_EVENT.as_bytes().to_vec());
                                emitted_done = true;
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }

        if !emitted_done {
            // EOF without [DONE]: close the stream properly anyway.
            for event in parser.flush() {
                if let sse::SseEvent::Data(value) = event {
                    yield Ok(sse::format_event(&value).into_bytes());
                }
            }
            yield Ok(sse::DONE_EVENT.as_bytes().to_vec());
        }

        note_upstream_success(&state2, &entry2, &model_id, usage);
        recorder.complete(RecordStatus::Success, usage, None);
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

    Ok((StatusCode::OK, headers, Body::from_stream(stream)).into_response())
}

fn error_event(message: &str) -> Vec<u8> {
    let payload = serde_json::json!({
        "error": { "type": "upstream_error", "message": message }
    });
    format!("event: error\ndata: {payload}\n\n").into_bytes()
}

// ---------------------------------------------------------------------------
// Multipart / binary passthrough (audio & images)
// ---------------------------------------------------------------------------

pub async fn forward_multipart(
    state: AppState,
    entry: Arc<EndpointEntry>,
    model: EndpointModel,
    family: ApiFamily,
    headers: HeaderMap,
    body: Body,
    guards: RequestGuards,
) -> Result<Response, ApiError> {
    let url = upstream_url(&entry, family)?;
    let recorder = Recorder::new(
        &state,
        family.v1_path(),
        &model.model_id,
        &entry.endpoint.id,
        None,
    );

    // Stream the inbound body through with a hard size cap; never buffer the
    // whole payload.
    let cap = state.config.multipart_cap_bytes;
    let counted = body.into_data_stream().scan(0usize, move |sent, chunk| {
        let item = match chunk {
            Ok(bytes) => {
                *sent += bytes.len();
                if *sent > cap {
                    Some(Err(std::io::Error::other("request body exceeds size cap")))
                } else {
                    Some(Ok(bytes))
                }
            }
            Err(e) => Some(Err(std::io::Error::other(e))),
        };
        std::future::ready(item)
    });

    let timeout = Duration::from_secs(u64::from(entry.endpoint.request_timeout_secs));
    let mut req = upstream_request(&state, &entry, &url, Some(timeout))
        .body(reqwest::Body::wrap_stream(counted));
    if let Some(ct) = headers.get(header::CONTENT_TYPE) {
        req = req.header(header::CONTENT_TYPE, ct.clone());
    }
    if let Some(cl) = headers.get(header::CONTENT_LENGTH) {
        if cl
            .to_str()
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .is_some_and(|len| len > cap)
        {
            recorder.complete(
                RecordStatus::Error("payload too large".to_string()),
                Usage::default(),
                None,
            );
            drop(guards);
            return Err(ApiError::BadRequest(format!(
                "payload exceeds the {cap} byte cap"
            )));
        }
        req = req.header(header::CONTENT_LENGTH, cl.clone());
    }

    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            let reason = format!("upstream error: {e}");
            note_upstream_failure(&state, &entry, &model.model_id, &reason);
            recorder.complete(RecordStatus::Error(reason.clone()), Usage::default(), None);
            drop(guards);
            return Err(ApiError::Upstream(reason));
        }
    };

    let status = resp.status();
    if status.is_server_error() {
        let reason = format!("upstream returned {status}");
        note_upstream_failure(&state, &entry, &model.model_id, &reason);
        recorder.complete(RecordStatus::Error(reason.clone()), Usage::default(), None);
        drop(guards);
        return Err(ApiError::Upstream(reason));
    }

    if status.is_success() {
        note_upstream_success(&state, &entry, &model.model_id, Usage::default());
        recorder.complete(RecordStatus::Success, Usage::default(), None);
    } else {
        recorder.complete(
            RecordStatus::Error(format!("upstream {status}")),
            Usage::default(),
            None,
        );
    }

    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    let out_status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    // The in-flight slot stays held until the response body is done.
    let body_stream = resp.bytes_stream().map(move |chunk| {
        let _ = &guards;
        chunk
    });

    Ok((
        out_status,
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(body_stream),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_tracker_excludes_after_threshold() {
        let tracker = FailureTracker::new(3, Duration::from_secs(300));
        assert!(!tracker.record_failure("e", "m"));
        assert!(!tracker.record_failure("e", "m"));
        assert!(tracker.record_failure("e", "m"));
        // Counter resets after firing.
        assert!(!tracker.record_failure("e", "m"));
    }

    #[test]
    fn failure_tracker_is_per_pair_and_resets_on_success() {
        let tracker = FailureTracker::new(2, Duration::from_secs(300));
        assert!(!tracker.record_failure("e", "m1"));
        assert!(!tracker.record_failure("e", "m2"));
        tracker.record_success("e", "m1");
        assert!(!tracker.record_failure("e", "m1"));
        assert!(tracker.record_failure("e", "m2"));
    }

    #[test]
    fn failure_window_expires() {
        let tracker = FailureTracker::new(2, Duration::from_millis(10));
        assert!(!tracker.record_failure("e", "m"));
        std::thread::sleep(Duration::from_millis(20));
        // Window elapsed: the old failure no longer counts.
        assert!(!tracker.record_failure("e", "m"));
        assert!(tracker.record_failure("e", "m"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate_utf8(s, 3);
        assert!(t.len() <= 3);
        assert!(s.starts_with(&t));
    }
}
