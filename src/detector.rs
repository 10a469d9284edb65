// llmlb — backend capability detection
//
// Probes a base URL to infer the backend's dialect and the set of OpenAI
// API families it implements. 4xx answers count as "implemented behind
// auth"; only 404 means the path is absent. Detection is monotonic: the
// caller merges results into previously observed capabilities until an
// explicit re-detection replaces them.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde_json::Value;

use crate::models::{ApiFamily, Dialect};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct Detection {
    pub dialect: Dialect,
    pub supported_apis: Vec<ApiFamily>,
    pub probed_models: Vec<String>,
    pub latency_ms: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend responded but no known API shape matched")]
    Unrecognized,
}

pub async fn detect(
    client: &reqwest::Client,
    base_url: &str,
    api_key: Option<&str>,
) -> Result<Detection, DetectError> {
    let base = base_url.trim_end_matches('/');
    let started = Instant::now();

    // 1) /v1/models — the OpenAI-compatible family.
    let models_probe = get_json(client, &format!("{base}/v1/models"), api_key).await;

    // 2) /api/tags — Ollama.
    let tags_probe = get_json(client, &format!("{base}/api/tags"), api_key).await;

    let latency_ms = started.elapsed().as_millis() as u32;

    if let Some((status, body)) = &models_probe {
        if status.is_success() {
            if let Some(models) = parse_openai_model_list(body) {
                let dialect = disambiguate_openai(client, base, api_key, body).await;
                let supported =
                    probe_supported_apis(client, base, api_key, dialect).await;
                return Ok(Detection {
                    dialect,
                    supported_apis: supported,
                    probed_models: models,
                    latency_ms,
                });
            }
        }
    }

    if let Some((status, body)) = &tags_probe {
        if status.is_success() {
            if let Some(models) = parse_ollama_tags(body) {
                return Ok(Detection {
                    dialect: Dialect::Ollama,
                    // Ollama translates chat + embeddings; nothing else.
                    supported_apis: vec![ApiFamily::ChatCompletions, ApiFamily::Embeddings],
                    probed_models: models,
                    latency_ms,
                });
            }
        }
    }

    // A reachable server that implements neither list endpoint but answers
    // 4xx on /v1/models is most likely OpenAI-compatible behind auth.
    if let Some((status, _)) = &models_probe {
        if status.is_client_error() && *status != StatusCode::NOT_FOUND {
            let supported =
                probe_supported_apis(client, base, api_key, Dialect::OpenAi).await;
            return Ok(Detection {
                dialect: Dialect::OpenAi,
                supported_apis: supported,
                probed_models: Vec::new(),
                latency_ms,
            });
        }
    }

    if models_probe.is_none() && tags_probe.is_none() {
        return Err(DetectError::Unreachable(base.to_string()));
    }
    Err(DetectError::Unrecognized)
}

/// An OpenAI list endpoint answered: tell apart openai / vllm / xllm /
/// llama.cpp by their side-channel signatures.
async fn disambiguate_openai(
    client: &reqwest::Client,
    base: &str,
    api_key: Option<&str>,
    models_body: &Value,
) -> Dialect {
    // xllm exposes /api/system with an xllm_version field.
    if let Some((status, body)) = get_json(client, &format!("{base}/api/system"), api_key).await {
        if status.is_success() && body.get("xllm_version").is_some() {
            return Dialect::Xllm;
        }
    }

    // vllm stamps owned_by on its model rows.
    let owned_by_vllm = models_body["data"]
        .as_array()
        .into_iter()
        .flatten()
        .any(|m| m["owned_by"].as_str() == Some("vllm"));
    if owned_by_vllm {
        return Dialect::Vllm;
    }

    // llama.cpp server answers /props.
    if let Some((status, _)) = get_json(client, &format!("{base}/props"), api_key).await {
        if status.is_success() {
            return Dialect::LlamaCpp;
        }
    }

    Dialect::OpenAi
}

/// Walk the API families and record which paths exist. 2xx and non-404 4xx
/// both count as implemented; 404 means absent.
async fn probe_supported_apis(
    client: &reqwest::Client,
    base: &str,
    api_key: Option<&str>,
    dialect: Dialect,
) -> Vec<ApiFamily> {
    let mut supported = Vec::new();
    for api in ApiFamily::ALL {
        let path = match dialect {
            Dialect::Ollama => continue,
            _ => api.v1_path(),
        };
        let url = format!("{base}{path}");
        let mut req = client
            .post(&url)
            .timeout(PROBE_TIMEOUT)
            .json(&serde_json::json!({}));
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) if resp.status() != StatusCode::NOT_FOUND => supported.push(api),
            _ => {}
        }
    }
    supported
}

pub fn parse_openai_model_list(body: &Value) -> Option<Vec<String>> {
    if body["object"].as_str() != Some("list") {
        // Some servers omit the object tag; accept a bare data array.
        body["data"].as_array()?;
    }
    let models = body["data"]
        .as_array()?
        .iter()
        .filter_map(|m| m["id"].as_str().map(|s| s.to_string()))
        .collect();
    Some(models)
}

pub fn parse_ollama_tags(body: &Value) -> Option<Vec<String>> {
    let models = body["models"]
        .as_array()?
        .iter()
        .filter_map(|m| m["name"].as_str().map(|s| s.to_string()))
        .collect();
    Some(models)
}

async fn get_json(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
) -> Option<(StatusCode, Value)> {
    let mut req = client.get(url).timeout(PROBE_TIMEOUT);
    if let Some(key) = api_key {
        req = req.bearer_auth(key);
    }
    let resp = req.send().await.ok()?;
    let status = resp.status();
    let body = resp.json::<Value>().await.unwrap_or(Value::Null);
    Some((status, body))
}
