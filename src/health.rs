// llmlb — health supervisor
//
// One scheduler loop drives all endpoints: every second it scans the
// registry snapshot and spawns a probe for each endpoint whose interval has
// elapsed and which is not already being probed. The per-endpoint probing
// flag is the overlap guard. A second loop retries excluded models after the
// exclusion cooldown and clears the flag on a successful ping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::detector;
use crate::models::{ApiFamily, Dialect, EndpointModel, EndpointStatus};
use crate::registry::{EndpointEntry, Registry};
use crate::secrets::SecretBox;

const SCHEDULER_TICK: Duration = Duration::from_secs(1);

struct ProbeState {
    last_probe: Instant,
    consecutive_failures: u32,
    probing: bool,
}

pub struct HealthSupervisor {
    registry: Arc<Registry>,
    client: reqwest::Client,
    config: Arc<Config>,
    secrets: SecretBox,
    states: Mutex<HashMap<String, ProbeState>>,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<Registry>,
        client: reqwest::Client,
        config: Arc<Config>,
        secrets: SecretBox,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            client,
            config,
            secrets,
            states: Mutex::new(HashMap::new()),
        })
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sup = Arc::clone(&self);
        tokio::spawn(async move {
            tracing::info!("health supervisor started");
            let exclusion_sup = Arc::clone(&sup);
            tokio::spawn(async move { exclusion_sup.exclusion_loop().await });
            loop {
                tokio::time::sleep(SCHEDULER_TICK).await;
                sup.tick();
            }
        })
    }

    /// Scan the snapshot; launch due probes. Pending endpoints are probed
    /// immediately (initial detection).
    fn tick(self: &Arc<Self>) {
        let snapshot = self.registry.snapshot();
        let mut states = self.states.lock().expect("probe states");

        // Forget endpoints that were deleted.
        states.retain(|id, _| snapshot.endpoints.contains_key(id));

        for (id, entry) in &snapshot.endpoints {
            let interval = Duration::from_secs(u64::from(
                entry.endpoint.probe_interval_secs.clamp(5, 60),
            ));
            let due = match states.get(id) {
                Some(s) if s.probing => false,
                Some(s) => {
                    entry.endpoint.status == EndpointStatus::Pending
                        || s.last_probe.elapsed() >= interval
                }
                None => true,
            };
            if !due {
                continue;
            }
            let state = states.entry(id.clone()).or_insert(ProbeState {
                last_probe: Instant::now(),
                consecutive_failures: 0,
                probing: false,
            });
            state.probing = true;
            state.last_probe = Instant::now();

            let sup = Arc::clone(self);
            let entry = Arc::clone(entry);
            tokio::spawn(async move {
                sup.probe_endpoint(&entry).await;
                let mut states = sup.states.lock().expect("probe states");
                if let Some(s) = states.get_mut(&entry.endpoint.id) {
                    s.probing = false;
                }
            });
        }
    }

    async fn probe_endpoint(self: &Arc<Self>, entry: &EndpointEntry) {
        let id = entry.endpoint.id.clone();
        let prev_status = entry.endpoint.status;
        let api_key = self.unseal_key(entry);

        if prev_status == EndpointStatus::Pending {
            self.initial_detection(entry, api_key.as_deref()).await;
            return;
        }

        let started = Instant::now();
        let outcome = self.lightweight_probe(entry, api_key.as_deref()).await;
        let latency_ms = started.elapsed().as_millis() as u32;

        match outcome {
            ProbeOutcome::Ok => {
                self.reset_failures(&id);
                if prev_status != EndpointStatus::Online {
                    tracing::info!(endpoint = %entry.endpoint.name, "endpoint online");
                    if self
                        .registry
                        .set_status(&id, EndpointStatus::Online, Some(latency_ms), None)
                        .await
                        .is_ok()
                    {
                        self.sync_models(&id).await;
                    }
                } else {
                    let _ = self
                        .registry
                        .set_status(&id, EndpointStatus::Online, Some(latency_ms), None)
                        .await;
                }
            }
            ProbeOutcome::AuthError(msg) => {
                self.reset_failures(&id);
                tracing::warn!(endpoint = %entry.endpoint.name, "probe rejected: {msg}");
                let _ = self
                    .registry
                    .set_status(&id, EndpointStatus::Error, None, Some(msg))
                    .await;
            }
            ProbeOutcome::Failed(msg) => {
                let failures = self.bump_failures(&id);
                if prev_status == EndpointStatus::Online
                    && failures < self.config.offline_after_failures
                {
                    tracing::debug!(
                        endpoint = %entry.endpoint.name,
                        failures,
                        "probe failed, endpoint still online"
                    );
                    return;
                }
                if prev_status == EndpointStatus::Online {
                    tracing::warn!(endpoint = %entry.endpoint.name, "endpoint offline: {msg}");
                }
                let _ = self
                    .registry
                    .set_status(&id, EndpointStatus::Offline, None, Some(msg))
                    .await;
            }
        }
    }

    /// First contact: full dialect/capability detection, then model sync.
    async fn initial_detection(self: &Arc<Self>, entry: &EndpointEntry, api_key: Option<&str>) {
        let id = &entry.endpoint.id;
        match detector::detect(&self.client, &entry.endpoint.base_url, api_key).await {
            Ok(detection) => {
                tracing::info!(
                    endpoint = %entry.endpoint.name,
                    dialect = detection.dialect.as_str(),
                    models = detection.probed_models.len(),
                    "detection complete"
                );
                let models = models_from_ids(&detection.probed_models, &detection.supported_apis);
                let _ = self
                    .registry
                    .set_detection(
                        id,
                        detection.dialect,
                        detection.supported_apis,
                        detection.latency_ms,
                    )
                    .await;
                let _ = self.registry.set_models(id, models).await;
                let _ = self
                    .registry
                    .set_status(id, EndpointStatus::Online, Some(detection.latency_ms), None)
                    .await;
            }
            Err(e) => {
                tracing::warn!(endpoint = %entry.endpoint.name, "detection failed: {e}");
                let _ = self
                    .registry
                    .set_status(id, EndpointStatus::Error, None, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn lightweight_probe(
        &self,
        entry: &EndpointEntry,
        api_key: Option<&str>,
    ) -> ProbeOutcome {
        let base = entry.endpoint.base_url.trim_end_matches('/');
        let url = match entry.endpoint.dialect {
            Dialect::Ollama => format!("{base}/api/tags"),
            _ => format!("{base}/v1/models"),
        };
        let mut req = self.client.get(&url).timeout(self.config.probe_timeout);
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Ok,
            Ok(resp) if resp.status().is_client_error() => {
                ProbeOutcome::AuthError(format!("probe returned {}", resp.status()))
            }
            Ok(resp) => ProbeOutcome::Failed(format!("probe returned {}", resp.status())),
            Err(e) if e.is_timeout() => ProbeOutcome::Failed("probe timed out".to_string()),
            Err(e) => ProbeOutcome::Failed(format!("probe failed: {e}")),
        }
    }

    /// Reconcile EndpointModel rows with the backend's model list.
    async fn sync_models(self: &Arc<Self>, id: &str) {
        match sync_endpoint_models(&self.registry, &self.client, &self.secrets, id).await {
            Ok(count) => tracing::info!(endpoint = id, models = count, "model sync complete"),
            Err(e) => tracing::warn!(endpoint = id, "model sync failed: {e}"),
        }
    }

    /// Retry excluded models after the cooldown; clear exclusion when the
    /// backend answers again.
    async fn exclusion_loop(self: Arc<Self>) {
        let cooldown = self.config.exclusion_cooldown;
        let mut last_attempt: HashMap<(String, String), Instant> = HashMap::new();
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let snapshot = self.registry.snapshot();
            for (id, entry) in &snapshot.endpoints {
                for model in entry.models.iter().filter(|m| m.excluded) {
                    let key = (id.clone(), model.model_id.clone());
                    if let Some(at) = last_attempt.get(&key) {
                        if at.elapsed() < cooldown {
                            continue;
                        }
                    }
                    last_attempt.insert(key.clone(), Instant::now());

                    let api_key = self.unseal_key(entry);
                    let outcome = self.lightweight_probe(entry, api_key.as_deref()).await;
                    if matches!(outcome, ProbeOutcome::Ok) {
                        tracing::info!(
                            endpoint = %entry.endpoint.name,
                            model = %model.model_id,
                            "exclusion cleared after cooldown ping"
                        );
                        let _ = self
                            .registry
                            .set_excluded(id, &model.model_id, false, None)
                            .await;
                        last_attempt.remove(&key);
                    }
                }
            }
            // Drop trackers for pairs that no longer exist or got cleared.
            last_attempt.retain(|(id, model), _| {
                snapshot
                    .endpoints
                    .get(id)
                    .and_then(|e| e.model(model))
                    .is_some_and(|m| m.excluded)
            });
        }
    }

    fn unseal_key(&self, entry: &EndpointEntry) -> Option<String> {
        entry
            .endpoint
            .api_key_sealed
            .as_deref()
            .and_then(|sealed| self.secrets.unseal(sealed).ok())
    }

    fn bump_failures(&self, id: &str) -> u32 {
        let mut states = self.states.lock().expect("probe states");
        let state = states.get_mut(id).expect("probe state exists during probe");
        state.consecutive_failures += 1;
        state.consecutive_failures
    }

    fn reset_failures(&self, id: &str) {
        let mut states = self.states.lock().expect("probe states");
        if let Some(s) = states.get_mut(id) {
            s.consecutive_failures = 0;
        }
    }
}

/// Fetch the backend's model list and replace the EndpointModel rows.
/// Shared by the supervisor (on transition to online) and the manual
/// /api/endpoints/:id/sync handler.
pub async fn sync_endpoint_models(
    registry: &Registry,
    client: &reqwest::Client,
    secrets: &SecretBox,
    id: &str,
) -> Result<usize, String> {
    let entry = registry
        .get(id)
        .ok_or_else(|| format!("endpoint {id} not found"))?;
    let api_key = entry
        .endpoint
        .api_key_sealed
        .as_deref()
        .and_then(|sealed| secrets.unseal(sealed).ok());
    let base = entry.endpoint.base_url.trim_end_matches('/');

    let models = match entry.endpoint.dialect {
        Dialect::Ollama => fetch_list(client, &format!("{base}/api/tags"), api_key.as_deref())
            .await
            .and_then(|b| detector::parse_ollama_tags(&b)),
        _ => fetch_list(client, &format!("{base}/v1/models"), api_key.as_deref())
            .await
            .and_then(|b| detector::parse_openai_model_list(&b)),
    };

    let ids = models.ok_or_else(|| "backend did not return a model list".to_string())?;
    let supported = if entry.endpoint.supported_apis.is_empty() {
        default_apis_for(entry.endpoint.dialect)
    } else {
        entry.endpoint.supported_apis.clone()
    };
    let count = ids.len();
    registry
        .set_models(id, models_from_ids(&ids, &supported))
        .await
        .map_err(|e| e.to_string())?;
    Ok(count)
}

enum ProbeOutcome {
    Ok,
    /// 4xx — reachable but rejecting us (auth / permission).
    AuthError(String),
    /// 5xx, timeout, connect failure.
    Failed(String),
}

fn models_from_ids(ids: &[String], apis: &[ApiFamily]) -> Vec<EndpointModel> {
    ids.iter()
        .map(|id| EndpointModel::new(id.clone(), apis.to_vec()))
        .collect()
}

fn default_apis_for(dialect: Dialect) -> Vec<ApiFamily> {
    match dialect {
        Dialect::Ollama => vec![ApiFamily::ChatCompletions, ApiFamily::Embeddings],
        _ => vec![ApiFamily::ChatCompletions, ApiFamily::Completions],
    }
}

async fn fetch_list(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
) -> Option<serde_json::Value> {
    let mut req = client.get(url).timeout(Duration::from_secs(5));
    if let Some(key) = api_key {
        req = req.bearer_auth(key);
    }
    let resp = req.send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json().await.ok()
}
