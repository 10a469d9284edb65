// llmlb — capability-aware router / load balancer
//
// Selection: filter the snapshot index to online endpoints with a
// non-excluded model, drop endpoints at their in-flight cap, rank by
// (in_flight asc, latency asc, random tiebreak), take the head. When every
// candidate is saturated the request parks in a bounded per-bucket FIFO and
// retries on each capacity release, up to the admission timeout.
//
// The returned InFlightGuard decrements the endpoint counter on every exit
// path, including panic and cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::ApiError;
use crate::models::{ApiFamily, EndpointModel};
use crate::registry::{EndpointEntry, Registry};

#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("model {0} is not served by any endpoint")]
    ModelNotFound(String),
    #[error("no capable endpoints for model {0}")]
    NoCapableEndpoints(String),
    #[error("all endpoints for model {0} are saturated")]
    Backpressure(String),
}

impl From<BalanceError> for ApiError {
    fn from(e: BalanceError) -> Self {
        match e {
            BalanceError::ModelNotFound(m) => {
                ApiError::ModelNotFound(format!("model {m} not found"))
            }
            BalanceError::NoCapableEndpoints(m) => ApiError::NoCapableEndpoints(format!(
                "no_capable_endpoints: no online endpoint serves {m}"
            )),
            BalanceError::Backpressure(m) => {
                ApiError::RateLimited(format!("all endpoints serving {m} are at capacity"))
            }
        }
    }
}

/// Randomness source for the ranking tiebreak; injectable so tests are
/// reproducible.
pub trait RouterRng: Send + Sync {
    fn tiebreak(&self) -> u64;
}

pub struct ThreadRouterRng;

impl RouterRng for ThreadRouterRng {
    fn tiebreak(&self) -> u64 {
        rand::random()
    }
}

/// Deterministic sequence for tests.
pub struct SeqRouterRng(pub AtomicU64);

impl RouterRng for SeqRouterRng {
    fn tiebreak(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Scoped in-flight token. Dropping it releases the slot and wakes admission
/// waiters.
pub struct InFlightGuard {
    counter: Arc<AtomicU32>,
    released: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_waiters();
    }
}

struct QueueSlot {
    queues: Arc<Mutex<HashMap<(String, ApiFamily), usize>>>,
    key: (String, ApiFamily),
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let mut queues = self.queues.lock().expect("admission queues");
        if let Some(count) = queues.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                queues.remove(&self.key);
            }
        }
    }
}

pub struct Balancer {
    registry: Arc<Registry>,
    config: Arc<Config>,
    released: Arc<Notify>,
    queues: Arc<Mutex<HashMap<(String, ApiFamily), usize>>>,
    rng: Box<dyn RouterRng>,
}

impl Balancer {
    pub fn new(registry: Arc<Registry>, config: Arc<Config>) -> Self {
        Self::with_rng(registry, config, Box::new(ThreadRouterRng))
    }

    pub fn with_rng(
        registry: Arc<Registry>,
        config: Arc<Config>,
        rng: Box<dyn RouterRng>,
    ) -> Self {
        Self {
            registry,
            config,
            released: Arc::new(Notify::new()),
            queues: Arc::new(Mutex::new(HashMap::new())),
            rng,
        }
    }

    /// Pick an endpoint for the request, waiting for capacity if necessary.
    pub async fn select_endpoint(
        &self,
        model_id: &str,
        capability: ApiFamily,
    ) -> Result<(Arc<EndpointEntry>, EndpointModel, InFlightGuard), BalanceError> {
        self.select_inner(Some(model_id), capability).await
    }

    /// Capability-only selection for requests whose model id is buried in a
    /// multipart body.
    pub async fn select_for_capability(
        &self,
        capability: ApiFamily,
    ) -> Result<(Arc<EndpointEntry>, EndpointModel, InFlightGuard), BalanceError> {
        self.select_inner(None, capability).await
    }

    async fn select_inner(
        &self,
        model_id: Option<&str>,
        capability: ApiFamily,
    ) -> Result<(Arc<EndpointEntry>, EndpointModel, InFlightGuard), BalanceError> {
        let deadline = Instant::now() + self.config.admission_timeout;
        let mut queued: Option<QueueSlot> = None;
        let queue_model = model_id.unwrap_or("*");

        loop {
            // Arm the wakeup before inspecting state so a release between
            // check and wait is not lost.
            let notified = self.released.notified();

            let snapshot = self.registry.snapshot();
            let candidates = match model_id {
                Some(model) => snapshot.models_for_request(model, capability),
                None => snapshot.endpoints_for_capability(capability),
            };
            if candidates.is_empty() {
                return match model_id {
                    Some(model) if snapshot.model_known(model) => {
                        Err(BalanceError::NoCapableEndpoints(model.to_string()))
                    }
                    Some(model) => Err(BalanceError::ModelNotFound(model.to_string())),
                    None => Err(BalanceError::NoCapableEndpoints(format!(
                        "{capability:?}"
                    ))),
                };
            }

            if let Some(picked) = self.try_admit(&candidates) {
                return Ok(picked);
            }

            // Saturated. Join the bucket queue (bounded) and wait for a
            // release or the deadline.
            if queued.is_none() {
                queued = Some(self.join_queue(queue_model, capability)?);
            }
            if self.config.admission_timeout.is_zero() {
                return Err(BalanceError::Backpressure(queue_model.to_string()));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BalanceError::Backpressure(queue_model.to_string()));
            }
        }
    }

    /// Admission + ranking. Returns None when every candidate is at cap.
    fn try_admit(
        &self,
        candidates: &[(Arc<EndpointEntry>, EndpointModel)],
    ) -> Option<(Arc<EndpointEntry>, EndpointModel, InFlightGuard)> {
        let mut ranked: Vec<_> = candidates
            .iter()
            .map(|(entry, model)| {
                let in_flight = entry.in_flight.load(Ordering::Acquire);
                let latency = entry.endpoint.latency_ms.unwrap_or(u32::MAX);
                (in_flight, latency, self.rng.tiebreak(), entry, model)
            })
            .filter(|(in_flight, _, _, entry, _)| *in_flight < entry.endpoint.max_in_flight)
            .collect();
        ranked.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

        for (_, _, _, entry, model) in ranked {
            // Increment-if-below-cap; a concurrent winner pushes us to the
            // next candidate.
            let cap = entry.endpoint.max_in_flight;
            let admitted = entry
                .in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    (current < cap).then_some(current + 1)
                })
                .is_ok();
            if admitted {
                return Some((
                    Arc::clone(entry),
                    model.clone(),
                    InFlightGuard {
                        counter: Arc::clone(&entry.in_flight),
                        released: Arc::clone(&self.released),
                    },
                ));
            }
        }
        None
    }

    fn join_queue(
        &self,
        model_id: &str,
        capability: ApiFamily,
    ) -> Result<QueueSlot, BalanceError> {
        let key = (model_id.to_string(), capability);
        let mut queues = self.queues.lock().expect("admission queues");
        let count = queues.entry(key.clone()).or_insert(0);
        if *count >= self.config.admission_queue_cap {
            return Err(BalanceError::Backpressure(model_id.to_string()));
        }
        *count += 1;
        Ok(QueueSlot {
            queues: Arc::clone(&self.queues),
            key,
        })
    }

    /// Depth of one admission queue (dashboard telemetry).
    pub fn queue_depth(&self, model_id: &str, capability: ApiFamily) -> usize {
        self.queues
            .lock()
            .expect("admission queues")
            .get(&(model_id.to_string(), capability))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{CreateEndpointRequest, EndpointStatus};

    fn test_config(admission_timeout: Duration) -> Arc<Config> {
        let mut cfg = Config::from_env();
        cfg.admission_timeout = admission_timeout;
        cfg.admission_queue_cap = 2;
        Arc::new(cfg)
    }

    async fn registry_with_endpoint(
        name: &str,
        url: &str,
        max_in_flight: u32,
        latency: u32,
    ) -> (Arc<Registry>, String) {
        let reg = Arc::new(Registry::load(db::connect_in_memory().await.unwrap()).await.unwrap());
        let ep = reg
            .add(
                &CreateEndpointRequest {
                    name: name.to_string(),
                    base_url: url.to_string(),
                    dialect: None,
                    api_key: None,
                    probe_interval_secs: None,
                    max_in_flight: Some(max_in_flight),
                    request_timeout_secs: None,
                },
                None,
                (15, 64, 120),
            )
            .await
            .unwrap();
        reg.set_models(
            &ep.id,
            vec![EndpointModel::new(
                "mock-a",
                vec![ApiFamily::ChatCompletions],
            )],
        )
        .await
        .unwrap();
        reg.set_status(&ep.id, EndpointStatus::Online, Some(latency), None)
            .await
            .unwrap();
        (reg, ep.id)
    }

    fn balancer(reg: Arc<Registry>, cfg: Arc<Config>) -> Balancer {
        Balancer::with_rng(reg, cfg, Box::new(SeqRouterRng(AtomicU64::new(0))))
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let (reg, _) = registry_with_endpoint("a", "http://h:1", 4, 10).await;
        let lb = balancer(reg, test_config(Duration::from_secs(1)));
        assert!(matches!(
            lb.select_endpoint("nope", ApiFamily::ChatCompletions).await,
            Err(BalanceError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn known_model_wrong_capability_is_no_capable_endpoints() {
        let (reg, _) = registry_with_endpoint("a", "http://h:1", 4, 10).await;
        let lb = balancer(reg, test_config(Duration::from_secs(1)));
        assert!(matches!(
            lb.select_endpoint("mock-a", ApiFamily::Embeddings).await,
            Err(BalanceError::NoCapableEndpoints(_))
        ));
    }

    #[tokio::test]
    async fn guard_releases_slot() {
        let (reg, id) = registry_with_endpoint("a", "http://h:1", 1, 10).await;
        let lb = balancer(Arc::clone(&reg), test_config(Duration::ZERO));

        let (entry, _, guard) = lb
            .select_endpoint("mock-a", ApiFamily::ChatCompletions)
            .await
            .unwrap();
        assert_eq!(entry.endpoint.id, id);
        assert_eq!(entry.in_flight.load(Ordering::Acquire), 1);

        // Saturated now; zero admission timeout means immediate backpressure.
        assert!(matches!(
            lb.select_endpoint("mock-a", ApiFamily::ChatCompletions).await,
            Err(BalanceError::Backpressure(_))
        ));

        drop(guard);
        assert_eq!(entry.in_flight.load(Ordering::Acquire), 0);
        let again = lb
            .select_endpoint("mock-a", ApiFamily::ChatCompletions)
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let (reg, _) = registry_with_endpoint("a", "http://h:1", 1, 10).await;
        let lb = Arc::new(balancer(
            Arc::clone(&reg),
            test_config(Duration::from_secs(5)),
        ));

        let (_, _, guard) = lb
            .select_endpoint("mock-a", ApiFamily::ChatCompletions)
            .await
            .unwrap();

        let lb2 = Arc::clone(&lb);
        let waiter =
            tokio::spawn(
                async move { lb2.select_endpoint("mock-a", ApiFamily::ChatCompletions).await },
            );

        // Give the waiter time to park, then release.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lb.queue_depth("mock-a", ApiFamily::ChatCompletions), 1);
        drop(guard);

        let picked = waiter.await.unwrap();
        assert!(picked.is_ok());
        assert_eq!(lb.queue_depth("mock-a", ApiFamily::ChatCompletions), 0);
    }

    #[tokio::test]
    async fn queue_cap_rejects_excess_waiters() {
        let (reg, _) = registry_with_endpoint("a", "http://h:1", 1, 10).await;
        // cap 2 from test_config
        let lb = Arc::new(balancer(
            Arc::clone(&reg),
            test_config(Duration::from_secs(5)),
        ));

        let (_, _, _guard) = lb
            .select_endpoint("mock-a", ApiFamily::ChatCompletions)
            .await
            .unwrap();

        let mut waiters = Vec::new();
        for _ in 0..2 {
            let lb2 = Arc::clone(&lb);
            waiters.push(tokio::spawn(async move {
                lb2.select_endpoint("mock-a", ApiFamily::ChatCompletions).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Queue is full: the next request bounces immediately.
        assert!(matches!(
            lb.select_endpoint("mock-a", ApiFamily::ChatCompletions).await,
            Err(BalanceError::Backpressure(_))
        ));

        for w in waiters {
            w.abort();
        }
    }

    #[tokio::test]
    async fn ranking_prefers_low_in_flight_then_latency() {
        let reg = Arc::new(Registry::load(db::connect_in_memory().await.unwrap()).await.unwrap());
        let mut ids = Vec::new();
        for (name, latency) in [("slow", 200u32), ("fast", 10u32)] {
            let ep = reg
                .add(
                    &CreateEndpointRequest {
                        name: name.to_string(),
                        base_url: format!("http://{name}:1"),
                        dialect: None,
                        api_key: None,
                        probe_interval_secs: None,
                        max_in_flight: Some(8),
                        request_timeout_secs: None,
                    },
                    None,
                    (15, 64, 120),
                )
                .await
                .unwrap();
            reg.set_models(
                &ep.id,
                vec![EndpointModel::new(
                    "mock-a",
                    vec![ApiFamily::ChatCompletions],
                )],
            )
            .await
            .unwrap();
            reg.set_status(&ep.id, EndpointStatus::Online, Some(latency), None)
                .await
                .unwrap();
            ids.push(ep.id);
        }

        let lb = balancer(Arc::clone(&reg), test_config(Duration::from_secs(1)));

        // Equal in-flight: lowest latency wins.
        let (entry, _, g1) = lb
            .select_endpoint("mock-a", ApiFamily::ChatCompletions)
            .await
            .unwrap();
        assert_eq!(entry.endpoint.name, "fast");

        // fast now has one in flight; slow is preferred.
        let (entry2, _, _g2) = lb
            .select_endpoint("mock-a", ApiFamily::ChatCompletions)
            .await
            .unwrap();
        assert_eq!(entry2.endpoint.name, "slow");
        drop(g1);
    }
}
