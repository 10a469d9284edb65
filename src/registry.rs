// llmlb — endpoint registry
//
// Authoritative in-memory view of endpoints and their models, write-through
// to the sqlite store. Readers take an Arc clone of the current snapshot;
// all mutation happens under a single writer lock and ends with one atomic
// snapshot swap. `in_flight` counters live outside the snapshot so they
// survive swaps and stay shared with outstanding request guards.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use url::Url;

use crate::models::{
    ApiFamily, CreateEndpointRequest, Dialect, Endpoint, EndpointModel, EndpointStatus,
    UpdateEndpointRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("base_url is not a valid absolute http(s) URL: {0}")]
    InvalidUrl(String),
    #[error("an endpoint named {0} with this base_url already exists")]
    DuplicateBaseUrl(String),
    #[error("endpoint not found: {0}")]
    NotFound(String),
    #[error("invalid status transition: {from} -> {to}")]
    ConflictingStatus { from: EndpointStatus, to: EndpointStatus },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl From<RegistryError> for crate::error::ApiError {
    fn from(e: RegistryError) -> Self {
        use crate::error::ApiError;
        match e {
            RegistryError::InvalidUrl(_) => ApiError::BadRequest(e.to_string()),
            RegistryError::DuplicateBaseUrl(_) => ApiError::Conflict(e.to_string()),
            RegistryError::NotFound(_) => ApiError::NotFound(e.to_string()),
            RegistryError::ConflictingStatus { .. } => ApiError::Conflict(e.to_string()),
            RegistryError::Db(inner) => ApiError::Internal(format!("registry store error: {inner}")),
        }
    }
}

/// One endpoint plus its models, as seen by a snapshot.
#[derive(Debug)]
pub struct EndpointEntry {
    pub endpoint: Endpoint,
    pub models: Vec<EndpointModel>,
    /// Shared across snapshot generations; decremented by request guards.
    pub in_flight: Arc<AtomicU32>,
}

impl EndpointEntry {
    pub fn model(&self, model_id: &str) -> Option<&EndpointModel> {
        self.models.iter().find(|m| m.model_id == model_id)
    }
}

#[derive(Default)]
pub struct RegistrySnapshot {
    pub endpoints: HashMap<String, Arc<EndpointEntry>>,
    /// Hot-path index: (model_id, capability) -> endpoint ids.
    index: HashMap<(String, ApiFamily), Vec<String>>,
}

impl RegistrySnapshot {
    fn rebuild_index(&mut self) {
        let mut index: HashMap<(String, ApiFamily), Vec<String>> = HashMap::new();
        for (id, entry) in &self.endpoints {
            for model in &entry.models {
                for api in &model.supported_apis {
                    index
                        .entry((model.model_id.clone(), *api))
                        .or_default()
                        .push(id.clone());
                }
            }
        }
        self.index = index;
    }

    /// Candidates for routing: online endpoints with a non-excluded model
    /// supporting the capability. O(#matches) via the index.
    pub fn models_for_request(
        &self,
        model_id: &str,
        capability: ApiFamily,
    ) -> Vec<(Arc<EndpointEntry>, EndpointModel)> {
        let Some(ids) = self.index.get(&(model_id.to_string(), capability)) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.endpoints.get(id))
            .filter(|e| e.endpoint.status == EndpointStatus::Online)
            .filter_map(|e| {
                e.model(model_id)
                    .filter(|m| !m.excluded)
                    .map(|m| (Arc::clone(e), m.clone()))
            })
            .collect()
    }

    /// Capability-only candidates, for requests whose model is buried in a
    /// multipart body. Every online endpoint with a non-excluded model
    /// supporting the capability qualifies.
    pub fn endpoints_for_capability(
        &self,
        capability: ApiFamily,
    ) -> Vec<(Arc<EndpointEntry>, EndpointModel)> {
        self.endpoints
            .values()
            .filter(|e| e.endpoint.status == EndpointStatus::Online)
            .filter_map(|e| {
                e.models
                    .iter()
                    .find(|m| !m.excluded && m.supported_apis.contains(&capability))
                    .map(|m| (Arc::clone(e), m.clone()))
            })
            .collect()
    }

    /// Whether any EndpointModel row knows this model at all (any status).
    pub fn model_known(&self, model_id: &str) -> bool {
        ApiFamily::ALL
            .iter()
            .any(|api| self.index.contains_key(&(model_id.to_string(), *api)))
    }

    /// Distinct models visible on /v1/models: backed by at least one
    /// non-excluded EndpointModel on an online endpoint.
    pub fn visible_models(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut seen: HashMap<String, DateTime<Utc>> = HashMap::new();
        for entry in self.endpoints.values() {
            if entry.endpoint.status != EndpointStatus::Online {
                continue;
            }
            for model in &entry.models {
                if model.excluded {
                    continue;
                }
                let created = entry.endpoint.registered_at;
                seen.entry(model.model_id.clone())
                    .and_modify(|t| {
                        if created < *t {
                            *t = created;
                        }
                    })
                    .or_insert(created);
            }
        }
        let mut models: Vec<_> = seen.into_iter().collect();
        models.sort_by(|a, b| a.0.cmp(&b.0));
        models
    }
}

pub struct Registry {
    db: SqlitePool,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    /// Serializes all writes; held across store round-trips.
    writer: tokio::sync::Mutex<()>,
}

impl Registry {
    /// Load the durable state into the first snapshot.
    pub async fn load(db: SqlitePool) -> Result<Self, RegistryError> {
        let rows: Vec<EndpointRow> = sqlx::query_as("SELECT * FROM endpoints").fetch_all(&db).await?;
        let mut endpoints = HashMap::new();
        for row in rows {
            let models: Vec<ModelRow> =
                sqlx::query_as("SELECT * FROM endpoint_models WHERE endpoint_id = ?")
                    .bind(&row.id)
                    .fetch_all(&db)
                    .await?;
            let models: Vec<EndpointModel> = models.into_iter().map(ModelRow::into_model).collect();
            let mut endpoint = row.into_endpoint();
            // Probes decide eligibility after restart; nothing is online
            // until the supervisor has seen it.
            if endpoint.status == EndpointStatus::Online {
                endpoint.status = EndpointStatus::Offline;
            }
            endpoint.model_count = models.len();
            endpoints.insert(
                endpoint.id.clone(),
                Arc::new(EndpointEntry {
                    endpoint,
                    models,
                    in_flight: Arc::new(AtomicU32::new(0)),
                }),
            );
        }
        let mut snap = RegistrySnapshot {
            endpoints,
            index: HashMap::new(),
        };
        snap.rebuild_index();
        Ok(Self {
            db,
            snapshot: RwLock::new(Arc::new(snap)),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().expect("registry snapshot lock").clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<EndpointEntry>> {
        self.snapshot().endpoints.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<EndpointEntry>> {
        let mut entries: Vec<_> = self.snapshot().endpoints.values().cloned().collect();
        entries.sort_by(|a, b| a.endpoint.registered_at.cmp(&b.endpoint.registered_at));
        entries
    }

    pub async fn add(
        &self,
        req: &CreateEndpointRequest,
        api_key_sealed: Option<String>,
        defaults: (u32, u32, u32),
    ) -> Result<Endpoint, RegistryError> {
        let base_url = validate_base_url(&req.base_url)?;

        let _w = self.writer.lock().await;
        {
            let snap = self.snapshot();
            if snap.endpoints.values().any(|e| {
                e.endpoint.name == req.name && e.endpoint.base_url == base_url
            }) {
                return Err(RegistryError::DuplicateBaseUrl(req.name.clone()));
            }
        }

        let (probe_default, max_in_flight_default, timeout_default) = defaults;
        let endpoint = Endpoint {
            id: uuid::Uuid::new_v4().to_string(),
            name: req.name.clone(),
            base_url,
            dialect: req.dialect.unwrap_or(Dialect::Other),
            supported_apis: Vec::new(),
            status: EndpointStatus::Pending,
            latency_ms: None,
            model_count: 0,
            error_count: 0,
            last_error: None,
            last_seen: None,
            registered_at: Utc::now(),
            probe_interval_secs: req.probe_interval_secs.unwrap_or(probe_default).clamp(5, 60),
            max_in_flight: req.max_in_flight.unwrap_or(max_in_flight_default).max(1),
            request_timeout_secs: req.request_timeout_secs.unwrap_or(timeout_default).max(1),
            api_key_sealed,
        };

        sqlx::query(
            "INSERT INTO endpoints (id, name, base_url, dialect, supported_apis, status, \
             api_key_sealed, probe_interval_secs, max_in_flight, request_timeout_secs, registered_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&endpoint.id)
        .bind(&endpoint.name)
        .bind(&endpoint.base_url)
        .bind(endpoint.dialect.as_str())
        .bind(apis_json(&endpoint.supported_apis))
        .bind(endpoint.status.as_str())
        .bind(&endpoint.api_key_sealed)
        .bind(endpoint.probe_interval_secs as i64)
        .bind(endpoint.max_in_flight as i64)
        .bind(endpoint.request_timeout_secs as i64)
        .bind(endpoint.registered_at.to_rfc3339())
        .execute(&self.db)
        .await?;

        self.mutate(|snap| {
            snap.endpoints.insert(
                endpoint.id.clone(),
                Arc::new(EndpointEntry {
                    endpoint: endpoint.clone(),
                    models: Vec::new(),
                    in_flight: Arc::new(AtomicU32::new(0)),
                }),
            );
        });
        Ok(endpoint)
    }

    pub async fn update(
        &self,
        id: &str,
        patch: &UpdateEndpointRequest,
        api_key_sealed: Option<Option<String>>,
    ) -> Result<Endpoint, RegistryError> {
        let _w = self.writer.lock().await;
        let entry = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let mut endpoint = entry.endpoint.clone();

        if let Some(name) = &patch.name {
            endpoint.name = name.clone();
        }
        if let Some(base_url) = &patch.base_url {
            endpoint.base_url = validate_base_url(base_url)?;
        }
        if let Some(dialect) = patch.dialect {
            endpoint.dialect = dialect;
        }
        if let Some(sealed) = api_key_sealed {
            endpoint.api_key_sealed = sealed;
        }
        if let Some(v) = patch.probe_interval_secs {
            endpoint.probe_interval_secs = v.clamp(5, 60);
        }
        if let Some(v) = patch.max_in_flight {
            endpoint.max_in_flight = v.max(1);
        }
        if let Some(v) = patch.request_timeout_secs {
            endpoint.request_timeout_secs = v.max(1);
        }

        {
            let snap = self.snapshot();
            if snap.endpoints.values().any(|e| {
                e.endpoint.id != id
                    && e.endpoint.name == endpoint.name
                    && e.endpoint.base_url == endpoint.base_url
            }) {
                return Err(RegistryError::DuplicateBaseUrl(endpoint.name.clone()));
            }
        }

        sqlx::query(
            "UPDATE endpoints SET name = ?, base_url = ?, dialect = ?, api_key_sealed = ?, \
             probe_interval_secs = ?, max_in_flight = ?, request_timeout_secs = ? WHERE id = ?",
        )
        .bind(&endpoint.name)
        .bind(&endpoint.base_url)
        .bind(endpoint.dialect.as_str())
        .bind(&endpoint.api_key_sealed)
        .bind(endpoint.probe_interval_secs as i64)
        .bind(endpoint.max_in_flight as i64)
        .bind(endpoint.request_timeout_secs as i64)
        .bind(id)
        .execute(&self.db)
        .await?;

        let models = entry.models.clone();
        let in_flight = Arc::clone(&entry.in_flight);
        let updated = endpoint.clone();
        self.mutate(move |snap| {
            snap.endpoints.insert(
                updated.id.clone(),
                Arc::new(EndpointEntry {
                    endpoint: updated,
                    models,
                    in_flight,
                }),
            );
        });
        Ok(endpoint)
    }

    /// Removes the endpoint, its models, and token-usage references in one
    /// durable transaction.
    pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let _w = self.writer.lock().await;
        if self.get(id).is_none() {
            return Err(RegistryError::NotFound(id.to_string()));
        }

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM endpoint_models WHERE endpoint_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM token_usage_daily WHERE endpoint_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM endpoints WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.mutate(|snap| {
            snap.endpoints.remove(id);
        });
        Ok(())
    }

    /// Status transition per the supervisor state machine.
    pub async fn set_status(
        &self,
        id: &str,
        status: EndpointStatus,
        latency_ms: Option<u32>,
        last_error: Option<String>,
    ) -> Result<(), RegistryError> {
        let _w = self.writer.lock().await;
        let entry = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let from = entry.endpoint.status;
        if !transition_allowed(from, status) {
            return Err(RegistryError::ConflictingStatus { from, to: status });
        }

        let mut endpoint = entry.endpoint.clone();
        endpoint.status = status;
        endpoint.last_error = last_error.clone();
        if let Some(lat) = latency_ms {
            endpoint.latency_ms = Some(lat);
            endpoint.last_seen = Some(Utc::now());
        }
        match status {
            EndpointStatus::Online => {
                endpoint.error_count = endpoint.error_count.saturating_sub(1);
            }
            EndpointStatus::Error | EndpointStatus::Offline => {
                endpoint.error_count = endpoint.error_count.saturating_add(1);
            }
            EndpointStatus::Pending => {}
        }

        sqlx::query(
            "UPDATE endpoints SET status = ?, latency_ms = ?, error_count = ?, last_error = ?, last_seen = ? \
             WHERE id = ?",
        )
        .bind(endpoint.status.as_str())
        .bind(endpoint.latency_ms.map(|v| v as i64))
        .bind(endpoint.error_count as i64)
        .bind(&endpoint.last_error)
        .bind(endpoint.last_seen.map(|t| t.to_rfc3339()))
        .bind(id)
        .execute(&self.db)
        .await?;

        let models = entry.models.clone();
        let in_flight = Arc::clone(&entry.in_flight);
        self.mutate(move |snap| {
            snap.endpoints.insert(
                endpoint.id.clone(),
                Arc::new(EndpointEntry {
                    endpoint,
                    models,
                    in_flight,
                }),
            );
        });
        Ok(())
    }

    /// Replace the model list after a sync. Exclusion flags and last errors
    /// persist for models that survive the sync.
    pub async fn set_models(
        &self,
        id: &str,
        detected: Vec<EndpointModel>,
    ) -> Result<(), RegistryError> {
        let _w = self.writer.lock().await;
        let entry = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let merged: Vec<EndpointModel> = detected
            .into_iter()
            .map(|mut m| {
                if let Some(old) = entry.model(&m.model_id) {
                    m.excluded = old.excluded;
                    m.last_error = old.last_error.clone();
                    m.last_used = old.last_used;
                }
                m
            })
            .collect();

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM endpoint_models WHERE endpoint_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for m in &merged {
            sqlx::query(
                "INSERT INTO endpoint_models \
                 (endpoint_id, model_id, supported_apis, excluded, last_error, last_used) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&m.model_id)
            .bind(apis_json(&m.supported_apis))
            .bind(m.excluded)
            .bind(&m.last_error)
            .bind(m.last_used.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut endpoint = entry.endpoint.clone();
        endpoint.model_count = merged.len();
        // Detection owns the endpoint-level API surface; widen it only if a
        // model claims an API the endpoint had not reported yet.
        for api in union_apis(&merged) {
            if !endpoint.supported_apis.contains(&api) {
                endpoint.supported_apis.push(api);
            }
        }
        let in_flight = Arc::clone(&entry.in_flight);
        self.mutate(move |snap| {
            snap.endpoints.insert(
                endpoint.id.clone(),
                Arc::new(EndpointEntry {
                    endpoint,
                    models: merged,
                    in_flight,
                }),
            );
        });
        Ok(())
    }

    /// Flip the exclusion flag for one (endpoint, model) pair.
    pub async fn set_excluded(
        &self,
        endpoint_id: &str,
        model_id: &str,
        excluded: bool,
        reason: Option<String>,
    ) -> Result<(), RegistryError> {
        let _w = self.writer.lock().await;
        let entry = self
            .get(endpoint_id)
            .ok_or_else(|| RegistryError::NotFound(endpoint_id.to_string()))?;
        if entry.model(model_id).is_none() {
            return Err(RegistryError::NotFound(format!("{endpoint_id}/{model_id}")));
        }

        sqlx::query(
            "UPDATE endpoint_models SET excluded = ?, last_error = ? \
             WHERE endpoint_id = ? AND model_id = ?",
        )
        .bind(excluded)
        .bind(&reason)
        .bind(endpoint_id)
        .bind(model_id)
        .execute(&self.db)
        .await?;

        let mut models = entry.models.clone();
        if let Some(m) = models.iter_mut().find(|m| m.model_id == model_id) {
            m.excluded = excluded;
            m.last_error = reason;
        }
        let endpoint = entry.endpoint.clone();
        let in_flight = Arc::clone(&entry.in_flight);
        self.mutate(move |snap| {
            snap.endpoints.insert(
                endpoint.id.clone(),
                Arc::new(EndpointEntry {
                    endpoint,
                    models,
                    in_flight,
                }),
            );
        });
        Ok(())
    }

    /// Record the detected dialect and API surface after a detection probe.
    pub async fn set_detection(
        &self,
        id: &str,
        dialect: Dialect,
        supported_apis: Vec<ApiFamily>,
        latency_ms: u32,
    ) -> Result<(), RegistryError> {
        let _w = self.writer.lock().await;
        let entry = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let mut endpoint = entry.endpoint.clone();
        endpoint.dialect = dialect;
        endpoint.supported_apis = supported_apis;
        endpoint.latency_ms = Some(latency_ms);
        endpoint.last_seen = Some(Utc::now());

        sqlx::query(
            "UPDATE endpoints SET dialect = ?, supported_apis = ?, latency_ms = ?, last_seen = ? \
             WHERE id = ?",
        )
        .bind(endpoint.dialect.as_str())
        .bind(apis_json(&endpoint.supported_apis))
        .bind(endpoint.latency_ms.map(|v| v as i64))
        .bind(endpoint.last_seen.map(|t| t.to_rfc3339()))
        .bind(id)
        .execute(&self.db)
        .await?;

        let models = entry.models.clone();
        let in_flight = Arc::clone(&entry.in_flight);
        self.mutate(move |snap| {
            snap.endpoints.insert(
                endpoint.id.clone(),
                Arc::new(EndpointEntry {
                    endpoint,
                    models,
                    in_flight,
                }),
            );
        });
        Ok(())
    }

    /// Stamp last_used on the routed model. Snapshot-only; the store copy is
    /// refreshed on the next sync.
    pub async fn touch_model(&self, endpoint_id: &str, model_id: &str) {
        let _w = self.writer.lock().await;
        let Some(entry) = self.get(endpoint_id) else {
            return;
        };
        let mut models = entry.models.clone();
        if let Some(m) = models.iter_mut().find(|m| m.model_id == model_id) {
            m.last_used = Some(Utc::now());
        }
        let endpoint = entry.endpoint.clone();
        let in_flight = Arc::clone(&entry.in_flight);
        self.mutate(move |snap| {
            snap.endpoints.insert(
                endpoint.id.clone(),
                Arc::new(EndpointEntry {
                    endpoint,
                    models,
                    in_flight,
                }),
            );
        });
    }

    /// Clone-mutate-swap. The writer lock is held by every caller, so the
    /// read-modify-write cannot interleave.
    fn mutate(&self, f: impl FnOnce(&mut RegistrySnapshot)) {
        let current = self.snapshot();
        let mut next = RegistrySnapshot {
            endpoints: current.endpoints.clone(),
            index: HashMap::new(),
        };
        f(&mut next);
        next.rebuild_index();
        *self.snapshot.write().expect("registry snapshot lock") = Arc::new(next);
    }
}

fn transition_allowed(from: EndpointStatus, to: EndpointStatus) -> bool {
    use EndpointStatus::*;
    match (from, to) {
        (_, Error) => true,
        (Pending, Online) => true,
        (Online, Offline) | (Offline, Online) => true,
        (Error, Online) => true,
        (s, t) if s == t => true,
        _ => false,
    }
}

fn validate_base_url(raw: &str) -> Result<String, RegistryError> {
    let parsed = Url::parse(raw).map_err(|_| RegistryError::InvalidUrl(raw.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(RegistryError::InvalidUrl(raw.to_string()));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn apis_json(apis: &[ApiFamily]) -> String {
    serde_json::to_string(apis).unwrap_or_else(|_| "[]".to_string())
}

fn union_apis(models: &[EndpointModel]) -> Vec<ApiFamily> {
    let mut out = Vec::new();
    for m in models {
        for api in &m.supported_apis {
            if !out.contains(api) {
                out.push(*api);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct EndpointRow {
    id: String,
    name: String,
    base_url: String,
    dialect: String,
    supported_apis: String,
    status: String,
    api_key_sealed: Option<String>,
    latency_ms: Option<i64>,
    error_count: i64,
    last_error: Option<String>,
    last_seen: Option<String>,
    probe_interval_secs: i64,
    max_in_flight: i64,
    request_timeout_secs: i64,
    registered_at: String,
}

impl EndpointRow {
    fn into_endpoint(self) -> Endpoint {
        Endpoint {
            id: self.id,
            name: self.name,
            base_url: self.base_url,
            dialect: Dialect::parse(&self.dialect),
            supported_apis: serde_json::from_str(&self.supported_apis).unwrap_or_default(),
            status: EndpointStatus::parse(&self.status),
            latency_ms: self.latency_ms.map(|v| v as u32),
            model_count: 0,
            error_count: self.error_count as u32,
            last_error: self.last_error,
            last_seen: parse_ts(self.last_seen.as_deref()),
            registered_at: parse_ts(Some(&self.registered_at)).unwrap_or_else(Utc::now),
            probe_interval_secs: self.probe_interval_secs as u32,
            max_in_flight: self.max_in_flight as u32,
            request_timeout_secs: self.request_timeout_secs as u32,
            api_key_sealed: self.api_key_sealed,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ModelRow {
    #[allow(dead_code)]
    endpoint_id: String,
    model_id: String,
    supported_apis: String,
    excluded: bool,
    last_error: Option<String>,
    last_used: Option<String>,
}

impl ModelRow {
    fn into_model(self) -> EndpointModel {
        EndpointModel {
            model_id: self.model_id,
            supported_apis: serde_json::from_str(&self.supported_apis).unwrap_or_default(),
            excluded: self.excluded,
            last_error: self.last_error,
            last_used: parse_ts(self.last_used.as_deref()),
        }
    }
}

fn parse_ts(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn spec(name: &str, url: &str) -> CreateEndpointRequest {
        CreateEndpointRequest {
            name: name.to_string(),
            base_url: url.to_string(),
            dialect: None,
            api_key: None,
            probe_interval_secs: None,
            max_in_flight: None,
            request_timeout_secs: None,
        }
    }

    async fn registry() -> Registry {
        let pool = db::connect_in_memory().await.unwrap();
        Registry::load(pool).await.unwrap()
    }

    #[tokio::test]
    async fn add_rejects_invalid_and_duplicate_urls() {
        let reg = registry().await;
        let defaults = (15, 64, 120);

        assert!(matches!(
            reg.add(&spec("a", "ftp://x"), None, defaults).await,
            Err(RegistryError::InvalidUrl(_))
        ));
        assert!(matches!(
            reg.add(&spec("a", "not a url"), None, defaults).await,
            Err(RegistryError::InvalidUrl(_))
        ));

        reg.add(&spec("a", "http://host:9001"), None, defaults)
            .await
            .unwrap();
        assert!(matches!(
            reg.add(&spec("a", "http://host:9001"), None, defaults).await,
            Err(RegistryError::DuplicateBaseUrl(_))
        ));
        // Same URL under another name scope is allowed.
        reg.add(&spec("b", "http://host:9001"), None, defaults)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn index_serves_online_non_excluded_models() {
        let reg = registry().await;
        let ep = reg
            .add(&spec("a", "http://host:9001"), None, (15, 64, 120))
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

        // pending endpoint — not routable yet
        assert!(reg
            .snapshot()
            .models_for_request("mock-a", ApiFamily::ChatCompletions)
            .is_empty());

        reg.set_status(&ep.id, EndpointStatus::Online, Some(12), None)
            .await
            .unwrap();
        let candidates = reg
            .snapshot()
            .models_for_request("mock-a", ApiFamily::ChatCompletions);
        assert_eq!(candidates.len(), 1);

        // capability filter
        assert!(reg
            .snapshot()
            .models_for_request("mock-a", ApiFamily::Embeddings)
            .is_empty());

        // exclusion removes from routing but keeps the model known
        reg.set_excluded(&ep.id, "mock-a", true, Some("boom".into()))
            .await
            .unwrap();
        assert!(reg
            .snapshot()
            .models_for_request("mock-a", ApiFamily::ChatCompletions)
            .is_empty());
        assert!(reg.snapshot().model_known("mock-a"));
    }

    #[tokio::test]
    async fn exclusion_persists_across_sync() {
        let reg = registry().await;
        let ep = reg
            .add(&spec("a", "http://host:9001"), None, (15, 64, 120))
            .await
            .unwrap();
        reg.set_models(
            &ep.id,
            vec![EndpointModel::new("m1", vec![ApiFamily::ChatCompletions])],
        )
        .await
        .unwrap();
        reg.set_excluded(&ep.id, "m1", true, Some("oops".into()))
            .await
            .unwrap();

        // re-sync with the same model plus one new
        reg.set_models(
            &ep.id,
            vec![
                EndpointModel::new("m1", vec![ApiFamily::ChatCompletions]),
                EndpointModel::new("m2", vec![ApiFamily::Embeddings]),
            ],
        )
        .await
        .unwrap();

        let entry = reg.get(&ep.id).unwrap();
        assert!(entry.model("m1").unwrap().excluded);
        assert!(!entry.model("m2").unwrap().excluded);
        assert_eq!(entry.endpoint.model_count, 2);
    }

    #[tokio::test]
    async fn delete_restores_pre_add_state() {
        let reg = registry().await;
        let before = reg.snapshot().endpoints.len();
        let ep = reg
            .add(&spec("a", "http://host:9001"), None, (15, 64, 120))
            .await
            .unwrap();
        reg.set_models(
            &ep.id,
            vec![EndpointModel::new("m1", vec![ApiFamily::ChatCompletions])],
        )
        .await
        .unwrap();

        reg.delete(&ep.id).await.unwrap();
        assert_eq!(reg.snapshot().endpoints.len(), before);
        assert!(!reg.snapshot().model_known("m1"));
        assert!(matches!(
            reg.delete(&ep.id).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn status_transitions_follow_state_machine() {
        let reg = registry().await;
        let ep = reg
            .add(&spec("a", "http://host:9001"), None, (15, 64, 120))
            .await
            .unwrap();

        // pending -> offline is not a legal transition
        assert!(matches!(
            reg.set_status(&ep.id, EndpointStatus::Offline, None, None).await,
            Err(RegistryError::ConflictingStatus { .. })
        ));

        reg.set_status(&ep.id, EndpointStatus::Online, Some(10), None)
            .await
            .unwrap();
        reg.set_status(&ep.id, EndpointStatus::Offline, None, Some("timeout".into()))
            .await
            .unwrap();
        reg.set_status(&ep.id, EndpointStatus::Online, Some(9), None)
            .await
            .unwrap();
        reg.set_status(&ep.id, EndpointStatus::Error, None, Some("401".into()))
            .await
            .unwrap();
        reg.set_status(&ep.id, EndpointStatus::Online, Some(8), None)
            .await
            .unwrap();
    }
}
