// llmlb — application state
//
// Everything a handler needs, Clone-friendly: pools and Arcs only.

use std::sync::Arc;
use std::time::Instant;

use sqlx::SqlitePool;
use tokio::sync::{Notify, RwLock};

use crate::audit::AuditLog;
use crate::auth::KeyRateLimiter;
use crate::balancer::Balancer;
use crate::config::Config;
use crate::gate::InferenceGate;
use crate::history::{HistoryRing, TokenStats};
use crate::logs::LogBuffer;
use crate::proxy::FailureTracker;
use crate::registry::Registry;
use crate::secrets::SecretBox;
use crate::system_monitor::SystemSnapshot;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub balancer: Arc<Balancer>,
    pub gate: Arc<InferenceGate>,
    pub history: Arc<HistoryRing>,
    pub token_stats: TokenStats,
    pub audit: AuditLog,
    pub secrets: SecretBox,
    pub failures: Arc<FailureTracker>,
    pub key_limiter: Arc<KeyRateLimiter>,
    pub client: reqwest::Client,
    pub start_time: Instant,
    pub system_monitor: Arc<RwLock<SystemSnapshot>>,
    pub log_buffer: Arc<LogBuffer>,
    /// Signalled by the update coordinator to trigger graceful shutdown.
    pub shutdown: Arc<Notify>,
    /// DashboardSettings snapshot taken at startup.
    pub record_bodies: bool,
    pub body_cap_bytes: usize,
}

impl AppState {
    pub async fn new(
        db: SqlitePool,
        config: Arc<Config>,
        log_buffer: Arc<LogBuffer>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::load(db.clone()).await?);
        let balancer = Arc::new(Balancer::new(Arc::clone(&registry), Arc::clone(&config)));

        let (history_capacity, record_bodies, body_cap_bytes): (i64, bool, i64) =
            sqlx::query_as(
                "SELECT history_capacity, record_bodies, body_cap_bytes \
                 FROM dashboard_settings WHERE id = 1",
            )
            .fetch_optional(&db)
            .await?
            .unwrap_or((10_000, true, 65_536));

        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("reqwest client");

        Ok(Self {
            registry,
            balancer,
            gate: InferenceGate::new(),
            history: Arc::new(HistoryRing::new(history_capacity.max(1) as usize)),
            token_stats: TokenStats::new(db.clone()),
            audit: AuditLog::new(db.clone()),
            secrets: SecretBox::from_secret(&config.jwt_secret),
            failures: Arc::new(FailureTracker::new(
                config.exclusion_failures,
                config.exclusion_window,
            )),
            key_limiter: Arc::new(KeyRateLimiter::new(
                config.key_rate_per_minute,
                config.key_rate_burst,
            )),
            client,
            start_time: Instant::now(),
            system_monitor: Arc::new(RwLock::new(SystemSnapshot::default())),
            log_buffer,
            shutdown: Arc::new(Notify::new()),
            record_bodies,
            body_cap_bytes: body_cap_bytes.max(0) as usize,
            db,
            config,
        })
    }
}
