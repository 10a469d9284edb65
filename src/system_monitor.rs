// llmlb — system telemetry
//
// Background task refreshing a cached CPU/memory snapshot every 5 seconds
// for the dashboard overview and /api/metrics.

use std::sync::Arc;
use tokio::sync::RwLock;

/// Cached system statistics snapshot.
#[derive(Clone)]
pub struct SystemSnapshot {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub platform: String,
}

impl Default for SystemSnapshot {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            memory_used_mb: 0.0,
            memory_total_mb: 0.0,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Spawn the refresh task. sysinfo wants one warm-up refresh before CPU
/// numbers are meaningful.
pub fn spawn(snapshot: Arc<RwLock<SystemSnapshot>>) {
    tokio::spawn(async move {
        let mut sys = sysinfo::System::new_all();
        sys.refresh_cpu_all();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_all();

        loop {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;

            sys.refresh_cpu_all();
            let cpu = if sys.cpus().is_empty() {
                0.0
            } else {
                sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / sys.cpus().len() as f32
            };

            sys.refresh_memory();

            *snapshot.write().await = SystemSnapshot {
                cpu_usage_percent: cpu,
                memory_used_mb: sys.used_memory() as f64 / 1_048_576.0,
                memory_total_mb: sys.total_memory() as f64 / 1_048_576.0,
                platform: std::env::consts::OS.to_string(),
            };
        }
    });
}
