// llmlb — process configuration
//
// All tunables live here, read once from the environment at startup.
// The loaded Config is immutable for the process lifetime; changing a
// value requires a restart.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory holding llmlb.db and derived state. Defaults to ~/.llmlb.
    pub state_dir: PathBuf,
    /// Directory model files are synced into (passed through to nodes).
    pub models_dir: Option<PathBuf>,
    /// JWT signing secret. Ephemeral (random) when unset — dev mode only.
    pub jwt_secret: String,
    /// Whether jwt_secret came from the environment.
    pub jwt_secret_from_env: bool,
    pub log_dir: Option<PathBuf>,
    pub log_retention_days: u32,
    pub hf_token: Option<String>,

    // ── routing / proxy tunables ────────────────────────────────────
    pub probe_timeout: Duration,
    pub default_probe_interval: Duration,
    pub offline_after_failures: u32,
    pub default_max_in_flight: u32,
    pub admission_queue_cap: usize,
    pub admission_timeout: Duration,
    pub unary_timeout: Duration,
    pub sse_idle_timeout: Duration,
    pub multipart_cap_bytes: usize,
    pub exclusion_failures: u32,
    pub exclusion_window: Duration,
    pub exclusion_cooldown: Duration,
    pub drain_timeout: Duration,

    // ── per-key rate limit (token bucket) ───────────────────────────
    pub key_rate_per_minute: u32,
    pub key_rate_burst: u32,
}

impl Config {
    pub fn from_env() -> Self {
        let state_dir = std::env::var("LLMLB_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".llmlb")
            });

        let (jwt_secret, jwt_secret_from_env) = match std::env::var("LLMLB_JWT_SECRET") {
            Ok(s) if !s.is_empty() => (s, true),
            _ => (ephemeral_secret(), false),
        };

        Self {
            host: std::env::var("LLMLB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("LLMLB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            state_dir,
            models_dir: std::env::var("LLMLB_MODELS_DIR").ok().map(PathBuf::from),
            jwt_secret,
            jwt_secret_from_env,
            log_dir: std::env::var("LLM_LOG_DIR").ok().map(PathBuf::from),
            log_retention_days: std::env::var("LLM_LOG_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(14),
            hf_token: std::env::var("HF_TOKEN").ok().filter(|s| !s.is_empty()),

            probe_timeout: Duration::from_secs(5),
            default_probe_interval: Duration::from_secs(15),
            offline_after_failures: 3,
            default_max_in_flight: 64,
            admission_queue_cap: 256,
            admission_timeout: Duration::from_secs(30),
            unary_timeout: Duration::from_secs(120),
            sse_idle_timeout: Duration::from_secs(60),
            multipart_cap_bytes: 25 * 1024 * 1024,
            exclusion_failures: 3,
            exclusion_window: Duration::from_secs(300),
            exclusion_cooldown: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(30),

            key_rate_per_minute: 600,
            key_rate_burst: 60,
        }
    }

}

/// Random secret for dev runs without LLMLB_JWT_SECRET. Sessions do not
/// survive a restart in this mode.
fn ephemeral_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::from_env();
        assert_eq!(cfg.offline_after_failures, 3);
        assert_eq!(cfg.admission_queue_cap, 256);
        assert_eq!(cfg.admission_timeout, Duration::from_secs(30));
        assert_eq!(cfg.unary_timeout, Duration::from_secs(120));
        assert_eq!(cfg.drain_timeout, Duration::from_secs(30));
        assert_eq!(cfg.multipart_cap_bytes, 25 * 1024 * 1024);
    }

    #[test]
    fn ephemeral_secret_is_64_hex_chars() {
        let s = ephemeral_secret();
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
