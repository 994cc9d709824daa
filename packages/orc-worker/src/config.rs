//! Process configuration (§4.9), loaded once at startup and threaded through
//! every other component by construction.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub lease_seconds: i64,
    pub lease_renew_interval_seconds: u64,
    pub scheduler_poll_interval_ms: u64,
    pub stale_lease_sweep_interval_seconds: u64,
    pub session_monitor_initializing_interval_seconds: u64,
    pub session_monitor_ready_interval_seconds: u64,
    pub session_idle_timeout_minutes: i64,
    pub log_retention_days: i64,
    pub default_token_limit: i64,
    pub only_n_most_recent_images: usize,
    pub min_removal_threshold: usize,
    pub log_level: String,
    /// Not named in §4.9's field list, but required for `main` to actually
    /// construct a `Provisioner`/`LoopRunner`: the sandbox image every new
    /// session is launched from, the default VLM model, and how often the
    /// tenant set is re-scanned for newly-added tenants (§4.11).
    pub sandbox_image: String,
    pub default_model: String,
    pub tenant_rescan_interval_seconds: u64,
    /// Baked into the shared `computer` tool at registry construction time;
    /// real per-target dimensions aren't threaded through the tool registry
    /// (§4.4's `ComputerTool` is built once per tenant, not once per job).
    pub default_screen_width: u32,
    pub default_screen_height: u32,
}

fn default_worker_id() -> String {
    let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    format!("{hostname}-{}", std::process::id())
}

impl Config {
    /// Loads from the environment (optionally via a `.env` file in
    /// development). Malformed numeric vars are a startup error, never a
    /// silently-ignored default.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_id: env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id()),
            lease_seconds: env::var("LEASE_SECONDS").unwrap_or_else(|_| "120".to_string()).parse().context("LEASE_SECONDS must be a valid number")?,
            lease_renew_interval_seconds: env::var("LEASE_RENEW_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("LEASE_RENEW_INTERVAL_SECONDS must be a valid number")?,
            scheduler_poll_interval_ms: env::var("SCHEDULER_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .context("SCHEDULER_POLL_INTERVAL_MS must be a valid number")?,
            stale_lease_sweep_interval_seconds: env::var("STALE_LEASE_SWEEP_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("STALE_LEASE_SWEEP_INTERVAL_SECONDS must be a valid number")?,
            session_monitor_initializing_interval_seconds: env::var("SESSION_MONITOR_INITIALIZING_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("SESSION_MONITOR_INITIALIZING_INTERVAL_SECONDS must be a valid number")?,
            session_monitor_ready_interval_seconds: env::var("SESSION_MONITOR_READY_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("SESSION_MONITOR_READY_INTERVAL_SECONDS must be a valid number")?,
            session_idle_timeout_minutes: env::var("SESSION_IDLE_TIMEOUT_MINUTES")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("SESSION_IDLE_TIMEOUT_MINUTES must be a valid number")?,
            log_retention_days: env::var("LOG_RETENTION_DAYS").unwrap_or_else(|_| "30".to_string()).parse().context("LOG_RETENTION_DAYS must be a valid number")?,
            default_token_limit: env::var("DEFAULT_TOKEN_LIMIT")
                .unwrap_or_else(|_| "200000".to_string())
                .parse()
                .context("DEFAULT_TOKEN_LIMIT must be a valid number")?,
            only_n_most_recent_images: env::var("ONLY_N_MOST_RECENT_IMAGES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("ONLY_N_MOST_RECENT_IMAGES must be a valid number")?,
            min_removal_threshold: env::var("MIN_REMOVAL_THRESHOLD")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("MIN_REMOVAL_THRESHOLD must be a valid number")?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            sandbox_image: env::var("SANDBOX_IMAGE").unwrap_or_else(|_| "legacyuse/sandbox:latest".to_string()),
            default_model: env::var("DEFAULT_MODEL").unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            tenant_rescan_interval_seconds: env::var("TENANT_RESCAN_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("TENANT_RESCAN_INTERVAL_SECONDS must be a valid number")?,
            default_screen_width: env::var("DEFAULT_SCREEN_WIDTH").unwrap_or_else(|_| "1024".to_string()).parse().context("DEFAULT_SCREEN_WIDTH must be a valid number")?,
            default_screen_height: env::var("DEFAULT_SCREEN_HEIGHT").unwrap_or_else(|_| "768".to_string()).parse().context("DEFAULT_SCREEN_HEIGHT must be a valid number")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // `std::env` is process-global; serialize tests that mutate it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn fails_fast_without_database_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("DATABASE_URL");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn succeeds_with_only_database_url_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::remove_var("LEASE_SECONDS");
        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.lease_seconds, 120);
        assert_eq!(config.default_token_limit, 200_000);
        assert_eq!(config.log_level, "info");
        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn rejects_a_malformed_numeric_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("LEASE_SECONDS", "not-a-number");
        assert!(Config::from_env().is_err());
        env::remove_var("DATABASE_URL");
        env::remove_var("LEASE_SECONDS");
    }
}
