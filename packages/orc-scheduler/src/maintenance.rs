//! The Maintenance Leader (§4.8): a singleton, elected via
//! `AdvisoryLocks::try_become_maintenance_leader`, that runs the three
//! background tasks no other process may run concurrently — stale-lease
//! expiry, daily log pruning, and the session lifecycle monitor.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use orc_store::{JobStore, LogStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::service::Service;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub stale_lease_sweep_interval: Duration,
    pub log_retention_days: i64,
    /// Tick cadence for the session monitor's `reconcile_once`; the monitor's
    /// own `LastChecked` bookkeeping enforces the coarser per-session cadence
    /// from §4.5, so this only needs to be at least as fine as the shortest
    /// of the two (`initializing`, 5s by default).
    pub session_monitor_tick_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { stale_lease_sweep_interval: Duration::from_secs(30), log_retention_days: 30, session_monitor_tick_interval: Duration::from_secs(5) }
    }
}

/// Decouples [`MaintenanceLeader`] from `orc-session::SessionMonitor`'s
/// generic parameters the same way `processor::SessionProvisioner` decouples
/// from `orc-session::Provisioner`'s.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile_once(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Uuid>>;
}

#[async_trait]
impl<S, C> Reconciler for orc_session::SessionMonitor<S, C>
where
    S: orc_store::SessionStore,
    C: orc_session::ContainerManager,
{
    async fn reconcile_once(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Uuid>> {
        self.reconcile_once(now).await
    }
}

pub struct MaintenanceLeader {
    jobs: std::sync::Arc<dyn JobStore>,
    logs: std::sync::Arc<dyn LogStore>,
    reconciler: std::sync::Arc<dyn Reconciler>,
    config: MaintenanceConfig,
}

impl MaintenanceLeader {
    pub fn new(
        jobs: std::sync::Arc<dyn JobStore>,
        logs: std::sync::Arc<dyn LogStore>,
        reconciler: std::sync::Arc<dyn Reconciler>,
        config: MaintenanceConfig,
    ) -> Self {
        Self { jobs, logs, reconciler, config }
    }

    async fn stale_lease_sweep(jobs: std::sync::Arc<dyn JobStore>, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match jobs.expire_stale_leases().await {
                Ok(expired) if !expired.is_empty() => info!(count = expired.len(), "expired stale leases"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "stale lease sweep failed"),
            }
        }
    }

    async fn log_pruning(logs: std::sync::Arc<dyn LogStore>, retention_days: i64, shutdown: CancellationToken) {
        loop {
            let sleep_for = duration_until_next_midnight_utc(Utc::now());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            let cutoff = Utc::now() - ChronoDuration::days(retention_days);
            match logs.prune_older_than(cutoff).await {
                Ok(pruned) => info!(pruned, cutoff = %cutoff, "pruned old job logs"),
                Err(e) => error!(error = %e, "log pruning failed"),
            }
        }
    }

    async fn session_monitor(reconciler: std::sync::Arc<dyn Reconciler>, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = reconciler.reconcile_once(Utc::now()).await {
                error!(error = %e, "session monitor reconciliation failed");
            }
        }
    }
}

#[async_trait]
impl Service for MaintenanceLeader {
    fn name(&self) -> &'static str {
        "maintenance-leader"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("maintenance leader starting its background tasks");

        let lease_task = tokio::spawn(Self::stale_lease_sweep(self.jobs.clone(), self.config.stale_lease_sweep_interval, shutdown.clone()));
        let log_task = tokio::spawn(Self::log_pruning(self.logs.clone(), self.config.log_retention_days, shutdown.clone()));
        let monitor_task = tokio::spawn(Self::session_monitor(self.reconciler.clone(), self.config.session_monitor_tick_interval, shutdown.clone()));

        let _ = tokio::join!(lease_task, log_task, monitor_task);

        info!("maintenance leader stopped");
        Ok(())
    }
}

/// How long until the next UTC midnight, for the daily log-pruning cadence.
fn duration_until_next_midnight_utc(now: DateTime<Utc>) -> Duration {
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
    let next_midnight = if now.time() < midnight {
        now.date_naive().and_time(midnight)
    } else {
        (now.date_naive() + ChronoDuration::days(1)).and_time(midnight)
    };
    let next_midnight_utc = DateTime::<Utc>::from_naive_utc_and_offset(next_midnight, Utc);
    (next_midnight_utc - now).to_std().unwrap_or(Duration::from_secs(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midnight_rollover_lands_just_after_23_59_59() {
        let now = "2026-08-01T23:59:59Z".parse::<DateTime<Utc>>().unwrap();
        let sleep_for = duration_until_next_midnight_utc(now);
        assert_eq!(sleep_for, Duration::from_secs(1));
    }

    #[test]
    fn midday_waits_the_rest_of_the_day() {
        let now = "2026-08-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let sleep_for = duration_until_next_midnight_utc(now);
        assert_eq!(sleep_for, Duration::from_secs(12 * 3600));
    }

    #[test]
    fn default_config_matches_the_documented_defaults() {
        let config = MaintenanceConfig::default();
        assert_eq!(config.log_retention_days, 30);
        assert_eq!(config.stale_lease_sweep_interval, Duration::from_secs(30));
    }
}
