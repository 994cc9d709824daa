//! The Session Lifecycle Monitor (§4.5): reconciles session `state` with
//! container reality and auto-archives idle sessions, on an adaptive cadence
//! that polls `initializing` sessions far more often than `ready` ones.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orc_store::{ArchiveReason, Session, SessionState, SessionStore};
use tracing::info;
use uuid::Uuid;

use crate::container::{ContainerError, ContainerManager, ContainerState};

pub struct MonitorConfig {
    pub initializing_interval_seconds: u64,
    pub ready_interval_seconds: u64,
    pub idle_timeout_minutes: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { initializing_interval_seconds: 5, ready_interval_seconds: 60, idle_timeout_minutes: 60 }
    }
}

/// Tracks the last reconciliation time per session so the adaptive cadence
/// in §4.5 can be evaluated without a dedicated scheduler per session.
#[derive(Default)]
pub struct LastChecked {
    at: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl LastChecked {
    pub fn new() -> Self {
        Self::default()
    }

    fn due(&self, session_id: Uuid, interval_seconds: u64, now: DateTime<Utc>) -> bool {
        let map = self.at.lock().unwrap();
        match map.get(&session_id) {
            Some(last) => now.signed_duration_since(*last) >= ChronoDuration::seconds(interval_seconds as i64),
            None => true,
        }
    }

    fn mark(&self, session_id: Uuid, now: DateTime<Utc>) {
        self.at.lock().unwrap().insert(session_id, now);
    }
}

pub struct SessionMonitor<S, C> {
    sessions: S,
    containers: C,
    config: MonitorConfig,
    last_checked: LastChecked,
}

impl<S, C> SessionMonitor<S, C>
where
    S: SessionStore,
    C: ContainerManager,
{
    pub fn new(sessions: S, containers: C, config: MonitorConfig) -> Self {
        Self { sessions, containers, config, last_checked: LastChecked::new() }
    }

    /// One reconciliation pass over every non-archived session, per §4.5.
    /// Returns the ids of sessions it mutated, for callers that log.
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Uuid>> {
        let mut touched = Vec::new();
        for session in self.sessions.list_non_archived().await? {
            let interval = match session.state {
                SessionState::Initializing | SessionState::Authenticating => self.config.initializing_interval_seconds,
                _ => self.config.ready_interval_seconds,
            };
            if !self.last_checked.due(session.id, interval, now) {
                continue;
            }
            self.last_checked.mark(session.id, now);

            let session_id = session.id;
            if self.reconcile_session(session, now).await? {
                touched.push(session_id);
            }
        }
        Ok(touched)
    }

    async fn reconcile_session(&self, mut session: Session, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let Some(container_id) = session.container_id.clone() else {
            return Ok(false);
        };

        let info = match self.containers.inspect(&container_id).await {
            Ok(info) => info,
            Err(ContainerError::NotFound(_)) => {
                session.state = SessionState::Destroyed;
                session.is_archived = true;
                self.sessions.update(&session).await?;
                info!(session_id = %session.id, %container_id, "container vanished, session marked destroyed");
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };

        if info.state == ContainerState::Exited
            && !matches!(session.state, SessionState::Destroying | SessionState::Destroyed)
        {
            session.state = SessionState::Destroyed;
            session.is_archived = true;
            self.sessions.update(&session).await?;
            info!(session_id = %session.id, %container_id, "container exited, session marked destroyed");
            return Ok(true);
        }

        if session.state == SessionState::Initializing && info.state == ContainerState::Running {
            if let Some(ip) = &session.container_ip {
                let health = self.containers.health(ip).await?;
                if health.healthy {
                    session.state = SessionState::Ready;
                    self.sessions.update(&session).await?;
                    info!(session_id = %session.id, %container_id, "session became ready");
                    return Ok(true);
                }
            }
        }

        if session.state == SessionState::Ready {
            let idle_since = session.last_job_time.unwrap_or(session.updated_at);
            if now.signed_duration_since(idle_since) >= ChronoDuration::minutes(self.config.idle_timeout_minutes) {
                session.is_archived = true;
                session.archive_reason = Some(ArchiveReason::AutoCleanup);
                self.containers.stop(&container_id, 1).await?;
                self.sessions.update(&session).await?;
                info!(session_id = %session.id, %container_id, idle_minutes = self.config.idle_timeout_minutes, "auto-archived idle session");
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{FakeContainerManager, LaunchSpec};
    use orc_store::memory::MemoryStore;
    use orc_store::{ClientType, Target, TargetType, VpnType};

    fn target() -> Target {
        Target {
            id: Uuid::new_v4(),
            name: "t".to_string(),
            r#type: "vnc".to_string(),
            host: "10.0.0.5".to_string(),
            port: None,
            username: None,
            password: "x".to_string(),
            vpn_config: None,
            vpn_username: None,
            vpn_password: None,
            width: 1024,
            height: 768,
            rdp_params: None,
            is_archived: false,
        }
    }

    #[tokio::test]
    async fn initializing_session_becomes_ready_once_healthy() {
        let store = MemoryStore::new();
        let containers = FakeContainerManager::new();
        let target = target();
        assert_eq!(target.target_type().unwrap(), TargetType { client: ClientType::Vnc, vpn: VpnType::None });
        store.insert_target(target.clone());

        let session = store.create_initializing(target.id).await.unwrap();
        let spec = LaunchSpec::for_target(&target, "img", "sess").unwrap();
        let container_id = containers.launch(spec).await.unwrap();
        let ip = containers.get_ip(&container_id).await.unwrap();

        let mut session = session;
        let session_id = session.id;
        session.container_id = Some(container_id);
        session.container_ip = ip;
        store.update(&session).await.unwrap();

        let monitor = SessionMonitor::new(store, containers, MonitorConfig::default());
        monitor.reconcile_once(Utc::now()).await.unwrap();

        let updated = monitor.sessions.get(session_id).await.unwrap().unwrap();
        assert_eq!(updated.state, SessionState::Ready);
    }

    #[tokio::test]
    async fn exited_container_archives_the_session() {
        let store = MemoryStore::new();
        let containers = FakeContainerManager::new();
        let target = target();
        store.insert_target(target.clone());

        let session = store.create_initializing(target.id).await.unwrap();
        let spec = LaunchSpec::for_target(&target, "img", "sess").unwrap();
        let container_id = containers.launch(spec).await.unwrap();

        let mut session = session;
        let session_id = session.id;
        session.container_id = Some(container_id.clone());
        session.state = SessionState::Ready;
        store.update(&session).await.unwrap();
        containers.kill(&container_id);

        let monitor = SessionMonitor::new(store, containers, MonitorConfig::default());
        monitor.reconcile_once(Utc::now()).await.unwrap();

        let updated = monitor.sessions.get(session_id).await.unwrap().unwrap();
        assert_eq!(updated.state, SessionState::Destroyed);
        assert!(updated.is_archived);
    }

    #[tokio::test]
    async fn idle_ready_session_past_timeout_is_archived() {
        let store = MemoryStore::new();
        let containers = FakeContainerManager::new();
        let target = target();
        store.insert_target(target.clone());

        let session = store.create_initializing(target.id).await.unwrap();
        let spec = LaunchSpec::for_target(&target, "img", "sess").unwrap();
        let container_id = containers.launch(spec).await.unwrap();

        let mut session = session;
        let session_id = session.id;
        session.container_id = Some(container_id);
        session.state = SessionState::Ready;
        session.last_job_time = Some(Utc::now() - ChronoDuration::minutes(120));
        store.update(&session).await.unwrap();

        let monitor = SessionMonitor::new(store, containers, MonitorConfig { idle_timeout_minutes: 60, ..Default::default() });
        monitor.reconcile_once(Utc::now()).await.unwrap();

        let updated = monitor.sessions.get(session_id).await.unwrap().unwrap();
        assert!(updated.is_archived);
        assert_eq!(updated.archive_reason, Some(ArchiveReason::AutoCleanup));
    }
}
