//! The Session Provisioning Helper (§4.7): turns "this target has no ready
//! or initializing session" into a running sandbox, deduping concurrent
//! attempts for the same target within one process.

use std::sync::Arc;

use dashmap::DashSet;
use orc_store::{Session, SessionStore, Target, TargetStore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::container::{ContainerManager, LaunchSpec};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("target {0} not found")]
    TargetNotFound(Uuid),
    #[error("provisioning already in flight for target {0}")]
    AlreadyPending(Uuid),
    #[error(transparent)]
    Container(#[from] crate::container::ContainerError),
    #[error(transparent)]
    Store(#[from] orc_engine::StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Process-wide dedup set (§4.7's "pending sessions" set) so two scheduler
/// ticks racing on the same target don't both launch a sandbox.
pub struct Provisioner<T, S, C> {
    targets: T,
    sessions: S,
    containers: Arc<C>,
    image: String,
    pending: DashSet<Uuid>,
}

impl<T, S, C> Provisioner<T, S, C>
where
    T: TargetStore,
    S: SessionStore,
    C: ContainerManager,
{
    pub fn new(targets: T, sessions: S, containers: Arc<C>, image: impl Into<String>) -> Self {
        Self { targets, sessions, containers, image: image.into(), pending: DashSet::new() }
    }

    pub fn is_pending(&self, target_id: Uuid) -> bool {
        self.pending.contains(&target_id)
    }

    /// Provisions one session for `target_id`, per §4.7's four steps.
    /// Returns `Err(AlreadyPending)` without side effects if another caller
    /// in this process already claimed the dedup slot.
    pub async fn provision(&self, target_id: Uuid) -> Result<Session, ProvisionError> {
        if !self.pending.insert(target_id) {
            return Err(ProvisionError::AlreadyPending(target_id));
        }
        let result = self.provision_inner(target_id).await;
        self.pending.remove(&target_id);
        result
    }

    async fn provision_inner(&self, target_id: Uuid) -> Result<Session, ProvisionError> {
        let target: Target = self.targets.get(target_id).await?.ok_or(ProvisionError::TargetNotFound(target_id))?;

        let mut session = self.sessions.create_initializing(target_id).await?;

        let launch_result = self.launch(&target, session.id).await;
        match launch_result {
            Ok((container_id, container_ip)) => {
                session.container_id = Some(container_id);
                session.container_ip = container_ip;
                session.status = "running".to_string();
            }
            Err(e) => {
                session.status = "error".to_string();
                self.sessions.update(&session).await?;
                warn!(target_id = %target_id, session_id = %session.id, error = %e, "session provisioning failed");
                return Err(e);
            }
        }

        self.sessions.update(&session).await?;
        info!(target_id = %target_id, session_id = %session.id, container_id = session.container_id.as_deref().unwrap_or(""), "session provisioned");
        Ok(session)
    }

    /// The scheduler's pre-claim check (§4.1's tie-break): a `ready` session
    /// if one exists, a freshly provisioned one if neither `ready` nor
    /// `initializing` exists, or `None` while one is already warming up.
    pub async fn ensure_ready(&self, target_id: Uuid) -> Result<Option<Session>, ProvisionError> {
        if let Some(session) = self.sessions.find_ready_for_target(target_id).await? {
            return Ok(Some(session));
        }
        if self.sessions.has_initializing_for_target(target_id).await? || self.is_pending(target_id) {
            return Ok(None);
        }
        self.provision(target_id).await.map(Some)
    }

    async fn launch(&self, target: &Target, session_id: Uuid) -> Result<(String, Option<String>), ProvisionError> {
        let name = format!("orc-session-{session_id}");
        let spec = LaunchSpec::for_target(target, &self.image, name)?;
        let container_id = self.containers.launch(spec).await?;
        let ip = self.containers.get_ip(&container_id).await?;
        Ok((container_id, ip))
    }
}

/// Whether the scheduler should request a new session for `target_id`:
/// true iff no `ready` session exists and none is `initializing`, per the
/// claim predicate in §4.1.
pub async fn needs_provisioning<S: SessionStore>(sessions: &S, target_id: Uuid) -> Result<bool, orc_engine::StoreError> {
    let has_ready = sessions.find_ready_for_target(target_id).await?.is_some();
    let has_initializing = sessions.has_initializing_for_target(target_id).await?;
    Ok(!has_ready && !has_initializing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FakeContainerManager;
    use orc_store::memory::MemoryStore;
    use orc_store::ClientType;

    fn target(id: Uuid) -> Target {
        Target {
            id,
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
    async fn provisions_a_ready_session_with_container_ip() {
        let targets = MemoryStore::new();
        let target_id = Uuid::new_v4();
        targets.insert_target(target(target_id));
        let sessions = MemoryStore::new();
        let containers = Arc::new(FakeContainerManager::new());

        let provisioner = Provisioner::new(targets, sessions, containers, "sandbox:latest");
        let session = provisioner.provision(target_id).await.unwrap();

        assert_eq!(session.status, "running");
        assert!(session.container_id.is_some());
        assert!(session.container_ip.is_some());
        assert!(!provisioner.is_pending(target_id));
    }

    #[tokio::test]
    async fn unknown_target_fails_without_creating_a_session() {
        let targets = MemoryStore::new();
        let sessions = MemoryStore::new();
        let containers = Arc::new(FakeContainerManager::new());
        let provisioner = Provisioner::new(targets, sessions, containers, "sandbox:latest");

        let err = provisioner.provision(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::TargetNotFound(_)));
    }

    #[tokio::test]
    async fn pending_flag_blocks_a_second_concurrent_call() {
        let targets = MemoryStore::new();
        let target_id = Uuid::new_v4();
        targets.insert_target(target(target_id));
        let sessions = MemoryStore::new();
        let containers = Arc::new(FakeContainerManager::new());
        let provisioner = Provisioner::new(targets, sessions, containers, "sandbox:latest");

        provisioner.pending.insert(target_id);
        let err = provisioner.provision(target_id).await.unwrap_err();
        assert!(matches!(err, ProvisionError::AlreadyPending(_)));
    }

    #[test]
    fn target_type_assumption_holds_for_the_fixture() {
        let t = target(Uuid::new_v4());
        assert_eq!(t.target_type().unwrap().client, ClientType::Vnc);
    }

    #[tokio::test]
    async fn ensure_ready_provisions_when_nothing_exists_for_the_target() {
        let targets = MemoryStore::new();
        let target_id = Uuid::new_v4();
        targets.insert_target(target(target_id));
        let sessions = MemoryStore::new();
        let containers = Arc::new(FakeContainerManager::new());
        let provisioner = Provisioner::new(targets, sessions, containers, "sandbox:latest");

        let session = provisioner.ensure_ready(target_id).await.unwrap().unwrap();
        assert_eq!(session.status, "running");
    }

    #[tokio::test]
    async fn ensure_ready_reuses_an_existing_ready_session() {
        let targets = MemoryStore::new();
        let target_id = Uuid::new_v4();
        targets.insert_target(target(target_id));
        let sessions = MemoryStore::new();
        let mut existing = sessions.create_initializing(target_id).await.unwrap();
        existing.state = orc_store::SessionState::Ready;
        sessions.update(&existing).await.unwrap();
        let containers = Arc::new(FakeContainerManager::new());
        let provisioner = Provisioner::new(targets, sessions, containers, "sandbox:latest");

        let session = provisioner.ensure_ready(target_id).await.unwrap().unwrap();
        assert_eq!(session.id, existing.id);
    }

    #[tokio::test]
    async fn ensure_ready_yields_none_while_a_session_is_already_initializing() {
        let targets = MemoryStore::new();
        let target_id = Uuid::new_v4();
        targets.insert_target(target(target_id));
        let sessions = MemoryStore::new();
        sessions.create_initializing(target_id).await.unwrap();
        let containers = Arc::new(FakeContainerManager::new());
        let provisioner = Provisioner::new(targets, sessions, containers, "sandbox:latest");

        assert!(provisioner.ensure_ready(target_id).await.unwrap().is_none());
    }
}
