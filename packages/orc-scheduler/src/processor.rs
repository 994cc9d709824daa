//! The Per-Tenant Scheduler (§4.1): one long-lived claim loop per tenant
//! schema, each claimed job spawned onto the Sampling Loop without blocking
//! the loop's next `claim_next`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orc_loop::LoopRunner;
use orc_store::{JobStore, JobStatus, Session, Tenant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::service::Service;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_id: String,
    pub lease_seconds: i64,
    pub poll_interval: Duration,
    /// How often a spawned job task re-checks `SessionProvisioner::ensure_ready`
    /// while a target has no `ready` session yet (§4.7).
    pub session_poll_interval: Duration,
    /// Upper bound on those re-checks before the job is given up on as an error.
    pub session_poll_max_attempts: u32,
    /// How often a running job's lease is renewed while its Sampling Loop
    /// call is in flight (§4.1 "Lease safety").
    pub lease_renew_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            lease_seconds: 120,
            poll_interval: Duration::from_millis(500),
            session_poll_interval: Duration::from_secs(2),
            session_poll_max_attempts: 30,
            lease_renew_interval: Duration::from_secs(30),
        }
    }
}

/// Decouples [`TenantProcessor`] from `orc-session::Provisioner`'s generic
/// parameters: a local trait over a foreign generic type, blanket-implemented
/// below, is legal under the orphan rule and lets the processor hold a plain
/// `Arc<dyn SessionProvisioner>`.
#[async_trait]
pub trait SessionProvisioner: Send + Sync {
    async fn ensure_ready(&self, target_id: Uuid) -> anyhow::Result<Option<Session>>;
}

#[async_trait]
impl<T, S, C> SessionProvisioner for orc_session::Provisioner<T, S, C>
where
    T: orc_store::TargetStore,
    S: orc_store::SessionStore,
    C: orc_session::ContainerManager,
{
    async fn ensure_ready(&self, target_id: Uuid) -> anyhow::Result<Option<Session>> {
        self.ensure_ready(target_id).await.map_err(Into::into)
    }
}

/// One tenant's claim-and-dispatch loop. Owns no in-memory lock of its own —
/// target exclusivity is entirely a property of `JobStore::claim_next` — but
/// does track its own spawned job tasks so shutdown can wait on them.
pub struct TenantProcessor {
    tenant: Tenant,
    jobs: Arc<dyn JobStore>,
    provisioner: Arc<dyn SessionProvisioner>,
    loop_runner: Arc<LoopRunner>,
    config: SchedulerConfig,
    running: Arc<AsyncMutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl TenantProcessor {
    pub fn new(
        tenant: Tenant,
        jobs: Arc<dyn JobStore>,
        provisioner: Arc<dyn SessionProvisioner>,
        loop_runner: Arc<LoopRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self { tenant, jobs, provisioner, loop_runner, config, running: Arc::new(AsyncMutex::new(HashMap::new())) }
    }

    /// Binds a session to `job_id`, retrying `ensure_ready` up to
    /// `session_poll_max_attempts` times, then drives the Sampling Loop.
    /// Never returns `Err`: every outcome is written to the job row itself,
    /// per §7's propagation policy (loop failures never throw to the
    /// scheduler).
    async fn run_claimed_job(
        jobs: Arc<dyn JobStore>,
        provisioner: Arc<dyn SessionProvisioner>,
        loop_runner: Arc<LoopRunner>,
        config: SchedulerConfig,
        job_id: Uuid,
        target_id: Uuid,
    ) {
        let mut attempts = 0;
        let session = loop {
            match provisioner.ensure_ready(target_id).await {
                Ok(Some(session)) => break Some(session),
                Ok(None) => {
                    attempts += 1;
                    if attempts >= config.session_poll_max_attempts {
                        break None;
                    }
                    tokio::time::sleep(config.session_poll_interval).await;
                }
                Err(e) => {
                    error!(job_id = %job_id, target_id = %target_id, error = %e, "session provisioning failed");
                    let _ = jobs.terminate(job_id, JobStatus::Error, Some(format!("failed to provision session: {e}")), None).await;
                    return;
                }
            }
        };

        let Some(session) = session else {
            warn!(job_id = %job_id, target_id = %target_id, "timed out waiting for a ready session");
            let _ = jobs.terminate(job_id, JobStatus::Error, Some("timed out waiting for a ready session".to_string()), None).await;
            return;
        };

        if let Err(e) = jobs.bind_session(job_id, session.id).await {
            error!(job_id = %job_id, error = %e, "failed to bind session to job");
            return;
        }

        let heartbeat_owner = config.worker_id.clone();
        let heartbeat_jobs = jobs.clone();
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat_stop = heartbeat_cancel.clone();
        let lease_seconds = config.lease_seconds;
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = heartbeat_stop.cancelled() => break,
                    _ = tokio::time::sleep(config.lease_renew_interval) => {
                        if let Ok(false) = heartbeat_jobs.renew_lease(job_id, &heartbeat_owner, lease_seconds).await {
                            warn!(job_id = %job_id, "lease renewal rejected; another worker likely reaped this job");
                            break;
                        }
                    }
                }
            }
        });

        if let Err(e) = loop_runner.run_job(job_id).await {
            error!(job_id = %job_id, error = %e, "sampling loop returned an infrastructure error");
        }

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;
    }
}

#[async_trait]
impl Service for TenantProcessor {
    fn name(&self) -> &'static str {
        "tenant-processor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(tenant_id = %self.tenant.id, tenant = %self.tenant.schema, worker_id = %self.config.worker_id, "tenant processor starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = match self.jobs.claim_next(&self.config.worker_id, self.config.lease_seconds).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(tenant_id = %self.tenant.id, error = %e, "claim_next failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
            };

            let Some(job) = claimed else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };

            debug!(tenant_id = %self.tenant.id, job_id = %job.id, target_id = %job.target_id, "claimed job");

            let jobs = self.jobs.clone();
            let provisioner = self.provisioner.clone();
            let loop_runner = self.loop_runner.clone();
            let config = self.config.clone();
            let job_id = job.id;
            let target_id = job.target_id;
            let running = self.running.clone();

            let handle = tokio::spawn(async move {
                Self::run_claimed_job(jobs, provisioner, loop_runner, config, job_id, target_id).await;
                running.lock().await.remove(&job_id);
            });
            self.running.lock().await.insert(job_id, handle);
        }

        let handles: Vec<JoinHandle<()>> = self.running.lock().await.drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            info!(tenant_id = %self.tenant.id, count = handles.len(), "waiting for in-flight jobs to finish");
            futures::future::join_all(handles).await;
        }

        info!(tenant_id = %self.tenant.id, "tenant processor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use orc_loop::{HealthProbe, LoopConfig};
    use orc_providers::{ExecuteRequest, ExecuteResponse, HandlerError, Provider, ProviderHandler, StopReason, Usage};
    use orc_store::memory::MemoryStore;
    use orc_store::{ApiDefinition, ApiDefinitionVersion, SessionState, SessionStore, Target};
    use orc_tools::{ExtractionTool, ToolRegistry};

    use super::*;

    struct NullHandler;

    #[async_trait]
    impl ProviderHandler for NullHandler {
        fn provider(&self) -> Provider {
            Provider::Anthropic
        }

        async fn execute(&self, _request: ExecuteRequest<'_>) -> Result<ExecuteResponse, HandlerError> {
            Ok(ExecuteResponse { content: vec![], stop_reason: StopReason::EndTurn, usage: Usage::default() })
        }
    }

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn probe(&self, _container_ip: &str) -> bool {
            true
        }
    }

    /// A provisioner that never finds a session ready, to exercise the
    /// bounded-retry give-up path without a real container backend.
    struct NeverReady {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionProvisioner for NeverReady {
        async fn ensure_ready(&self, _target_id: Uuid) -> anyhow::Result<Option<Session>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    struct AlreadyReady(Session);

    #[async_trait]
    impl SessionProvisioner for AlreadyReady {
        async fn ensure_ready(&self, _target_id: Uuid) -> anyhow::Result<Option<Session>> {
            Ok(Some(self.0.clone()))
        }
    }

    fn tenant() -> Tenant {
        Tenant { id: Uuid::new_v4(), name: "acme".to_string(), host: "acme.example.com".to_string(), schema: "tenant_acme".to_string(), is_active: true, clerk_user_id: None }
    }

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

    fn loop_runner(store: &Arc<MemoryStore>) -> Arc<LoopRunner> {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(ExtractionTool));
        Arc::new(LoopRunner::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NullHandler),
            Arc::new(registry),
            Arc::new(AlwaysHealthy),
            LoopConfig::default(),
            "test-model".to_string(),
        ))
    }

    #[tokio::test]
    async fn a_job_whose_target_never_gets_a_session_is_errored_out() {
        let store = Arc::new(MemoryStore::new());
        let target_id = Uuid::new_v4();
        store.insert_target(target(target_id));
        let def = ApiDefinition { id: Uuid::new_v4(), name: "sum".to_string(), description: String::new(), is_archived: false };
        let version = ApiDefinitionVersion {
            id: Uuid::new_v4(),
            api_definition_id: def.id,
            version_number: 1,
            parameters: vec![],
            prompt: "Add.".to_string(),
            prompt_cleanup: String::new(),
            response_example: serde_json::json!({"sum": 0}),
            is_active: true,
        };
        store.insert_api_definition(def, version);
        let job = store.enqueue(target_id, "sum".to_string(), serde_json::json!({})).await.unwrap();
        store.claim_next("worker-1", 120).await.unwrap();

        let provisioner = Arc::new(NeverReady { calls: AtomicUsize::new(0) });
        let mut config = SchedulerConfig::default();
        config.session_poll_interval = Duration::from_millis(1);
        config.session_poll_max_attempts = 3;

        TenantProcessor::run_claimed_job(store.clone(), provisioner.clone(), loop_runner(&store), config, job.id, target_id).await;

        let job = JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("timed out waiting for a ready session"));
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_ready_session_is_bound_before_the_loop_runs() {
        let store = Arc::new(MemoryStore::new());
        let target_id = Uuid::new_v4();
        store.insert_target(target(target_id));
        let def = ApiDefinition { id: Uuid::new_v4(), name: "sum".to_string(), description: String::new(), is_archived: false };
        let version = ApiDefinitionVersion {
            id: Uuid::new_v4(),
            api_definition_id: def.id,
            version_number: 1,
            parameters: vec![],
            prompt: "Add.".to_string(),
            prompt_cleanup: String::new(),
            response_example: serde_json::json!({"sum": 0}),
            is_active: true,
        };
        store.insert_api_definition(def, version);
        let job = store.enqueue(target_id, "sum".to_string(), serde_json::json!({})).await.unwrap();

        let mut session = store.create_initializing(target_id).await.unwrap();
        session.state = SessionState::Ready;
        session.container_id = Some("c1".to_string());
        session.container_ip = Some("10.0.0.9".to_string());
        store.update(&session).await.unwrap();

        let provisioner = Arc::new(AlreadyReady(session.clone()));
        TenantProcessor::run_claimed_job(store.clone(), provisioner, loop_runner(&store), SchedulerConfig::default(), job.id, target_id).await;

        let job = JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.session_id, Some(session.id));
        // The null handler emits no tool_use and an end_turn stop with no prior
        // extraction, so the loop should have errored on the model contract.
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("Model ended its turn without providing any extractions"));
    }

    #[tokio::test]
    async fn run_claims_and_finishes_a_queued_job_then_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let target_id = Uuid::new_v4();
        store.insert_target(target(target_id));
        let def = ApiDefinition { id: Uuid::new_v4(), name: "sum".to_string(), description: String::new(), is_archived: false };
        let version = ApiDefinitionVersion {
            id: Uuid::new_v4(),
            api_definition_id: def.id,
            version_number: 1,
            parameters: vec![],
            prompt: "Add.".to_string(),
            prompt_cleanup: String::new(),
            response_example: serde_json::json!({"sum": 0}),
            is_active: true,
        };
        store.insert_api_definition(def, version);
        let job = store.enqueue(target_id, "sum".to_string(), serde_json::json!({})).await.unwrap();

        let mut session = store.create_initializing(target_id).await.unwrap();
        session.state = SessionState::Ready;
        session.container_id = Some("c1".to_string());
        session.container_ip = Some("10.0.0.9".to_string());
        store.update(&session).await.unwrap();

        let provisioner: Arc<dyn SessionProvisioner> = Arc::new(AlreadyReady(session));
        let mut config = SchedulerConfig::default();
        config.poll_interval = Duration::from_millis(5);

        let processor = Box::new(TenantProcessor::new(tenant(), store.clone() as Arc<dyn JobStore>, provisioner, loop_runner(&store), config));

        let shutdown = CancellationToken::new();
        let run_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move { processor.run(run_shutdown).await });

        loop {
            if JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap().status == JobStatus::Error {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let job = JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
    }

    #[test]
    fn default_config_matches_the_documented_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.lease_seconds, 120);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
    }
}
