//! In-memory store used by the scheduler and sampling loop test suites.
//!
//! Mirrors the Postgres semantics closely enough to exercise the invariants
//! in §8 without a database: `claim_next` still respects target exclusivity
//! and implicit pause, leases still expire, sequences are still dense.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use orc_engine::StoreError;
use uuid::Uuid;

use crate::model::*;
use crate::store::*;

#[derive(Default)]
struct Inner {
    tenants: HashMap<Uuid, Tenant>,
    targets: HashMap<Uuid, Target>,
    sessions: HashMap<Uuid, Session>,
    jobs: HashMap<Uuid, Job>,
    messages: HashMap<Uuid, Vec<JobMessage>>,
    logs: HashMap<Uuid, Vec<JobLog>>,
    api_definitions: HashMap<Uuid, ApiDefinition>,
    api_versions: HashMap<Uuid, ApiDefinitionVersion>,
    settings: HashMap<(Uuid, &'static str), String>,
    maintenance_leader_held: bool,
}

/// A single-process, in-memory stand-in for [`crate::postgres::PgStore`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.inner.lock().unwrap().tenants.insert(tenant.id, tenant);
    }

    pub fn insert_target(&self, target: Target) {
        self.inner.lock().unwrap().targets.insert(target.id, target);
    }

    pub fn insert_session(&self, session: Session) {
        self.inner.lock().unwrap().sessions.insert(session.id, session);
    }

    pub fn insert_api_definition(&self, def: ApiDefinition, version: ApiDefinitionVersion) {
        let mut guard = self.inner.lock().unwrap();
        guard.api_versions.insert(version.id, version);
        guard.api_definitions.insert(def.id, def);
    }

    /// Test fixture hook: inserts a job in whatever state the caller wants,
    /// bypassing `enqueue`'s always-`queued` construction.
    pub fn insert_job(&self, job: Job) {
        self.inner.lock().unwrap().jobs.insert(job.id, job);
    }
}

fn blocking(target_id: Uuid, jobs: &HashMap<Uuid, Job>) -> bool {
    jobs.values()
        .any(|j| j.target_id == target_id && matches!(j.status, JobStatus::Running | JobStatus::Paused | JobStatus::Error))
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn enqueue(&self, target_id: Uuid, api_name: String, parameters: serde_json::Value) -> Result<Job> {
        let job = Job {
            id: Uuid::new_v4(),
            target_id,
            session_id: None,
            api_name,
            api_definition_version_id: None,
            parameters,
            status: JobStatus::Queued,
            result: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            total_input_tokens: None,
            total_output_tokens: None,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested: false,
        };
        let mut guard = self.inner.lock().unwrap();
        guard.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(&self, lease_owner: &str, lease_seconds: i64) -> Result<Option<Job>> {
        let mut guard = self.inner.lock().unwrap();
        let candidate = guard
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && !blocking(j.target_id, &guard.jobs))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let job = guard.jobs.get_mut(&job_id).unwrap();
        job.status = JobStatus::Running;
        job.lease_owner = Some(lease_owner.to_string());
        job.lease_expires_at = Some(Utc::now() + chrono::Duration::seconds(lease_seconds));
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn renew_lease(&self, job_id: Uuid, owner: &str, extra_seconds: i64) -> Result<bool> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(job) = guard.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Running && job.lease_owner.as_deref() == Some(owner) {
                job.lease_expires_at = Some(Utc::now() + chrono::Duration::seconds(extra_seconds));
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn expire_stale_leases(&self) -> Result<Vec<Uuid>> {
        let mut guard = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut expired = Vec::new();
        for job in guard.jobs.values_mut() {
            if job.status == JobStatus::Running && job.lease_expires_at.is_none_or(|exp| exp <= now) {
                job.status = JobStatus::Error;
                job.error = Some("Lease expired; worker likely terminated".to_string());
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.completed_at = Some(now);
                job.updated_at = now;
                expired.push(job.id);
            }
        }
        Ok(expired)
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(job) = guard.jobs.get_mut(&job_id) {
            job.cancel_requested = true;
        }
        Ok(())
    }

    async fn resume(&self, job_id: Uuid) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let job = guard.jobs.get_mut(&job_id).ok_or(StoreError::Conflict)?;
        if !matches!(job.status, JobStatus::Paused | JobStatus::Error) {
            return Err(StoreError::Conflict);
        }
        job.status = JobStatus::Queued;
        job.error = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn resolve(&self, job_id: Uuid, result: serde_json::Value) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let job = guard.jobs.get_mut(&job_id).ok_or(StoreError::Conflict)?;
        if !matches!(job.status, JobStatus::Paused | JobStatus::Error) {
            return Err(StoreError::Conflict);
        }
        job.status = JobStatus::Success;
        job.result = Some(result);
        job.completed_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn terminate(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(job) = guard.jobs.get_mut(&job_id) {
            job.status = status;
            job.error = error;
            if let Some(r) = result {
                job.result = Some(r);
            }
            job.lease_owner = None;
            job.lease_expires_at = None;
            if status.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn bind_session(&self, job_id: Uuid, session_id: Uuid) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(job) = guard.jobs.get_mut(&job_id) {
            job.session_id = Some(session_id);
        }
        Ok(())
    }

    async fn add_token_usage(&self, job_id: Uuid, input_tokens: i64, output_tokens: i64) -> Result<(i64, i64)> {
        let mut guard = self.inner.lock().unwrap();
        let job = guard.jobs.get_mut(&job_id).ok_or(StoreError::Conflict)?;
        let total_in = job.total_input_tokens.unwrap_or(0) + input_tokens;
        let total_out = job.total_output_tokens.unwrap_or(0) + output_tokens;
        job.total_input_tokens = Some(total_in);
        job.total_output_tokens = Some(total_out);
        Ok((total_in, total_out))
    }

    async fn blocking_jobs_for_target(&self, target_id: Uuid) -> Result<Vec<Job>> {
        let guard = self.inner.lock().unwrap();
        Ok(guard
            .jobs
            .values()
            .filter(|j| j.target_id == target_id && matches!(j.status, JobStatus::Paused | JobStatus::Error))
            .cloned()
            .collect())
    }

    async fn has_queued_jobs(&self, _tenant_id: Uuid) -> Result<bool> {
        let guard = self.inner.lock().unwrap();
        Ok(guard.jobs.values().any(|j| j.status == JobStatus::Queued))
    }

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        let guard = self.inner.lock().unwrap();
        Ok(guard.jobs.get(&job_id).map(|j| j.cancel_requested).unwrap_or(false))
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, job_id: Uuid, role: MessageRole, content: serde_json::Value) -> Result<JobMessage> {
        let mut guard = self.inner.lock().unwrap();
        let list = guard.messages.entry(job_id).or_default();
        let sequence = list.len() as i32 + 1;
        let message = JobMessage {
            id: Uuid::new_v4(),
            job_id,
            sequence,
            role,
            message_content: content,
            created_at: Utc::now(),
        };
        list.push(message.clone());
        Ok(message)
    }

    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<JobMessage>> {
        Ok(self.inner.lock().unwrap().messages.get(&job_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append(&self, job_id: Uuid, log_type: LogType, content: String) -> Result<JobLog> {
        let mut guard = self.inner.lock().unwrap();
        let log = JobLog {
            id: Uuid::new_v4(),
            job_id,
            timestamp: Utc::now(),
            log_type,
            content_trimmed: content.clone(),
            content,
        };
        guard.logs.entry(job_id).or_default().push(log.clone());
        Ok(log)
    }

    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<JobLog>> {
        Ok(self.inner.lock().unwrap().logs.get(&job_id).cloned().unwrap_or_default())
    }

    async fn prune_older_than(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64> {
        let mut guard = self.inner.lock().unwrap();
        let mut removed = 0u64;
        for logs in guard.logs.values_mut() {
            let before = logs.len();
            logs.retain(|l| l.timestamp >= cutoff);
            removed += (before - logs.len()) as u64;
        }
        Ok(removed)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.inner.lock().unwrap().sessions.get(&id).cloned())
    }

    async fn create_initializing(&self, target_id: Uuid) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            target_id,
            state: SessionState::Initializing,
            status: "starting".to_string(),
            container_id: None,
            container_ip: None,
            is_archived: false,
            archive_reason: None,
            last_job_time: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().unwrap().sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn update(&self, session: &Session) -> Result<()> {
        self.inner.lock().unwrap().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn list_non_archived(&self) -> Result<Vec<Session>> {
        Ok(self.inner.lock().unwrap().sessions.values().filter(|s| !s.is_archived).cloned().collect())
    }

    async fn find_ready_for_target(&self, target_id: Uuid) -> Result<Option<Session>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .find(|s| s.target_id == target_id && s.state == SessionState::Ready && !s.is_archived)
            .cloned())
    }

    async fn has_initializing_for_target(&self, target_id: Uuid) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .any(|s| s.target_id == target_id && s.state == SessionState::Initializing && !s.is_archived))
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn get_by_host(&self, host: &str) -> Result<Option<Tenant>> {
        Ok(self.inner.lock().unwrap().tenants.values().find(|t| t.host == host).cloned())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Tenant>> {
        Ok(self.inner.lock().unwrap().tenants.get(&id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<Tenant>> {
        Ok(self.inner.lock().unwrap().tenants.values().filter(|t| t.is_active).cloned().collect())
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Target>> {
        Ok(self.inner.lock().unwrap().targets.get(&id).cloned())
    }
}

#[async_trait]
impl ApiDefinitionStore for MemoryStore {
    async fn get_by_name(&self, name: &str) -> Result<Option<ApiDefinition>> {
        Ok(self.inner.lock().unwrap().api_definitions.values().find(|d| d.name == name).cloned())
    }

    async fn get_active_version(&self, api_definition_id: Uuid) -> Result<Option<ApiDefinitionVersion>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .api_versions
            .values()
            .find(|v| v.api_definition_id == api_definition_id && v.is_active)
            .cloned())
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<ApiDefinitionVersion>> {
        Ok(self.inner.lock().unwrap().api_versions.get(&id).cloned())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, tenant_id: Uuid, key: SettingsKey) -> Result<Option<String>> {
        let guard = self.inner.lock().unwrap();
        Ok(guard
            .settings
            .get(&(tenant_id, key.as_str()))
            .cloned()
            .or_else(|| key.default_value().map(str::to_string)))
    }

    async fn set(&self, tenant_id: Uuid, key: SettingsKey, value: String) -> Result<()> {
        self.inner.lock().unwrap().settings.insert((tenant_id, key.as_str()), value);
        Ok(())
    }
}

#[async_trait]
impl AdvisoryLocks for MemoryStore {
    async fn try_become_maintenance_leader(&self) -> Result<bool> {
        let mut guard = self.inner.lock().unwrap();
        if guard.maintenance_leader_held {
            Ok(false)
        } else {
            guard.maintenance_leader_held = true;
            Ok(true)
        }
    }
}
