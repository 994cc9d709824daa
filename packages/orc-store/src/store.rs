//! Storage traits for every entity in §3.
//!
//! The traits are split by entity, mirroring the way a single Postgres (or,
//! in tests, in-memory) implementation composes them: a tenant's jobs, its
//! messages, its logs, and so on. [`JobStore::claim_next`] is the one method
//! that encodes real policy (target exclusivity, implicit pause) rather than
//! plain CRUD — everything else here is mechanism, the scheduler in
//! `orc-scheduler` supplies the policy around it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orc_engine::StoreError;
use uuid::Uuid;

use crate::model::{
    ApiDefinition, ApiDefinitionVersion, Job, JobLog, JobMessage, JobStatus, LogType, MessageRole,
    Session, SettingsKey, Target, Tenant,
};

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_by_host(&self, host: &str) -> Result<Option<Tenant>>;
    async fn get(&self, id: Uuid) -> Result<Option<Tenant>>;
    /// Every active tenant, for the worker binary's periodic tenant-processor rescan (§4.11).
    async fn list_active(&self) -> Result<Vec<Tenant>>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Target>>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Session>>;
    async fn create_initializing(&self, target_id: Uuid) -> Result<Session>;
    async fn update(&self, session: &Session) -> Result<()>;
    /// Non-archived sessions, for the lifecycle monitor to sweep.
    async fn list_non_archived(&self) -> Result<Vec<Session>>;
    /// A `ready` session for the target, if one exists (§4.1 claim predicate).
    async fn find_ready_for_target(&self, target_id: Uuid) -> Result<Option<Session>>;
    /// Whether any session for the target is currently `initializing`
    /// (used to avoid double-provisioning, §4.1/§4.7).
    async fn has_initializing_for_target(&self, target_id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait ApiDefinitionStore: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Result<Option<ApiDefinition>>;
    async fn get_active_version(&self, api_definition_id: Uuid) -> Result<Option<ApiDefinitionVersion>>;
    async fn get_version(&self, id: Uuid) -> Result<Option<ApiDefinitionVersion>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message, assigning the next dense sequence number for the job.
    async fn append(
        &self,
        job_id: Uuid,
        role: MessageRole,
        content: serde_json::Value,
    ) -> Result<JobMessage>;

    /// Full history ordered by `sequence`.
    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<JobMessage>>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, job_id: Uuid, log_type: LogType, content: String) -> Result<JobLog>;
    async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<JobLog>>;
    /// Maintenance leader's daily retention sweep.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Tenant override if present, else the hard-coded default table.
    async fn get(&self, tenant_id: Uuid, key: SettingsKey) -> Result<Option<String>>;
    async fn set(&self, tenant_id: Uuid, key: SettingsKey, value: String) -> Result<()>;
}

/// §4.1's per-(tenant, target) exclusivity and lease machinery.
///
/// Every method here must be safe under concurrent callers racing across
/// worker processes; the Postgres implementation uses `FOR UPDATE SKIP
/// LOCKED` plus a transactional advisory lock keyed by
/// `hash(tenant_schema || ':' || target_id)`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Insert a new job in `queued` status.
    async fn enqueue(&self, target_id: Uuid, api_name: String, parameters: serde_json::Value) -> Result<Job>;

    /// Atomically claim the oldest eligible `queued` job for this tenant.
    ///
    /// Eligible means: the target has no `running` job and no `paused` or
    /// `error` job (implicit pause). Returns `None` without mutating
    /// anything if no job is eligible or the advisory lock couldn't be
    /// acquired.
    async fn claim_next(&self, lease_owner: &str, lease_seconds: i64) -> Result<Option<Job>>;

    /// Extend the lease if still `running` and owned by `owner`.
    async fn renew_lease(&self, job_id: Uuid, owner: &str, extra_seconds: i64) -> Result<bool>;

    /// Transition every `running` job whose lease has expired (or is null)
    /// to `error`, clearing lease columns. Always commits what it can.
    async fn expire_stale_leases(&self) -> Result<Vec<Uuid>>;

    async fn request_cancel(&self, job_id: Uuid) -> Result<()>;

    /// `paused|error` -> `queued`.
    async fn resume(&self, job_id: Uuid) -> Result<()>;

    /// `paused|error` -> `success`, storing the given result.
    async fn resolve(&self, job_id: Uuid, result: serde_json::Value) -> Result<()>;

    /// Finalize a job to a terminal (or `paused`) status with an optional
    /// error string and partial result, clearing lease columns.
    async fn terminate(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) -> Result<()>;

    async fn bind_session(&self, job_id: Uuid, session_id: Uuid) -> Result<()>;

    async fn add_token_usage(&self, job_id: Uuid, input_tokens: i64, output_tokens: i64) -> Result<(i64, i64)>;

    /// All `paused|error` jobs for a target (the sole source of truth for
    /// "is this target's queue paused").
    async fn blocking_jobs_for_target(&self, target_id: Uuid) -> Result<Vec<Job>>;

    /// Whether a `queued` job exists anywhere for this tenant (used by the
    /// per-tenant processor to decide whether to keep polling).
    async fn has_queued_jobs(&self, tenant_id: Uuid) -> Result<bool>;

    async fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool>;
}

/// Advisory locks: the maintenance leader election (§4.8) and the
/// per-(tenant, target) claim lock (§4.1).
#[async_trait]
pub trait AdvisoryLocks: Send + Sync {
    /// Hold the `hash("maintenance_v1")` session-level lock for the
    /// lifetime of the returned guard. Only one process in the cluster
    /// holds it at a time.
    async fn try_become_maintenance_leader(&self) -> Result<bool>;
}
