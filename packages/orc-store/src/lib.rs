//! Data model and persistence traits for tenants, targets, sessions, jobs,
//! API definitions and their versions, conversation history, logs, and
//! per-tenant settings.
//!
//! [`postgres::PgStore`] is the production backend; [`memory::MemoryStore`]
//! is a same-process double used by `orc-scheduler` and `orc-loop` tests.

pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use model::{
    ApiDefinition, ApiDefinitionVersion, ApiParameter, ArchiveReason, ClientType, Job, JobLog,
    JobMessage, JobStatus, LogType, MessageRole, Session, SessionState, SettingsKey, Target,
    TargetType, Tenant, VpnType,
};
pub use postgres::{PgMaintenanceLock, PgStore};
pub use store::{
    AdvisoryLocks, ApiDefinitionStore, JobStore, LogStore, MessageStore, Result, SessionStore,
    SettingsStore, TargetStore, TenantStore,
};
