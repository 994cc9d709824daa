//! The Per-Tenant Scheduler (§4.1) and Maintenance Leader (§4.8): the
//! process-shape layer that turns `orc-store`'s claim/lease primitives and
//! `orc-loop`'s sampling loop into a running worker.

pub mod maintenance;
pub mod processor;
pub mod service;

pub use maintenance::{MaintenanceConfig, MaintenanceLeader, Reconciler};
pub use processor::{SchedulerConfig, SessionProvisioner, TenantProcessor};
pub use service::Service;
