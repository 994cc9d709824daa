//! The minimal top-level task contract `orc-worker`'s `main` drives: one
//! [`TenantProcessor`](crate::processor::TenantProcessor) per tenant plus,
//! on the process that wins the maintenance election, one
//! [`MaintenanceLeader`](crate::maintenance::MaintenanceLeader) — both
//! cooperatively shut down through a shared `CancellationToken`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()>;
}
