//! Container Manager (B), Session Lifecycle Monitor (C), and Session
//! Provisioning Helper (§4.7).

pub mod container;
pub mod monitor;
pub mod provision;

pub use container::{ContainerError, ContainerInfo, ContainerManager, ContainerState, FakeContainerManager, HealthStatus, LaunchSpec};
pub use monitor::{LastChecked, MonitorConfig, SessionMonitor};
pub use provision::{needs_provisioning, ProvisionError, Provisioner};
