//! The Container Manager (§4.6): the primitive set the orchestrator needs
//! from a sandbox runtime, plus a deterministic in-memory fake.
//!
//! No real Docker/OCI client ships here (out of scope, §1) — callers supply
//! their own [`ContainerManager`] in production; tests and other in-process
//! consumers use [`FakeContainerManager`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use orc_store::{ClientType, Target, VpnType};

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image: String,
    pub name: String,
    pub env: HashMap<String, String>,
    pub network_mode: Option<String>,
    pub cap_add: Vec<String>,
    pub devices: Vec<String>,
}

impl LaunchSpec {
    /// Builds the launch spec for a target per §4.6: OpenVPN targets get
    /// `NET_ADMIN`/`NET_RAW` and `/dev/net/tun`; env carries the split
    /// client/vpn type plus connection details.
    pub fn for_target(target: &Target, image: impl Into<String>, name: impl Into<String>) -> anyhow::Result<Self> {
        let target_type = target.target_type()?;
        let mut env = HashMap::new();
        env.insert("REMOTE_CLIENT_TYPE".to_string(), client_type_str(target_type.client).to_string());
        env.insert("REMOTE_VPN_TYPE".to_string(), vpn_type_str(target_type.vpn).to_string());
        env.insert("HOST_IP".to_string(), target.host.clone());
        if let Some(port) = target.port {
            env.insert("HOST_PORT".to_string(), port.to_string());
        }
        if let Some(username) = &target.username {
            env.insert("REMOTE_USERNAME".to_string(), username.clone());
        }
        env.insert("REMOTE_PASSWORD".to_string(), target.password.clone());
        if let Some(vpn_config) = &target.vpn_config {
            env.insert("VPN_CONFIG".to_string(), vpn_config.clone());
        }
        if let Some(vpn_username) = &target.vpn_username {
            env.insert("VPN_USERNAME".to_string(), vpn_username.clone());
        }
        if let Some(vpn_password) = &target.vpn_password {
            env.insert("VPN_PASSWORD".to_string(), vpn_password.clone());
        }
        env.insert("WIDTH".to_string(), target.width.to_string());
        env.insert("HEIGHT".to_string(), target.height.to_string());

        let (cap_add, devices) = if target_type.vpn == VpnType::OpenVpn {
            (vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()], vec!["/dev/net/tun".to_string()])
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(Self { image: image.into(), name: name.into(), env, network_mode: None, cap_add, devices })
    }
}

fn client_type_str(client: ClientType) -> &'static str {
    match client {
        ClientType::Vnc => "vnc",
        ClientType::Rdp => "rdp",
        ClientType::TeamViewer => "teamviewer",
    }
}

fn vpn_type_str(vpn: VpnType) -> &'static str {
    match vpn {
        VpnType::None => "none",
        VpnType::Tailscale => "tailscale",
        VpnType::OpenVpn => "openvpn",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub state: ContainerState,
    pub networks: Vec<String>,
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("runtime error: {0}")]
    Runtime(#[source] anyhow::Error),
}

/// The primitive set §4.6 requires from a sandbox runtime.
#[async_trait]
pub trait ContainerManager: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<String, ContainerError>;
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, ContainerError>;
    /// First non-bridge network's IPv4.
    async fn get_ip(&self, container_id: &str) -> Result<Option<String>, ContainerError>;
    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<String, ContainerError>;
    async fn stop(&self, container_id: &str, timeout_secs: u64) -> Result<(), ContainerError>;
    async fn remove(&self, container_id: &str) -> Result<(), ContainerError>;
    /// `GET /health` on port 8088, 5s timeout, per §4.6.
    async fn health(&self, container_ip: &str) -> Result<HealthStatus, ContainerError>;
}

/// Lets one `Arc<C>` be shared between a `Provisioner` (which owns its
/// container handle behind an `Arc` already) and a `SessionMonitor` (which
/// takes its container handle by value) without requiring `C: Clone`.
#[async_trait]
impl<C: ContainerManager> ContainerManager for std::sync::Arc<C> {
    async fn launch(&self, spec: LaunchSpec) -> Result<String, ContainerError> {
        (**self).launch(spec).await
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, ContainerError> {
        (**self).inspect(container_id).await
    }

    async fn get_ip(&self, container_id: &str) -> Result<Option<String>, ContainerError> {
        (**self).get_ip(container_id).await
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<String, ContainerError> {
        (**self).exec(container_id, argv).await
    }

    async fn stop(&self, container_id: &str, timeout_secs: u64) -> Result<(), ContainerError> {
        (**self).stop(container_id, timeout_secs).await
    }

    async fn remove(&self, container_id: &str) -> Result<(), ContainerError> {
        (**self).remove(container_id).await
    }

    async fn health(&self, container_ip: &str) -> Result<HealthStatus, ContainerError> {
        (**self).health(container_ip).await
    }
}

struct FakeContainer {
    info: ContainerInfo,
    ip: Option<String>,
    healthy: bool,
}

/// Deterministic in-memory double used by `orc-session`'s own tests and by
/// `orc-scheduler`/`orc-loop` integration tests, analogous to the in-memory
/// `JobStore`/`SessionStore` doubles in `orc-store`.
#[derive(Default)]
pub struct FakeContainerManager {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: Mutex<u64>,
}

impl FakeContainerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: flips a container's reported health, e.g. to simulate a
    /// sandbox that never comes up.
    pub fn set_healthy(&self, container_id: &str, healthy: bool) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(container_id) {
            c.healthy = healthy;
        }
    }

    /// Test hook: simulates the container process dying out from under us.
    pub fn kill(&self, container_id: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(container_id) {
            c.info.state = ContainerState::Exited;
        }
    }
}

#[async_trait]
impl ContainerManager for FakeContainerManager {
    async fn launch(&self, spec: LaunchSpec) -> Result<String, ContainerError> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let id = format!("fake-{}-{}", spec.name, *next_id);
        drop(next_id);

        let ip = format!("10.42.0.{}", (self.containers.lock().unwrap().len() as u8) + 2);
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                info: ContainerInfo { state: ContainerState::Running, networks: vec!["bridge".to_string(), "orc_net".to_string()], config: spec.env },
                ip: Some(ip),
                healthy: true,
            },
        );
        Ok(id)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, ContainerError> {
        self.containers
            .lock()
            .unwrap()
            .get(container_id)
            .map(|c| c.info.clone())
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))
    }

    async fn get_ip(&self, container_id: &str) -> Result<Option<String>, ContainerError> {
        self.containers
            .lock()
            .unwrap()
            .get(container_id)
            .map(|c| c.ip.clone())
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))
    }

    async fn exec(&self, container_id: &str, _argv: &[String]) -> Result<String, ContainerError> {
        self.containers
            .lock()
            .unwrap()
            .get(container_id)
            .map(|_| "0.12 0.09 0.05 1/203 4821\n".to_string())
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))
    }

    async fn stop(&self, container_id: &str, _timeout_secs: u64) -> Result<(), ContainerError> {
        self.containers
            .lock()
            .unwrap()
            .get_mut(container_id)
            .map(|c| c.info.state = ContainerState::Exited)
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))
    }

    async fn remove(&self, container_id: &str) -> Result<(), ContainerError> {
        self.containers
            .lock()
            .unwrap()
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))
    }

    async fn health(&self, container_ip: &str) -> Result<HealthStatus, ContainerError> {
        let containers = self.containers.lock().unwrap();
        let found = containers.values().find(|c| c.ip.as_deref() == Some(container_ip));
        match found {
            Some(c) if c.healthy => Ok(HealthStatus { healthy: true, reason: "ok".to_string() }),
            Some(_) => Ok(HealthStatus { healthy: false, reason: "not ready".to_string() }),
            None => Err(ContainerError::NotFound(container_ip.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn target(r#type: &str) -> Target {
        Target {
            id: Uuid::new_v4(),
            name: "t".to_string(),
            r#type: r#type.to_string(),
            host: "10.0.0.5".to_string(),
            port: Some(3389),
            username: Some("admin".to_string()),
            password: "secret".to_string(),
            vpn_config: None,
            vpn_username: None,
            vpn_password: None,
            width: 1920,
            height: 1080,
            rdp_params: None,
            is_archived: false,
        }
    }

    #[test]
    fn openvpn_targets_get_tun_device_and_net_admin() {
        let spec = LaunchSpec::for_target(&target("rdp+openvpn"), "img", "name").unwrap();
        assert_eq!(spec.cap_add, vec!["NET_ADMIN", "NET_RAW"]);
        assert_eq!(spec.devices, vec!["/dev/net/tun"]);
        assert_eq!(spec.env.get("REMOTE_VPN_TYPE").unwrap(), "openvpn");
    }

    #[test]
    fn non_vpn_targets_get_no_extra_capabilities() {
        let spec = LaunchSpec::for_target(&target("vnc"), "img", "name").unwrap();
        assert!(spec.cap_add.is_empty());
        assert!(spec.devices.is_empty());
    }

    #[tokio::test]
    async fn launch_then_inspect_reports_running() {
        let manager = FakeContainerManager::new();
        let spec = LaunchSpec::for_target(&target("vnc"), "img", "sess-1").unwrap();
        let id = manager.launch(spec).await.unwrap();
        let info = manager.inspect(&id).await.unwrap();
        assert_eq!(info.state, ContainerState::Running);
        assert!(manager.get_ip(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn health_reflects_test_hook() {
        let manager = FakeContainerManager::new();
        let spec = LaunchSpec::for_target(&target("vnc"), "img", "sess-2").unwrap();
        let id = manager.launch(spec).await.unwrap();
        let ip = manager.get_ip(&id).await.unwrap().unwrap();
        assert!(manager.health(&ip).await.unwrap().healthy);
        manager.set_healthy(&id, false);
        assert!(!manager.health(&ip).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn stop_transitions_to_exited() {
        let manager = FakeContainerManager::new();
        let spec = LaunchSpec::for_target(&target("vnc"), "img", "sess-3").unwrap();
        let id = manager.launch(spec).await.unwrap();
        manager.stop(&id, 1).await.unwrap();
        assert_eq!(manager.inspect(&id).await.unwrap().state, ContainerState::Exited);
    }
}
