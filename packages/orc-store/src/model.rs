//! Entities from the data model: tenants, targets, sessions, jobs, messages,
//! logs, API definitions, and tenant settings.
//!
//! Types here are plain data — invariants (at most one running job per
//! target, dense message sequences, ...) are enforced by the store
//! implementations in [`crate::postgres`] and [`crate::memory`], not by the
//! types themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An isolated tenant namespace, resolved from the request `Host` at the
/// (out-of-scope) HTTP edge and threaded through every store call below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub schema: String,
    pub is_active: bool,
    pub clerk_user_id: Option<String>,
}

/// The kind of remote desktop a [`Target`] automates, and the transport
/// wrapping it (direct, or tunnelled through a VPN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    Vnc,
    Rdp,
    TeamViewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpnType {
    None,
    Tailscale,
    OpenVpn,
}

/// `type` as stored is `"{client}"` or `"{client}+{vpn}"`, e.g. `"vnc"` or
/// `"rdp+openvpn"`. [`TargetType::parse`] mirrors §4.7's "split on first `_`
/// or `+`" rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetType {
    pub client: ClientType,
    pub vpn: VpnType,
}

impl TargetType {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let (client_str, vpn_str) = match raw.split_once(['+', '_']) {
            Some((c, v)) => (c, v),
            None => (raw, ""),
        };
        let client = match client_str {
            "vnc" => ClientType::Vnc,
            "rdp" => ClientType::Rdp,
            "teamviewer" => ClientType::TeamViewer,
            other => anyhow::bail!("unknown client type: {other}"),
        };
        let vpn = match vpn_str {
            "" => VpnType::None,
            "tailscale" => VpnType::Tailscale,
            "openvpn" => VpnType::OpenVpn,
            other => anyhow::bail!("unknown vpn type: {other}"),
        };
        Ok(Self { client, vpn })
    }

    pub fn to_raw(self) -> String {
        let client = match self.client {
            ClientType::Vnc => "vnc",
            ClientType::Rdp => "rdp",
            ClientType::TeamViewer => "teamviewer",
        };
        match self.vpn {
            VpnType::None => client.to_string(),
            VpnType::Tailscale => format!("{client}+tailscale"),
            VpnType::OpenVpn => format!("{client}+openvpn"),
        }
    }
}

/// Immutable identity of a remote system to automate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    pub name: String,
    pub r#type: String,
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: String,
    pub vpn_config: Option<String>,
    pub vpn_username: Option<String>,
    pub vpn_password: Option<String>,
    pub width: u32,
    pub height: u32,
    pub rdp_params: Option<String>,
    pub is_archived: bool,
}

impl Target {
    pub fn target_type(&self) -> anyhow::Result<TargetType> {
        TargetType::parse(&self.r#type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Authenticating,
    Ready,
    Destroying,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveReason {
    UserInitiated,
    AutoCleanup,
}

/// A live sandbox bound to one target.
///
/// Invariant: `container_ip.is_some() == container_id.is_some()`, and only
/// `state == Ready` permits job execution (enforced by the scheduler's
/// claim predicate, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub target_id: Uuid,
    pub state: SessionState,
    pub status: String,
    pub container_id: Option<String>,
    pub container_ip: Option<String>,
    pub is_archived: bool,
    pub archive_reason: Option<ArchiveReason>,
    pub last_job_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn invariants_hold(&self) -> bool {
        self.container_ip.is_some() == self.container_id.is_some()
    }
}

/// A named, versioned, parameterized natural-language API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub is_archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiParameter {
    pub name: String,
    pub description: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDefinitionVersion {
    pub id: Uuid,
    pub api_definition_id: Uuid,
    pub version_number: i32,
    pub parameters: Vec<ApiParameter>,
    pub prompt: String,
    pub prompt_cleanup: String,
    pub response_example: serde_json::Value,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Success,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error | JobStatus::Canceled)
    }
}

/// One execution of a named API against a target inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub target_id: Uuid,
    pub session_id: Option<Uuid>,
    pub api_name: String,
    pub api_definition_version_id: Option<Uuid>,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_input_tokens: Option<i64>,
    pub total_output_tokens: Option<i64>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

impl Job {
    /// §3 invariant: `lease_owner`/`lease_expires_at` set iff `status == Running`.
    pub fn lease_invariant_holds(&self) -> bool {
        let has_lease = self.lease_owner.is_some() && self.lease_expires_at.is_some();
        (self.status == JobStatus::Running) == has_lease
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One turn of the canonical conversation history. Source of truth when the
/// loop resumes a job: `(job_id, sequence)` is unique and sequences are
/// dense starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: Uuid,
    pub job_id: Uuid,
    pub sequence: i32,
    pub role: MessageRole,
    pub message_content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    System,
    HttpExchange,
    ToolUse,
    Message,
    Result,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub id: Uuid,
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub log_type: LogType,
    pub content: String,
    /// `content` with base64 image payloads replaced by a sentinel; what
    /// dashboards read.
    pub content_trimmed: String,
}

/// The closed set of keys `TenantSettings` recognizes. Anything else is a
/// validation error at the store boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsKey {
    ApiKey,
    ApiProvider,
    AnthropicApiKey,
    AwsAccessKeyId,
    AwsSecretAccessKey,
    AwsRegion,
    VertexProject,
    VertexRegion,
    LegacyUseProxyApiKey,
}

impl SettingsKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingsKey::ApiKey => "API_KEY",
            SettingsKey::ApiProvider => "API_PROVIDER",
            SettingsKey::AnthropicApiKey => "ANTHROPIC_API_KEY",
            SettingsKey::AwsAccessKeyId => "AWS_ACCESS_KEY_ID",
            SettingsKey::AwsSecretAccessKey => "AWS_SECRET_ACCESS_KEY",
            SettingsKey::AwsRegion => "AWS_REGION",
            SettingsKey::VertexProject => "VERTEX_PROJECT",
            SettingsKey::VertexRegion => "VERTEX_REGION",
            SettingsKey::LegacyUseProxyApiKey => "LEGACYUSE_PROXY_API_KEY",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "API_KEY" => SettingsKey::ApiKey,
            "API_PROVIDER" => SettingsKey::ApiProvider,
            "ANTHROPIC_API_KEY" => SettingsKey::AnthropicApiKey,
            "AWS_ACCESS_KEY_ID" => SettingsKey::AwsAccessKeyId,
            "AWS_SECRET_ACCESS_KEY" => SettingsKey::AwsSecretAccessKey,
            "AWS_REGION" => SettingsKey::AwsRegion,
            "VERTEX_PROJECT" => SettingsKey::VertexProject,
            "VERTEX_REGION" => SettingsKey::VertexRegion,
            "LEGACYUSE_PROXY_API_KEY" => SettingsKey::LegacyUseProxyApiKey,
            _ => return None,
        })
    }

    /// Hard-coded fallback table for keys the tenant hasn't overridden.
    pub fn default_value(self) -> Option<&'static str> {
        match self {
            SettingsKey::ApiProvider => Some("anthropic"),
            SettingsKey::AwsRegion => Some("us-east-1"),
            _ => None,
        }
    }
}
