//! The provider-agnostic handler contract (§4.3) and the settings view it
//! is constructed from (§4.10).

use async_trait::async_trait;
use thiserror::Error;

use crate::content::{ContentBlock, StopReason, Usage};

/// The tagged union §9's REDESIGN FLAGS calls for in place of dynamic
/// dispatch on provider strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    Bedrock,
    Vertex,
    LegacyUseProxy,
    OpenAi,
    OpenCua,
}

impl Provider {
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "bedrock" => Provider::Bedrock,
            "vertex" => Provider::Vertex,
            "legacyuse" => Provider::LegacyUseProxy,
            "openai" => Provider::OpenAi,
            "opencua" => Provider::OpenCua,
            _ => Provider::Anthropic,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::Anthropic => "claude-sonnet-4-20250514",
            Provider::Bedrock => "eu.anthropic.claude-sonnet-4-20250514-v1:0",
            Provider::Vertex => "claude-sonnet-4@20250514",
            Provider::LegacyUseProxy => "legacy-use-sonnet-4",
            Provider::OpenAi => "gpt-5",
            Provider::OpenCua => "opencua-7b-1234567890",
        }
    }
}

/// A resolved view over `TenantSettings` plus configuration fallbacks,
/// assembled once per job (§4.10). Handlers take this instead of a
/// `SettingsStore` handle so they stay unit-testable without persistence.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub provider: Option<Provider>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: Option<String>,
    pub vertex_project: Option<String>,
    pub vertex_region: Option<String>,
    pub proxy_api_key: Option<String>,
}

impl ProviderSettings {
    pub fn resolved_provider(&self) -> Provider {
        self.provider.unwrap_or(Provider::Anthropic)
    }

    pub fn resolved_model(&self) -> String {
        self.model.clone().unwrap_or_else(|| self.resolved_provider().default_model().to_string())
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned an unparseable response: {0}")]
    Decode(String),
    #[error("provider credentials are missing or invalid")]
    Unauthorized,
}

/// A tool definition in the handler's input vocabulary (name/description/
/// schema), handed to `execute` alongside the canonical message history.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

pub struct ExecuteRequest<'a> {
    pub history: &'a [crate::content::Message],
    pub system: &'a str,
    pub tools: &'a [ToolDefinition],
    pub model: &'a str,
    pub max_tokens: u32,
    pub temperature: f32,
}

pub struct ExecuteResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// Adapter translating the canonical block vocabulary to/from a specific
/// VLM API (§4.3). Every variant in `anthropic`/`openai`/`opencua` MUST
/// accept canonical blocks as input and MUST return canonical blocks.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    fn provider(&self) -> Provider;

    async fn execute(&self, request: ExecuteRequest<'_>) -> Result<ExecuteResponse, HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_string_falls_back_to_anthropic() {
        assert_eq!(Provider::parse("not-a-real-provider"), Provider::Anthropic);
    }

    #[test]
    fn settings_fall_back_to_provider_default_model() {
        let settings = ProviderSettings { provider: Some(Provider::OpenAi), ..Default::default() };
        assert_eq!(settings.resolved_model(), "gpt-5");
    }
}
