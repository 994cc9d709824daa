//! The Anthropic-compatible handler: the canonical vocabulary *is* the wire
//! format here, so conversion is mostly cache-control passthrough and beta
//! flag selection (§4.3).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::content::{ContentBlock, StopReason, Usage};
use crate::handler::{ExecuteRequest, ExecuteResponse, HandlerError, Provider, ProviderHandler};

pub const COMPUTER_USE_BETA_FLAG: &str = "computer-use-2024-10-22";
pub const PROMPT_CACHING_BETA_FLAG: &str = "prompt-caching-2024-07-31";
pub const TOKEN_EFFICIENT_TOOLS_BETA_FLAG: &str = "token-efficient-tools-2025-02-19";

pub struct AnthropicHandler {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    token_efficient_tools_beta: bool,
    enable_prompt_caching: bool,
}

impl AnthropicHandler {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
            token_efficient_tools_beta: true,
            enable_prompt_caching: true,
        }
    }

    fn betas(&self) -> Vec<&'static str> {
        let mut betas = vec![COMPUTER_USE_BETA_FLAG];
        if self.token_efficient_tools_beta {
            betas.push(TOKEN_EFFICIENT_TOOLS_BETA_FLAG);
        }
        if self.enable_prompt_caching {
            betas.push(PROMPT_CACHING_BETA_FLAG);
        }
        betas
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: i64,
    output_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: i64,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: &'a [crate::content::Message],
    tools: Vec<serde_json::Value>,
}

fn map_stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

#[async_trait]
impl ProviderHandler for AnthropicHandler {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn execute(&self, request: ExecuteRequest<'_>) -> Result<ExecuteResponse, HandlerError> {
        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| serde_json::json!({"name": t.name, "description": t.description, "input_schema": t.input_schema}))
            .collect();

        let body = AnthropicRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system,
            messages: request.history,
            tools,
        };

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("anthropic-beta", self.betas().join(","))
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::warn!("anthropic API rejected credentials");
            return Err(HandlerError::Unauthorized);
        }
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "anthropic API returned a non-success status");
        }

        let parsed: AnthropicMessageResponse = response.json().await.map_err(|e| HandlerError::Decode(e.to_string()))?;

        Ok(ExecuteResponse {
            content: parsed.content,
            stop_reason: map_stop_reason(parsed.stop_reason.as_deref()),
            usage: Usage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
                cache_creation_input_tokens: parsed.usage.cache_creation_input_tokens,
                cache_read_input_tokens: parsed.usage.cache_read_input_tokens,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("tool_use")), StopReason::ToolUse);
        assert_eq!(map_stop_reason(Some("max_tokens")), StopReason::MaxTokens);
        assert_eq!(map_stop_reason(None), StopReason::EndTurn);
    }

    #[test]
    fn betas_include_computer_use_flag() {
        let handler = AnthropicHandler::new("sk-test");
        assert!(handler.betas().contains(&COMPUTER_USE_BETA_FLAG));
    }
}
