//! The `computer` tool: mouse/keyboard/screenshot actions forwarded over
//! HTTP to a session's sandbox (§4.6's health-gated `container_ip:8088`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::tool::{ToolContext, ToolResult, ToolSpec};

/// The two wire versions named in §4.4; `V20250124` adds the enhanced
/// action set (`scroll`, `hold_key`, `wait`, `triple_click`, mouse up/down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputerToolVersion {
    V20241022,
    V20250124,
}

impl ComputerToolVersion {
    pub fn api_type(self) -> &'static str {
        match self {
            ComputerToolVersion::V20241022 => "computer_20241022",
            ComputerToolVersion::V20250124 => "computer_20250124",
        }
    }

    fn supports(self, action: &str) -> bool {
        const BASE: &[&str] = &[
            "key", "type", "mouse_move", "left_click", "left_click_drag", "right_click",
            "middle_click", "double_click", "screenshot", "cursor_position",
        ];
        const ENHANCED: &[&str] = &[
            "left_mouse_down", "left_mouse_up", "scroll", "hold_key", "wait", "triple_click",
        ];
        match self {
            ComputerToolVersion::V20241022 => BASE.contains(&action),
            ComputerToolVersion::V20250124 => BASE.contains(&action) || ENHANCED.contains(&action),
        }
    }
}

#[derive(Debug, Serialize)]
struct ActionPayload {
    api_type: &'static str,
    #[serde(flatten)]
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SandboxResponse {
    output: Option<String>,
    error: Option<String>,
    base64_image: Option<String>,
}

/// Parameters the `computer` action vocabulary can name; not every field is
/// used by every action (§4.4).
fn required_params_for(action: &str) -> &'static [&'static str] {
    match action {
        "left_click" | "right_click" | "middle_click" | "double_click" | "triple_click"
        | "mouse_move" | "left_mouse_down" | "left_mouse_up" => &["coordinate"],
        "left_click_drag" => &["coordinate", "to"],
        "type" | "key" => &["text"],
        "hold_key" => &["text", "duration"],
        "scroll" => &["scroll_direction", "scroll_amount"],
        "wait" => &["duration"],
        _ => &[],
    }
}

pub struct ComputerTool {
    pub version: ComputerToolVersion,
    pub width: u32,
    pub height: u32,
    client: reqwest::Client,
}

impl ComputerTool {
    pub fn new(version: ComputerToolVersion, width: u32, height: u32) -> Self {
        Self { version, width, height, client: reqwest::Client::new() }
    }

    async fn forward(&self, container_ip: &str, action: &str, params: serde_json::Value) -> ToolResult {
        let url = format!("http://{container_ip}:8088/tool_use/{action}");
        let payload = ActionPayload { api_type: self.version.api_type(), params };

        let response = match self
            .client
            .post(&url)
            .json(&payload)
            .timeout(Duration::from_secs(60))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => return ToolResult::error(format!("sandbox request failed: {err}")),
        };

        match response.json::<SandboxResponse>().await {
            Ok(body) => ToolResult { output: body.output, error: body.error, base64_image: body.base64_image, system: None },
            Err(err) => ToolResult::error(format!("sandbox returned an unparseable response: {err}")),
        }
    }
}

#[async_trait]
impl ToolSpec for ComputerTool {
    fn name(&self) -> &str {
        "computer"
    }

    fn description(&self) -> &str {
        "Interact with the remote desktop's mouse, keyboard, and screen"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {"type": "string"},
                "coordinate": {"type": "array", "items": {"type": "integer"}, "minItems": 2, "maxItems": 2},
                "to": {"type": "array", "items": {"type": "integer"}, "minItems": 2, "maxItems": 2},
                "text": {"type": "string"},
                "duration": {"type": "number"},
                "scroll_direction": {"type": "string", "enum": ["up", "down", "left", "right"]},
                "scroll_amount": {"type": "integer", "minimum": 0},
            },
            "required": ["action"],
        })
    }

    fn required_params(&self) -> &[&'static str] {
        &["action"]
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let Some(action) = input.get("action").and_then(|v| v.as_str()) else {
            return ToolResult::output(
                "The tool computer failed! Reason: missing required parameter(s) action. Please fix the input and try again.",
            );
        };

        if !self.version.supports(action) {
            return ToolResult::output(format!(
                "The tool computer failed! Reason: action '{action}' is not supported by {}. Please fix the input and try again.",
                self.version.api_type()
            ));
        }

        let missing: Vec<&str> = required_params_for(action)
            .iter()
            .filter(|key| input.get(**key).is_none())
            .copied()
            .collect();
        if !missing.is_empty() {
            return ToolResult::output(format!(
                "The tool computer failed! Reason: missing required parameter(s) {} for action '{action}'. Please fix the input and try again.",
                missing.join(", ")
            ));
        }

        let Some(container_ip) = &ctx.container_ip else {
            return ToolResult::error("no session container is bound to this job");
        };

        let mut params = input.as_object().cloned().unwrap_or_default();
        params.remove("action");
        self.forward(container_ip, action, serde_json::Value::Object(params)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v20241022_rejects_enhanced_actions() {
        assert!(!ComputerToolVersion::V20241022.supports("scroll"));
        assert!(ComputerToolVersion::V20250124.supports("scroll"));
        assert!(ComputerToolVersion::V20241022.supports("left_click"));
    }

    #[tokio::test]
    async fn missing_action_never_fails_the_job() {
        let tool = ComputerTool::new(ComputerToolVersion::V20250124, 1024, 768);
        let result = tool.execute(serde_json::json!({}), &ToolContext::default()).await;
        assert!(result.error.is_none());
        assert!(result.output.unwrap().contains("missing required parameter"));
    }

    #[tokio::test]
    async fn missing_coordinate_for_click_never_fails_the_job() {
        let tool = ComputerTool::new(ComputerToolVersion::V20250124, 1024, 768);
        let result = tool
            .execute(serde_json::json!({"action": "left_click"}), &ToolContext::default())
            .await;
        assert!(result.error.is_none());
        assert!(result.output.unwrap().contains("coordinate"));
    }

    #[tokio::test]
    async fn no_session_bound_is_an_error() {
        let tool = ComputerTool::new(ComputerToolVersion::V20250124, 1024, 768);
        let result = tool
            .execute(serde_json::json!({"action": "screenshot"}), &ToolContext::default())
            .await;
        assert!(result.error.is_some());
    }
}
