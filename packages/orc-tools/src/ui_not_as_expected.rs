//! The `ui_not_as_expected` tool: an intentional pause signal, not an error.
//!
//! The loop (`orc-loop`) is what turns this tool's output into a `paused`
//! job with reason "UI Mismatch Detected" — this tool itself never sets
//! `ToolResult::error`, matching §4.2's "terminate with status paused" rule
//! rather than the generic error path.

use async_trait::async_trait;

use crate::tool::{ToolContext, ToolResult, ToolSpec};

pub struct UiNotAsExpectedTool;

#[async_trait]
impl ToolSpec for UiNotAsExpectedTool {
    fn name(&self) -> &str {
        "ui_not_as_expected"
    }

    fn description(&self) -> &str {
        "Use this tool when the UI doesn't look as expected or when you're unsure about what you're seeing in the screenshot. Provide a clear explanation of what's different and what you expected to see."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "reasoning": {"type": "string", "description": "Detailed explanation of what doesn't match expectations"},
            },
            "required": ["reasoning"],
        })
    }

    fn required_params(&self) -> &[&'static str] {
        &["reasoning"]
    }

    async fn execute(&self, input: serde_json::Value, _ctx: &ToolContext) -> ToolResult {
        let reasoning = input.get("reasoning").and_then(|v| v.as_str()).unwrap_or_default();
        ToolResult {
            output: Some(reasoning.to_string()),
            error: None,
            base64_image: None,
            system: Some("UI Mismatch Detected".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn carries_reasoning_without_setting_error() {
        let tool = UiNotAsExpectedTool;
        let result = tool
            .execute(serde_json::json!({"reasoning": "Login form not visible"}), &ToolContext::default())
            .await;
        assert_eq!(result.output.as_deref(), Some("Login form not visible"));
        assert_eq!(result.system.as_deref(), Some("UI Mismatch Detected"));
        assert!(result.error.is_none());
    }
}
