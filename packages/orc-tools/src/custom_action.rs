//! The `custom_action` tool: replays a pre-recorded sequence of `computer`
//! actions against the current session, short-circuiting the model for
//! steps that are always the same (e.g. "dismiss the onboarding dialog").

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::computer::ComputerTool;
use crate::tool::{ToolContext, ToolResult, ToolSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedStep {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct CustomActionTool {
    pub name: String,
    pub steps: Vec<RecordedStep>,
    computer: Arc<ComputerTool>,
}

impl CustomActionTool {
    pub fn new(name: impl Into<String>, steps: Vec<RecordedStep>, computer: Arc<ComputerTool>) -> Self {
        Self { name: name.into(), steps, computer }
    }
}

#[async_trait]
impl ToolSpec for CustomActionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Runs a pre-recorded, deterministic sequence of computer actions"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    fn required_params(&self) -> &[&'static str] {
        &[]
    }

    async fn execute(&self, _input: serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let mut combined = ToolResult::default();
        for step in &self.steps {
            let mut action_input = step.params.as_object().cloned().unwrap_or_default();
            action_input.insert("action".to_string(), serde_json::Value::String(step.action.clone()));
            let result = self.computer.execute(serde_json::Value::Object(action_input), ctx).await;

            if result.error.is_some() {
                return result;
            }
            combined.output = match (combined.output.take(), result.output) {
                (Some(a), Some(b)) => Some(format!("{a}\n{b}")),
                (a, b) => a.or(b),
            };
            combined.base64_image = result.base64_image.or(combined.base64_image.take());
        }
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computer::ComputerToolVersion;

    #[tokio::test]
    async fn runs_without_a_session_reports_the_first_failure() {
        let computer = Arc::new(ComputerTool::new(ComputerToolVersion::V20250124, 1024, 768));
        let tool = CustomActionTool::new(
            "dismiss_onboarding",
            vec![RecordedStep { action: "left_click".to_string(), params: serde_json::json!({"coordinate": [10, 10]}) }],
            computer,
        );
        let result = tool.execute(serde_json::Value::Null, &ToolContext::default()).await;
        assert!(result.error.is_some());
    }
}
