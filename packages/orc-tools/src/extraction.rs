//! The `extraction` tool: the only way a job reports a successful result.

use async_trait::async_trait;

use crate::schema;
use crate::tool::{ToolContext, ToolResult, ToolSpec};

pub struct ExtractionTool;

#[async_trait]
impl ToolSpec for ExtractionTool {
    fn name(&self) -> &str {
        "extraction"
    }

    fn description(&self) -> &str {
        "Use this tool to return the final JSON result when you've found the information requested by the user."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "data": {"type": "object", "description": "The extracted data to return as JSON"},
            },
            "required": ["data"],
        })
    }

    fn required_params(&self) -> &[&'static str] {
        &["data"]
    }

    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let data = input.get("data").cloned().unwrap_or(serde_json::Value::Null);

        if let Some(response_schema) = &ctx.response_schema {
            if let Err(reason) = schema::validate(response_schema, &data) {
                tracing::debug!(%reason, "extraction rejected by response schema");
                return ToolResult::error(reason);
            }
        }

        ToolResult {
            output: Some(serde_json::to_string_pretty(&data).unwrap_or_default()),
            error: None,
            base64_image: None,
            system: Some("Extraction tool successfully processed the data.".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn valid_data_is_accepted() {
        let tool = ExtractionTool;
        let ctx = ToolContext { response_schema: Some(serde_json::json!({"type": "object", "properties": {"sum": {"type": "integer"}}})), ..Default::default() };
        let result = tool.execute(serde_json::json!({"data": {"sum": 5}}), &ctx).await;
        assert!(result.error.is_none());
        assert!(result.output.is_some());
    }

    #[tokio::test]
    async fn schema_mismatch_is_an_error() {
        let tool = ExtractionTool;
        let ctx = ToolContext { response_schema: Some(serde_json::json!({"type": "object", "properties": {"sum": {"type": "integer"}}})), ..Default::default() };
        let result = tool.execute(serde_json::json!({"data": {"sum": "five"}}), &ctx).await;
        assert!(result.error.is_some());
    }
}
