//! Tool abstraction shared by every executor in this crate.
//!
//! Tools here trade the teacher's typed `Tool::Args` for a dynamic
//! `serde_json::Value` input: the action vocabulary (`computer`) and the
//! extraction schema (`extraction`) are only known at job-construction time,
//! not at compile time, so schema validation happens once, generically, in
//! [`ToolRegistry::dispatch`] rather than per-tool via a derived type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a live session looks like from a tool's point of view.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub container_ip: Option<String>,
    /// The active API version's inferred response schema, for `extraction`.
    pub response_schema: Option<serde_json::Value>,
}

/// Mirrors the teacher-adjacent Python `ToolResult` dataclass: at most one
/// of these fields carries content, `system` is a short human note distinct
/// from `output`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub output: Option<String>,
    pub error: Option<String>,
    pub base64_image: Option<String>,
    pub system: Option<String>,
}

impl ToolResult {
    pub fn output(text: impl Into<String>) -> Self {
        Self { output: Some(text.into()), ..Default::default() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { error: Some(text.into()), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_none() && self.error.is_none() && self.base64_image.is_none() && self.system.is_none()
    }
}

/// A named capability with a JSON schema and an async executor.
#[async_trait]
pub trait ToolSpec: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    /// Required top-level keys of `input_schema`; enforced generically by
    /// the registry so individual tools never need to reject bad input.
    fn required_params(&self) -> &[&'static str];
    async fn execute(&self, input: serde_json::Value, ctx: &ToolContext) -> ToolResult;
}

/// The set of tools a job's `tool_version` makes available, keyed by name.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn ToolSpec>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Box<dyn ToolSpec>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolSpec> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn definitions(&self) -> Vec<(String, String, serde_json::Value)> {
        self.tools
            .values()
            .map(|t| (t.name().to_string(), t.description().to_string(), t.input_schema()))
            .collect()
    }

    /// Validate required parameters, then execute. A missing parameter
    /// never fails the job (§4.4): it produces a `ToolResult` instructing
    /// the model to retry with corrected input.
    pub async fn dispatch(&self, name: &str, input: serde_json::Value) -> ToolResult {
        self.dispatch_with(name, input, &ToolContext::default()).await
    }

    pub async fn dispatch_with(&self, name: &str, input: serde_json::Value, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::output(format!(
                "The tool {name} failed! Reason: no such tool is registered. Please fix the input and try again."
            ));
        };

        let missing: Vec<&str> = tool
            .required_params()
            .iter()
            .filter(|key| {
                input
                    .as_object()
                    .and_then(|obj| obj.get(**key))
                    .is_none()
            })
            .copied()
            .collect();

        if !missing.is_empty() {
            return ToolResult::output(format!(
                "The tool {name} failed! Reason: missing required parameter(s) {}. Please fix the input and try again.",
                missing.join(", ")
            ));
        }

        tool.execute(input, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
