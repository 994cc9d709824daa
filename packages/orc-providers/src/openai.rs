//! The OpenAI Chat Completions handler: flattens the `computer` tool into
//! one function per action and recollapses responses back into a single
//! canonical `tool_use name="computer"` block (§4.3).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::content::{ContentBlock, Role, StopReason, Usage};
use crate::handler::{ExecuteRequest, ExecuteResponse, HandlerError, Provider, ProviderHandler};
use crate::keys::normalize_key_combo;

const COMPUTER_ACTIONS: &[&str] = &[
    "screenshot", "left_click", "mouse_move", "type", "key", "scroll", "left_click_drag",
    "right_click", "middle_click", "double_click", "left_mouse_down", "left_mouse_up", "hold_key", "wait",
];

pub struct OpenAiHandler {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiHandler {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), api_key: api_key.into(), base_url: "https://api.openai.com/v1/chat/completions".to_string() }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

/// Flatten the `computer` tool's action vocabulary into one function
/// definition per action, and every non-`computer` tool through unchanged.
fn flatten_tool_definitions(tools: &[crate::handler::ToolDefinition]) -> Vec<serde_json::Value> {
    let mut flattened = Vec::new();
    for tool in tools {
        if tool.name != "computer" {
            flattened.push(serde_json::json!({
                "type": "function",
                "function": {"name": tool.name, "description": tool.description, "parameters": tool.input_schema},
            }));
            continue;
        }
        for action in COMPUTER_ACTIONS {
            flattened.push(serde_json::json!({
                "type": "function",
                "function": {
                    "name": action,
                    "description": format!("Computer action: {action}"),
                    "parameters": tool.input_schema,
                },
            }));
        }
    }
    flattened
}

/// Converts canonical history into Chat Completions messages, keeping every
/// `tool_result` immediately after the assistant turn whose `tool_calls`
/// produced it (no user messages interleaved, per §4.3).
fn to_chat_messages(history: &[crate::content::Message]) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    for message in history {
        match message.role {
            Role::Assistant => {
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text: t, .. } => text.push_str(t),
                        ContentBlock::ToolUse { id, name, input, .. } => {
                            tool_calls.push(serde_json::json!({
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": serde_json::to_string(input).unwrap_or_default()},
                            }));
                        }
                        _ => {}
                    }
                }
                out.push(ChatMessage {
                    role: "assistant",
                    content: if text.is_empty() { None } else { Some(text) },
                    tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                    tool_call_id: None,
                });
            }
            Role::User => {
                for block in &message.content {
                    match block {
                        ContentBlock::ToolResult { tool_use_id, content, error, .. } => {
                            let text = error.clone().unwrap_or_else(|| {
                                content
                                    .iter()
                                    .filter_map(|b| match b {
                                        ContentBlock::Text { text, .. } => Some(text.clone()),
                                        _ => None,
                                    })
                                    .collect::<Vec<_>>()
                                    .join("\n")
                            });
                            out.push(ChatMessage { role: "tool", content: Some(text), tool_calls: None, tool_call_id: Some(tool_use_id.clone()) });
                        }
                        ContentBlock::Text { text, .. } => {
                            out.push(ChatMessage { role: "user", content: Some(text.clone()), tool_calls: None, tool_call_id: None });
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    id: String,
    function: ChatFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

fn map_finish_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        Some("stop") => StopReason::EndTurn,
        _ => StopReason::EndTurn,
    }
}

/// Recollapse one action-named function call into a canonical
/// `tool_use name="computer"` block with normalized keys/coordinates.
fn recollapse_tool_call(call: &ChatToolCall) -> ContentBlock {
    let mut input: serde_json::Value = serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::json!({}));
    let name = if COMPUTER_ACTIONS.contains(&call.function.name.as_str()) {
        if let Some(obj) = input.as_object_mut() {
            obj.insert("action".to_string(), serde_json::Value::String(call.function.name.clone()));
            if let Some(serde_json::Value::String(text)) = obj.get("text").cloned() {
                obj.insert("text".to_string(), serde_json::Value::String(normalize_key_combo(&text)));
            }
        }
        "computer".to_string()
    } else {
        call.function.name.clone()
    };
    ContentBlock::tool_use(call.id.clone(), name, input)
}

#[async_trait]
impl ProviderHandler for OpenAiHandler {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn execute(&self, request: ExecuteRequest<'_>) -> Result<ExecuteResponse, HandlerError> {
        let mut messages = vec![ChatMessage { role: "system", content: Some(request.system.to_string()), tool_calls: None, tool_call_id: None }];
        messages.extend(to_chat_messages(request.history));

        let body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
            "tools": flatten_tool_definitions(request.tools),
        });

        let response = self.client.post(&self.base_url).bearer_auth(&self.api_key).json(&body).send().await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::warn!("openai API rejected credentials");
            return Err(HandlerError::Unauthorized);
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| HandlerError::Decode(e.to_string()))?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| HandlerError::Decode("no choices returned".to_string()))?;

        let mut content = Vec::new();
        if let Some(text) = choice.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::text(text));
            }
        }
        for call in &choice.message.tool_calls {
            content.push(recollapse_tool_call(call));
        }

        Ok(ExecuteResponse {
            content,
            stop_reason: map_finish_reason(choice.finish_reason.as_deref()),
            usage: Usage { input_tokens: parsed.usage.prompt_tokens, output_tokens: parsed.usage.completion_tokens, ..Default::default() },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("stop")), StopReason::EndTurn);
        assert_eq!(map_finish_reason(Some("tool_calls")), StopReason::ToolUse);
        assert_eq!(map_finish_reason(Some("length")), StopReason::MaxTokens);
    }

    #[test]
    fn recollapses_action_function_into_computer_tool_use() {
        let call = ChatToolCall { id: "call_1".to_string(), function: ChatFunctionCall { name: "left_click".to_string(), arguments: r#"{"coordinate": [1, 2]}"#.to_string() } };
        let block = recollapse_tool_call(&call);
        match block {
            ContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "computer");
                assert_eq!(input["action"], "left_click");
            }
            _ => panic!("expected tool_use"),
        }
    }

    #[test]
    fn normalizes_key_text_on_recollapse() {
        let call = ChatToolCall { id: "call_2".to_string(), function: ChatFunctionCall { name: "key".to_string(), arguments: r#"{"text": "cmd"}"#.to_string() } };
        let block = recollapse_tool_call(&call);
        match block {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input["text"], "Super_L"),
            _ => panic!("expected tool_use"),
        }
    }
}
