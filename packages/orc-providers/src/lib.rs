//! Canonical content-block vocabulary (§4.3) and the provider handlers that
//! translate it to/from a specific VLM API.

pub mod anthropic;
pub mod content;
pub mod handler;
pub mod keys;
pub mod opencua;
pub mod openai;

pub use anthropic::AnthropicHandler;
pub use content::{CacheControl, ContentBlock, Message, Role, StopReason, Usage};
pub use handler::{ExecuteRequest, ExecuteResponse, HandlerError, Provider, ProviderHandler, ProviderSettings, ToolDefinition};
pub use keys::normalize_key_combo;
pub use opencua::OpenCuaHandler;
pub use openai::OpenAiHandler;
