//! The tool registry (component D): named executors with a JSON schema,
//! dispatched generically by [`tool::ToolRegistry`].

pub mod computer;
pub mod custom_action;
pub mod extraction;
pub mod schema;
pub mod tool;
pub mod ui_not_as_expected;

pub use computer::{ComputerTool, ComputerToolVersion};
pub use custom_action::{CustomActionTool, RecordedStep};
pub use extraction::ExtractionTool;
pub use tool::{ToolContext, ToolRegistry, ToolResult, ToolSpec};
pub use ui_not_as_expected::UiNotAsExpectedTool;
