//! The Sampling Loop (F): the heart of the orchestrator. Loads a job's
//! history, calls a provider handler, dispatches tool calls against a
//! session's sandbox, and drives the job to a terminal status.

pub mod loop_runner;
pub mod prompt;
pub mod state_machine;
pub mod truncation;

pub use loop_runner::{HealthProbe, LoopConfig, LoopRunner, ReqwestHealthProbe};
pub use prompt::{build_extraction_preamble, build_initial_prompt, build_system_prompt, substitute_parameters, EXTRACTION_PREAMBLE_MARKER};
pub use state_machine::{FinalizeReason, LoopCommand, LoopEvent, LoopState, LoopStateMachine};
pub use truncation::{apply_cache_breakpoints, prune_screenshots, TokenCounter};
