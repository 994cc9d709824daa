//! Shared event/command/machine vocabulary for the orchestrator.
//!
//! The scheduler and the sampling loop are both, at heart, a small state
//! machine driven by facts that already happened. This crate holds the
//! vocabulary they share so neither has to reinvent it: [`Event`]/[`Command`]
//! as the facts/intent split, [`Machine`] as the pure decision seam, a
//! structured [`OrchestratorError`] taxonomy, and [`StoreError`] for
//! optimistic-concurrency storage operations.

mod core;
mod error;
mod machine;
mod persistence;

pub use crate::core::{Command, CorrelationId, Event};
pub use error::{FailureCategory, OrchestratorError, Result};
pub use machine::Machine;
pub use persistence::StoreError;
