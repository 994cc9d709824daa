//! Core vocabulary shared by every machine in the orchestrator.
//!
//! The orchestrator separates **facts** from **intent**, the same split the
//! scheduler and the sampling loop both rely on:
//! - [`Event`] = a fact that already happened (a job was claimed, a tool
//!   returned a result, a lease expired).
//! - [`Command`] = intent to perform IO (call the provider, execute a tool,
//!   persist a message).
//!
//! Machines (see [`crate::machine::Machine`]) only ever see events and only
//! ever produce commands. They never touch a database handle or an HTTP
//! client directly; that keeps the decision logic testable without mocking
//! network calls.

use std::any::Any;
use std::fmt;

use uuid::Uuid;

/// Marker trait for facts that have already happened.
///
/// Events carry no execution authority; a machine reacting to an event
/// cannot "undo" it, only decide what intent follows from it.
pub trait Event: Any + Send + Sync + 'static {}

/// Marker trait for requests to perform IO.
///
/// One command corresponds to one unit of work with its own failure mode
/// (a provider call, a tool dispatch, a database write). Commands never
/// batch unrelated side effects together.
pub trait Command: Any + Send + Sync + 'static {}

/// Correlates events and commands belonging to the same job execution.
///
/// Every log line, message, and provider exchange recorded for a job
/// carries the job's correlation id so a crash-restart can reconstruct
/// exactly where the loop left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel for events not tied to any job (maintenance, monitor ticks).
    pub const NONE: Self = Self(Uuid::nil());

    /// Mint a fresh correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
