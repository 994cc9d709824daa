//! The sampling loop's control flow as an explicit [`Machine`] (§4.2,
//! REDESIGN FLAGS §9) instead of nested coroutine control flow. The runner
//! in `loop_runner` drives this machine and performs every side effect;
//! `decide` here is pure.

use orc_engine::{Command, Event, Machine};
use orc_providers::StopReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    LoadHistory,
    CallProvider,
    PersistAssistant,
    ExecuteTools,
    CheckCancel,
    Finalize(FinalizeReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    Success,
    NoExtraction,
    Blocking,
    Canceled,
}

#[derive(Debug, Clone)]
pub enum LoopEvent {
    /// History loaded from the store; `pending_tool_use` is true when the
    /// resumption invariant detected a trailing assistant tool_use never
    /// executed (§4.2 "Resumption invariant").
    HistoryLoaded { pending_tool_use: bool },
    ProviderResponded { stop_reason: StopReason, tool_use_count: usize },
    AssistantPersisted { extraction_recorded: bool },
    ToolsExecuted { any_blocking: bool },
    CancelChecked { cancel_requested: bool },
}

impl Event for LoopEvent {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCommand {
    CallProvider,
    PersistAssistant,
    ExecuteTools,
    CheckCancel,
    Finalize(FinalizeReason),
}

impl Command for LoopCommand {}

/// Private state carried between `ProviderResponded` and the
/// `AssistantPersisted` event that follows it, so the decision function
/// stays pure without the runner re-deriving it.
pub struct LoopStateMachine {
    state: LoopState,
    pending_stop_reason: Option<StopReason>,
    pending_tool_use_count: usize,
}

impl LoopStateMachine {
    pub fn new() -> Self {
        Self { state: LoopState::LoadHistory, pending_stop_reason: None, pending_tool_use_count: 0 }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }
}

impl Default for LoopStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for LoopStateMachine {
    type Event = LoopEvent;
    type Command = LoopCommand;

    fn decide(&mut self, event: &LoopEvent) -> Option<LoopCommand> {
        match (self.state, event) {
            (LoopState::LoadHistory, LoopEvent::HistoryLoaded { pending_tool_use }) => {
                if *pending_tool_use {
                    self.state = LoopState::ExecuteTools;
                    Some(LoopCommand::ExecuteTools)
                } else {
                    self.state = LoopState::CallProvider;
                    Some(LoopCommand::CallProvider)
                }
            }
            (LoopState::CallProvider, LoopEvent::ProviderResponded { stop_reason, tool_use_count }) => {
                self.pending_stop_reason = Some(*stop_reason);
                self.pending_tool_use_count = *tool_use_count;
                self.state = LoopState::PersistAssistant;
                Some(LoopCommand::PersistAssistant)
            }
            (LoopState::PersistAssistant, LoopEvent::AssistantPersisted { extraction_recorded }) => {
                if self.pending_tool_use_count > 0 {
                    self.state = LoopState::ExecuteTools;
                    Some(LoopCommand::ExecuteTools)
                } else if self.pending_stop_reason == Some(StopReason::EndTurn) {
                    let reason = if *extraction_recorded { FinalizeReason::Success } else { FinalizeReason::NoExtraction };
                    self.state = LoopState::Finalize(reason);
                    Some(LoopCommand::Finalize(reason))
                } else {
                    self.state = LoopState::CallProvider;
                    Some(LoopCommand::CallProvider)
                }
            }
            (LoopState::ExecuteTools, LoopEvent::ToolsExecuted { any_blocking }) => {
                if *any_blocking {
                    self.state = LoopState::Finalize(FinalizeReason::Blocking);
                    Some(LoopCommand::Finalize(FinalizeReason::Blocking))
                } else {
                    self.state = LoopState::CheckCancel;
                    Some(LoopCommand::CheckCancel)
                }
            }
            (LoopState::CheckCancel, LoopEvent::CancelChecked { cancel_requested }) => {
                if *cancel_requested {
                    self.state = LoopState::Finalize(FinalizeReason::Canceled);
                    Some(LoopCommand::Finalize(FinalizeReason::Canceled))
                } else {
                    self.state = LoopState::CallProvider;
                    Some(LoopCommand::CallProvider)
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumption_skips_straight_to_execute_tools() {
        let mut m = LoopStateMachine::new();
        let cmd = m.decide(&LoopEvent::HistoryLoaded { pending_tool_use: true });
        assert_eq!(cmd, Some(LoopCommand::ExecuteTools));
        assert_eq!(m.state(), LoopState::ExecuteTools);
    }

    #[test]
    fn fresh_history_calls_the_provider() {
        let mut m = LoopStateMachine::new();
        let cmd = m.decide(&LoopEvent::HistoryLoaded { pending_tool_use: false });
        assert_eq!(cmd, Some(LoopCommand::CallProvider));
    }

    #[test]
    fn end_turn_with_no_tools_and_an_extraction_finalizes_success() {
        let mut m = LoopStateMachine::new();
        m.decide(&LoopEvent::HistoryLoaded { pending_tool_use: false });
        m.decide(&LoopEvent::ProviderResponded { stop_reason: StopReason::EndTurn, tool_use_count: 0 });
        let cmd = m.decide(&LoopEvent::AssistantPersisted { extraction_recorded: true });
        assert_eq!(cmd, Some(LoopCommand::Finalize(FinalizeReason::Success)));
    }

    #[test]
    fn end_turn_with_no_tools_and_no_extraction_finalizes_no_extraction() {
        let mut m = LoopStateMachine::new();
        m.decide(&LoopEvent::HistoryLoaded { pending_tool_use: false });
        m.decide(&LoopEvent::ProviderResponded { stop_reason: StopReason::EndTurn, tool_use_count: 0 });
        let cmd = m.decide(&LoopEvent::AssistantPersisted { extraction_recorded: false });
        assert_eq!(cmd, Some(LoopCommand::Finalize(FinalizeReason::NoExtraction)));
    }

    #[test]
    fn tool_use_blocks_route_through_execute_tools() {
        let mut m = LoopStateMachine::new();
        m.decide(&LoopEvent::HistoryLoaded { pending_tool_use: false });
        m.decide(&LoopEvent::ProviderResponded { stop_reason: StopReason::ToolUse, tool_use_count: 2 });
        let cmd = m.decide(&LoopEvent::AssistantPersisted { extraction_recorded: false });
        assert_eq!(cmd, Some(LoopCommand::ExecuteTools));
    }

    #[test]
    fn max_tokens_with_no_tool_use_continues_by_calling_provider_again() {
        let mut m = LoopStateMachine::new();
        m.decide(&LoopEvent::HistoryLoaded { pending_tool_use: false });
        m.decide(&LoopEvent::ProviderResponded { stop_reason: StopReason::MaxTokens, tool_use_count: 0 });
        let cmd = m.decide(&LoopEvent::AssistantPersisted { extraction_recorded: false });
        assert_eq!(cmd, Some(LoopCommand::CallProvider));
    }

    #[test]
    fn blocking_tool_result_skips_cancel_check_and_finalizes() {
        let mut m = LoopStateMachine::new();
        m.decide(&LoopEvent::HistoryLoaded { pending_tool_use: true });
        let cmd = m.decide(&LoopEvent::ToolsExecuted { any_blocking: true });
        assert_eq!(cmd, Some(LoopCommand::Finalize(FinalizeReason::Blocking)));
    }

    #[test]
    fn cancel_observed_after_tools_finalizes_canceled() {
        let mut m = LoopStateMachine::new();
        m.decide(&LoopEvent::HistoryLoaded { pending_tool_use: true });
        m.decide(&LoopEvent::ToolsExecuted { any_blocking: false });
        let cmd = m.decide(&LoopEvent::CancelChecked { cancel_requested: true });
        assert_eq!(cmd, Some(LoopCommand::Finalize(FinalizeReason::Canceled)));
    }
}
