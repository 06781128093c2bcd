//! Turn state machine.

use storage::EventKind;

/// What the model is currently streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Think,
    Call,
    Respond,
}

/// Lifecycle of one turn.
///
/// `AwaitingModel → Streaming → Executing → AwaitingModel → … → TurnComplete`.
/// `TurnComplete` is reachable from every state and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    AwaitingModel,
    Streaming(Phase),
    Executing,
    TurnComplete,
}

impl TurnState {
    /// Advance on a model-sourced event.
    pub fn observe(&mut self, kind: &EventKind) {
        if *self == Self::TurnComplete {
            return;
        }
        *self = match kind {
            EventKind::Think(_) => Self::Streaming(Phase::Think),
            EventKind::Call(_) => Self::Streaming(Phase::Call),
            EventKind::Respond(_) => Self::Streaming(Phase::Respond),
            EventKind::Execute => Self::Executing,
            EventKind::End => Self::TurnComplete,
            _ => *self,
        };
    }

    /// Start the next model pass after a batch executed.
    pub fn resume(&mut self) {
        if *self != Self::TurnComplete {
            *self = Self::AwaitingModel;
        }
    }

    pub fn complete(&mut self) {
        *self = Self::TurnComplete;
    }

    pub fn is_complete(&self) -> bool {
        *self == Self::TurnComplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use storage::ToolCall;

    #[test]
    fn full_cycle() {
        let mut state = TurnState::default();
        state.observe(&EventKind::Think("x".into()));
        assert_eq!(state, TurnState::Streaming(Phase::Think));
        state.observe(&EventKind::Call(ToolCall::new("list", Map::new())));
        assert_eq!(state, TurnState::Streaming(Phase::Call));
        state.observe(&EventKind::Execute);
        assert_eq!(state, TurnState::Executing);
        state.resume();
        assert_eq!(state, TurnState::AwaitingModel);
        state.observe(&EventKind::Respond("done".into()));
        state.observe(&EventKind::End);
        assert!(state.is_complete());
    }

    #[test]
    fn complete_is_terminal() {
        let mut state = TurnState::Executing;
        state.complete();
        state.resume();
        state.observe(&EventKind::Think("late".into()));
        assert_eq!(state, TurnState::TurnComplete);
    }
}
