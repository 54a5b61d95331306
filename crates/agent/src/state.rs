//! Orchestrator states and the per-request state trace.

use serde::{Deserialize, Serialize};

/// A state of the request pipeline.
///
/// Every request starts in `Understand` and ends in `Done` or `Error`.
/// `Error` is reachable from `Route`, `PolicyCheck` and `Execute`; the
/// output content check after `Synthesize` may also end there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Understand,
    Route,
    PolicyCheck,
    Execute,
    Synthesize,
    Reflect,
    Done,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Understand => "UNDERSTAND",
            AgentState::Route => "ROUTE",
            AgentState::PolicyCheck => "POLICY_CHECK",
            AgentState::Execute => "EXECUTE",
            AgentState::Synthesize => "SYNTHESIZE",
            AgentState::Reflect => "REFLECT",
            AgentState::Done => "DONE",
            AgentState::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Done | AgentState::Error)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered list of states a request passed through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateTrace(Vec<AgentState>);

impl StateTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, state: AgentState) {
        self.0.push(state);
    }

    pub fn states(&self) -> &[AgentState] {
        &self.0
    }

    pub fn last(&self) -> Option<AgentState> {
        self.0.last().copied()
    }

    pub fn contains(&self, state: AgentState) -> bool {
        self.0.contains(&state)
    }

    /// How many times `state` was entered.
    pub fn count(&self, state: AgentState) -> usize {
        self.0.iter().filter(|s| **s == state).count()
    }
}

impl std::fmt::Display for StateTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.0.iter().map(AgentState::as_str).collect();
        f.write_str(&names.join(" → "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_display_and_counts() {
        let mut trace = StateTrace::new();
        for s in [
            AgentState::Understand,
            AgentState::Route,
            AgentState::PolicyCheck,
            AgentState::Execute,
            AgentState::PolicyCheck,
            AgentState::Execute,
            AgentState::Synthesize,
        ] {
            trace.push(s);
        }
        assert_eq!(trace.count(AgentState::Execute), 2);
        assert_eq!(trace.last(), Some(AgentState::Synthesize));
        assert!(trace.to_string().starts_with("UNDERSTAND → ROUTE → POLICY_CHECK"));
    }

    #[test]
    fn states_serialize_screaming() {
        let json = serde_json::to_string(&AgentState::PolicyCheck).unwrap();
        assert_eq!(json, "\"POLICY_CHECK\"");
        assert!(AgentState::Error.is_terminal());
        assert!(!AgentState::Reflect.is_terminal());
    }
}
