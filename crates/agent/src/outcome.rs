//! What the orchestrator hands back to callers.

use routewise_core::error::ErrorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::StateTrace;

/// A completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub request_id: String,
    pub session_id: String,

    /// Final answer, including the source list when there is one.
    pub answer: String,
    pub sources: Vec<String>,

    /// Capabilities that ran, in execution order.
    pub capabilities: Vec<String>,

    /// Set when the pipeline stopped early (iteration cap, failed chain hop).
    pub partial: bool,

    /// Policy warnings and partial-result notes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    pub trace: StateTrace,
    pub duration_ms: u64,
}

/// A request that ended in `ERROR`.
///
/// `message` is the user-visible text: policy denials carry the rule's
/// message verbatim, everything else a generic sentence naming the kind.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{}: {}", .kind.as_str(), .message)]
pub struct TaskFailure {
    pub request_id: String,
    pub session_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub trace: StateTrace,
}

impl TaskFailure {
    /// Generic user-visible text for non-policy failures.
    pub fn generic_message(kind: ErrorKind) -> String {
        match kind {
            ErrorKind::Busy => "This session is busy with another request; try again shortly.".into(),
            ErrorKind::Cancelled => "The request was cancelled.".into(),
            ErrorKind::Throttled => "Too many requests right now; try again later.".into(),
            _ => format!("The request could not be completed ({}).", kind.as_str()),
        }
    }
}

pub type TaskResult = Result<TaskOutcome, TaskFailure>;
