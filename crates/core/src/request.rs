//! Execution request and result value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::capability::CapabilityOutput;
use crate::error::ErrorKind;

/// A single user request flowing through the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Unique per request; rate-limit ledgers deduplicate on it.
    pub request_id: String,
    pub session_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    pub query: String,

    /// Free-form request context (conversation text, caller metadata).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,

    pub timestamp: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(session_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            user_id: None,
            query: query.into(),
            context: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Rough token estimate of the query (4 bytes per token, rounded up).
    pub fn estimated_tokens(&self) -> u64 {
        (self.query.len() as u64).div_ceil(4)
    }
}

/// The outcome of one capability execution inside a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub capability: String,
    pub success: bool,
    pub output: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ExecutionResult {
    /// Wrap a capability's own output. Unsuccessful outputs are classified
    /// as execution errors.
    pub fn from_output(
        capability: impl Into<String>,
        output: CapabilityOutput,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let measured = (ended_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            capability: capability.into(),
            success: output.success,
            error_kind: (!output.success).then_some(ErrorKind::CapabilityExecutionError),
            output: output.output,
            error: output.error,
            duration_ms: output.duration_ms.max(measured),
            started_at,
            ended_at,
            data: output.data,
        }
    }

    /// A result that never produced capability output (timeout, cancel, missing).
    pub fn failed(
        capability: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let ended_at = Utc::now();
        Self {
            capability: capability.into(),
            success: false,
            output: String::new(),
            error: Some(message.into()),
            error_kind: Some(kind),
            duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
            started_at,
            ended_at,
            data: None,
        }
    }

    /// Source references attached by the capability under `data.sources`.
    pub fn sources(&self) -> Vec<String> {
        self.data
            .as_ref()
            .and_then(|d| d.get("sources"))
            .and_then(|s| s.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
