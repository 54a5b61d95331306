//! Error types for the Routewise domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum. [`ErrorKind`] is the
//! machine-readable classification carried by every failed outcome.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Routewise operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Capability errors ---
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Policy errors ---
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    #[error("Capability not found: {0}")]
    NotFound(String),

    #[error("Capability already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Capability timed out: {name} after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("Capability execution failed: {name}: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Invalid capability arguments: {0}")]
    InvalidArguments(String),

    #[error("Capability unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt record: {0}")]
    Corruption(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to parse policy set: {0}")]
    Parse(String),

    #[error("Invalid rule '{rule_id}': {reason}")]
    InvalidRule { rule_id: String, reason: String },

    #[error("Duplicate rule id: {0}")]
    DuplicateRule(String),

    #[error("Rule not found: {0}")]
    NotFound(String),
}

/// Machine-readable failure classification.
///
/// Every failure is converted into one of these at the boundary where it is
/// produced; callers branch on the kind, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PolicyViolation,
    Throttled,
    CapabilityNotFound,
    CapabilityTimeout,
    CapabilityExecutionError,
    MemoryCorruption,
    IterationLimitExceeded,
    Busy,
    Cancelled,
    RequestTimeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::Throttled => "throttled",
            ErrorKind::CapabilityNotFound => "capability_not_found",
            ErrorKind::CapabilityTimeout => "capability_timeout",
            ErrorKind::CapabilityExecutionError => "capability_execution_error",
            ErrorKind::MemoryCorruption => "memory_corruption",
            ErrorKind::IterationLimitExceeded => "iteration_limit_exceeded",
            ErrorKind::Busy => "busy",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RequestTimeout => "request_timeout",
        }
    }

    /// Whether a caller may retry the same request later.
    ///
    /// `CapabilityExecutionError` reports `false` here: only the orchestrator
    /// knows whether the failing capability is idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Throttled
                | ErrorKind::CapabilityNotFound
                | ErrorKind::CapabilityTimeout
                | ErrorKind::Busy
                | ErrorKind::RequestTimeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&CapabilityError> for ErrorKind {
    fn from(err: &CapabilityError) -> Self {
        match err {
            CapabilityError::NotFound(_) | CapabilityError::Unavailable(_) => {
                ErrorKind::CapabilityNotFound
            }
            CapabilityError::Timeout { .. } => ErrorKind::CapabilityTimeout,
            CapabilityError::AlreadyRegistered(_)
            | CapabilityError::ExecutionFailed { .. }
            | CapabilityError::InvalidArguments(_) => ErrorKind::CapabilityExecutionError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_error_displays_correctly() {
        let err = Error::Capability(CapabilityError::Timeout {
            name: "web_search".into(),
            timeout_ms: 30_000,
        });
        assert!(err.to_string().contains("web_search"));
        assert!(err.to_string().contains("30000ms"));
    }

    #[test]
    fn policy_error_displays_correctly() {
        let err = Error::Policy(PolicyError::InvalidRule {
            rule_id: "block-shell".into(),
            reason: "bad regex".into(),
        });
        assert!(err.to_string().contains("block-shell"));
        assert!(err.to_string().contains("bad regex"));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PolicyViolation).unwrap();
        assert_eq!(json, "\"policy_violation\"");
        let back: ErrorKind = serde_json::from_str("\"capability_timeout\"").unwrap();
        assert_eq!(back, ErrorKind::CapabilityTimeout);
    }

    #[test]
    fn retryability_follows_kind() {
        assert!(!ErrorKind::PolicyViolation.is_retryable());
        assert!(ErrorKind::CapabilityTimeout.is_retryable());
        assert!(ErrorKind::CapabilityNotFound.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn capability_error_maps_to_kind() {
        let kind = ErrorKind::from(&CapabilityError::NotFound("x".into()));
        assert_eq!(kind, ErrorKind::CapabilityNotFound);
        let kind = ErrorKind::from(&CapabilityError::ExecutionFailed {
            name: "x".into(),
            reason: "boom".into(),
        });
        assert_eq!(kind, ErrorKind::CapabilityExecutionError);
    }
}
