//! Conversation turn domain types.
//!
//! Turns are the value objects conversation memory stores and the
//! episodic store summarizes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::ErrorKind;

/// The role of a turn's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The agent's answer
    Assistant,
    /// Injected context or notices
    System,
}

impl Role {
    /// Label used when rendering context blocks.
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

/// A single turn in a session's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Monotonic per-session sequence number.
    pub seq: u64,

    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,

    /// Capabilities invoked to produce this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<String>,

    /// Sources cited by this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,

    /// Set on error turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl ConversationTurn {
    pub fn new(seq: u64, role: Role, content: impl Into<String>) -> Self {
        Self {
            seq,
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            sources: Vec::new(),
            error: None,
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<String>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_error(mut self, kind: ErrorKind) -> Self {
        self.error = Some(kind);
        self
    }

    /// `User: ...` style line for prompts and context blocks.
    pub fn render(&self) -> String {
        format!("{}: {}", self.role.label(), self.content)
    }
}

/// A turn not yet admitted to memory (no sequence number assigned).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDraft {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub error: Option<ErrorKind>,
}

impl TurnDraft {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            sources: Vec::new(),
            error: None,
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<String>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_error(mut self, kind: ErrorKind) -> Self {
        self.error = Some(kind);
        self
    }

    pub fn into_turn(self, seq: u64) -> ConversationTurn {
        ConversationTurn {
            seq,
            role: self.role,
            content: self.content,
            timestamp: Utc::now(),
            tool_calls: self.tool_calls,
            sources: self.sources,
            error: self.error,
        }
    }
}
