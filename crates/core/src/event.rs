//! Domain event system: decoupled communication between bounded contexts.
//!
//! Events are published when something interesting happens in the system.
//! Other components can subscribe to react without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A request entered the orchestrator
    RequestReceived {
        session_id: String,
        request_id: String,
        query_preview: String,
        timestamp: DateTime<Utc>,
    },

    /// The orchestrator moved to a new state
    StateEntered {
        session_id: String,
        request_id: String,
        state: String,
        timestamp: DateTime<Utc>,
    },

    /// A capability was executed
    CapabilityExecuted {
        session_id: String,
        capability: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A policy rule blocked or flagged a request
    PolicyViolation {
        session_id: String,
        rule_id: String,
        action: String,
        timestamp: DateTime<Utc>,
    },

    /// A reflection was recorded
    ReflectionRecorded {
        session_id: String,
        kind: String,
        score: Option<u8>,
        timestamp: DateTime<Utc>,
    },

    /// A session was finalized into an episode
    SessionFinalized {
        session_id: String,
        turns: usize,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Components can subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
