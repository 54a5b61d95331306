//! Persistence traits: keyed session storage and append-only logs.
//!
//! Everything persisted is wrapped in a self-describing [`Envelope`] so a
//! reader can tell a record it understands from a corrupt or foreign one
//! and skip the latter without failing.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use crate::error::MemoryError;

/// Keyed storage for small per-session blobs (episodes, buffers, stats).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>, MemoryError>;

    async fn put(&self, key: &str, value: String) -> Result<(), MemoryError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, MemoryError>;

    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, MemoryError>;
}

/// Append-only record streams (reflections, policy violations).
#[async_trait]
pub trait LogStore: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, stream: &str, record: String) -> Result<(), MemoryError>;

    /// Every record of the stream in append order. Unreadable lines are the
    /// caller's concern; backends return them verbatim.
    async fn read_all(&self, stream: &str) -> Result<Vec<String>, MemoryError>;
}

/// Self-describing wrapper for persisted records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub schema: String,
    pub version: u32,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn encode<T: Serialize>(schema: &str, version: u32, payload: &T) -> Result<String, MemoryError> {
        let envelope = Envelope {
            schema: schema.to_string(),
            version,
            payload: serde_json::to_value(payload)
                .map_err(|e| MemoryError::Storage(format!("Failed to serialize {schema}: {e}")))?,
        };
        serde_json::to_string(&envelope)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize {schema}: {e}")))
    }

    /// Decode a record, rejecting anything that is not exactly
    /// `schema` at `version`.
    pub fn decode<T: DeserializeOwned>(raw: &str, schema: &str, version: u32) -> Result<T, MemoryError> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| MemoryError::Corruption(format!("unreadable envelope: {e}")))?;
        if envelope.schema != schema {
            return Err(MemoryError::Corruption(format!(
                "expected schema '{schema}', found '{}'",
                envelope.schema
            )));
        }
        if envelope.version != version {
            return Err(MemoryError::Corruption(format!(
                "unsupported {schema} version {} (expected {version})",
                envelope.version
            )));
        }
        serde_json::from_value(envelope.payload)
            .map_err(|e| MemoryError::Corruption(format!("invalid {schema} payload: {e}")))
    }
}
