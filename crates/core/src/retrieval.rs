//! Retriever trait: similarity search over pre-chunked documents.
//!
//! Only the `document_search` capability talks to a retriever; the
//! orchestrator never does.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::MemoryError;

/// One chunk returned by a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub score: f32,
}

impl RetrievedChunk {
    /// The `source` metadata field, if present.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(|v| v.as_str())
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `k` chunks, best first.
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, MemoryError>;

    /// Number of indexed chunks.
    async fn count(&self) -> Result<usize, MemoryError>;
}
