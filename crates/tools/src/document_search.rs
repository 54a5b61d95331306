//! Document search capability: the only path from the agent to a
//! [`Retriever`].

use async_trait::async_trait;
use routewise_core::capability::{Capability, CapabilityOutput};
use routewise_core::retrieval::Retriever;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_K: usize = 4;
const MAX_K: usize = 20;

pub struct DocumentSearchCapability {
    retriever: Arc<dyn Retriever>,
}

impl DocumentSearchCapability {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Capability for DocumentSearchCapability {
    fn name(&self) -> &str {
        "document_search"
    }

    fn description(&self) -> &str {
        "Search indexed documents and return the most relevant passages. Default for general questions."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for"
                },
                "k": {
                    "type": "integer",
                    "description": "Maximum number of passages (default 4)",
                    "default": DEFAULT_K
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, parameters: serde_json::Value) -> CapabilityOutput {
        let Some(query) = parameters["query"].as_str() else {
            return CapabilityOutput::failure("Missing 'query' argument");
        };
        let k = parameters["k"]
            .as_u64()
            .map(|k| (k as usize).min(MAX_K))
            .unwrap_or(DEFAULT_K);

        let chunks = match self.retriever.similarity_search(query, k).await {
            Ok(chunks) => chunks,
            Err(e) => return CapabilityOutput::failure(format!("Retriever '{}' failed: {e}", self.retriever.name())),
        };
        debug!(retriever = self.retriever.name(), hits = chunks.len(), "Document search complete");

        if chunks.is_empty() {
            return CapabilityOutput::ok("No relevant documents found.")
                .with_data(serde_json::json!({ "sources": [], "chunks": [] }));
        }

        let mut sources: Vec<String> = Vec::new();
        let mut lines = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            lines.push(format!("[{}] {}", i + 1, chunk.content.trim()));
            if let Some(source) = chunk.source()
                && !sources.iter().any(|s| s == source)
            {
                sources.push(source.to_string());
            }
        }

        CapabilityOutput::ok(lines.join("\n")).with_data(serde_json::json!({
            "sources": sources,
            "chunks": chunks,
        }))
    }
}
