//! Built-in capabilities for Routewise.
//!
//! - `calculator`: arithmetic pulled out of natural-language queries
//! - `reasoner`: picks a capability for a query (the routing fallback)
//! - `summarizer`: extractive digests for memory eviction and episodes
//! - `document_search`: passages from a [`Retriever`]

pub mod calculator;
pub mod document_search;
pub mod reasoner;
pub mod retriever;
pub mod summarizer;

use routewise_core::capability::CapabilityRegistry;
use routewise_core::error::CapabilityError;
use routewise_core::retrieval::Retriever;
use std::sync::Arc;

pub use calculator::CalculatorTool;
pub use document_search::DocumentSearchCapability;
pub use reasoner::KeywordReasoner;
pub use retriever::InMemoryRetriever;
pub use summarizer::ExtractiveSummarizer;

/// Create a registry with every built-in capability.
///
/// `document_search` is only registered when a retriever is supplied.
pub fn default_registry(retriever: Option<Arc<dyn Retriever>>) -> Result<CapabilityRegistry, CapabilityError> {
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(CalculatorTool))?;
    if let Some(retriever) = retriever {
        registry.register(Arc::new(DocumentSearchCapability::new(retriever)))?;
    }
    registry.register(Arc::new(ExtractiveSummarizer))?;
    registry.register(Arc::new(KeywordReasoner))?;
    Ok(registry)
}
