//! In-memory keyword retriever over pre-chunked documents.
//!
//! Chunks are loaded from a JSONL file, one [`RetrievedChunk`] per line:
//!
//! ```json
//! {"content": "Rust's ownership system...", "metadata": {"source": "rust.md"}}
//! ```
//!
//! Scoring is the fraction of query keywords present in the chunk.

use async_trait::async_trait;
use routewise_core::error::MemoryError;
use routewise_core::retrieval::{RetrievedChunk, Retriever};
use routewise_memory::text::{keywords, tokenize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

struct IndexedChunk {
    chunk: RetrievedChunk,
    tokens: HashSet<String>,
}

pub struct InMemoryRetriever {
    chunks: Vec<IndexedChunk>,
}

impl InMemoryRetriever {
    pub fn from_chunks(chunks: Vec<RetrievedChunk>) -> Self {
        let chunks = chunks
            .into_iter()
            .map(|chunk| IndexedChunk {
                tokens: tokenize(&chunk.content).into_iter().collect(),
                chunk,
            })
            .collect();
        Self { chunks }
    }

    /// Load chunks from a JSONL file. A missing file yields an empty index;
    /// unparseable lines are skipped.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No document corpus found");
                return Ok(Self::from_chunks(Vec::new()));
            }
            Err(e) => return Err(MemoryError::Storage(e.to_string())),
        };

        let mut chunks = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RetrievedChunk>(line) {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping malformed document chunk"
                ),
            }
        }
        debug!(path = %path.display(), chunks = chunks.len(), "Document corpus loaded");
        Ok(Self::from_chunks(chunks))
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, MemoryError> {
        let query_words = keywords(query);
        if query_words.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(i, indexed)| {
                let hits = query_words.iter().filter(|w| indexed.tokens.contains(*w)).count();
                (hits > 0).then(|| (i, hits as f32 / query_words.len() as f32))
            })
            .collect();
        // Stable sort keeps corpus order among equal scores.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, score)| RetrievedChunk {
                score,
                ..self.chunks[i].chunk.clone()
            })
            .collect())
    }

    async fn count(&self) -> Result<usize, MemoryError> {
        Ok(self.chunks.len())
    }
}
