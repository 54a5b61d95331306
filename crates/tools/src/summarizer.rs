//! Extractive summarizer capability.
//!
//! Given `turns` (serialized conversation turns) it produces the
//! `User asked about: ...` digest; given plain `query`/`text` it keeps the
//! leading sentences.

use async_trait::async_trait;
use routewise_core::capability::{Capability, CapabilityOutput};
use routewise_core::message::ConversationTurn;
use routewise_memory::text::{leading_sentences, summarize_turns};

const MAX_SENTENCES: usize = 3;

pub struct ExtractiveSummarizer;

#[async_trait]
impl Capability for ExtractiveSummarizer {
    fn name(&self) -> &str {
        "summarizer"
    }

    fn description(&self) -> &str {
        "Summarize long text or a conversation into a short digest."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Text to summarize" },
                "turns": { "type": "array", "description": "Conversation turns to digest" }
            }
        })
    }

    async fn execute(&self, parameters: serde_json::Value) -> CapabilityOutput {
        if let Some(raw) = parameters.get("turns").filter(|t| t.is_array()) {
            return match serde_json::from_value::<Vec<ConversationTurn>>(raw.clone()) {
                Ok(turns) => CapabilityOutput::ok(summarize_turns(&turns)),
                Err(e) => CapabilityOutput::failure(format!("Invalid 'turns' argument: {e}")),
            };
        }

        let text = parameters["query"]
            .as_str()
            .or_else(|| parameters["text"].as_str())
            .unwrap_or("");
        if text.trim().is_empty() {
            return CapabilityOutput::failure("Nothing to summarize");
        }
        CapabilityOutput::ok(leading_sentences(text, MAX_SENTENCES))
    }
}
