//! Conversation memory: bounded per-session turn buffers with a rolling
//! summary.
//!
//! Each session keeps at most `window_size` turns. When a new turn would
//! overflow the window, every turn older than the `retain_recent` most
//! recent ones is compressed into the session summary (one summarization
//! call per overflow) and evicted.
//!
//! Buffers are optionally written through to a [`SessionStore`] under
//! `conversation:{session_id}` and lazily reloaded, so context survives a
//! restart. An unreadable snapshot is skipped and the session starts empty.

use routewise_core::capability::Capability;
use routewise_core::message::{ConversationTurn, Role, TurnDraft};
use routewise_core::store::{Envelope, SessionStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::text::{keep_tail, summarize_turns};

const SCHEMA: &str = "conversation_buffer";
const VERSION: u32 = 1;
const KEY_PREFIX: &str = "conversation:";

/// Upper bound on the rolling summary; older summary text is dropped first.
const MAX_SUMMARY_CHARS: usize = 2_000;

/// Persisted state of one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionBuffer {
    pub turns: VecDeque<ConversationTurn>,
    #[serde(default)]
    pub summary: Option<String>,
    pub next_seq: u64,
    #[serde(default)]
    pub summarizations: u64,
    #[serde(default)]
    pub total_turns: u64,
}

struct Slot {
    buffer: SessionBuffer,
    loaded: bool,
}

/// Per-session statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationStats {
    pub session_id: String,
    pub turns_in_window: usize,
    pub total_turns: u64,
    pub summarizations: u64,
    pub has_summary: bool,
    /// Rough token count of the window (4 bytes per token)
    pub approx_tokens: usize,
}

pub struct ConversationMemory {
    window_size: usize,
    retain_recent: usize,
    summarizer: Option<Arc<dyn Capability>>,
    store: Option<Arc<dyn SessionStore>>,
    sessions: RwLock<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl ConversationMemory {
    /// `retain_recent` is clamped below `window_size`.
    pub fn new(window_size: usize, retain_recent: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            retain_recent: retain_recent.min(window_size - 1),
            summarizer: None,
            store: None,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Capability>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Append a turn, assigning the next sequence number for the session.
    pub async fn add_turn(&self, session_id: &str, draft: TurnDraft) -> ConversationTurn {
        let slot = self.slot(session_id);
        let mut slot = slot.lock().await;
        self.ensure_loaded(session_id, &mut slot).await;

        let buffer = &mut slot.buffer;
        let turn = draft.into_turn(buffer.next_seq);
        buffer.next_seq += 1;
        buffer.total_turns += 1;
        buffer.turns.push_back(turn.clone());

        if buffer.turns.len() > self.window_size {
            let evict = buffer.turns.len() - self.retain_recent;
            let evicted: Vec<ConversationTurn> = buffer.turns.drain(..evict).collect();
            let part = self.summarize(session_id, &evicted).await;
            buffer.summary = Some(match buffer.summary.take() {
                Some(previous) => keep_tail(&format!("{previous}\n{part}"), MAX_SUMMARY_CHARS),
                None => part,
            });
            buffer.summarizations += 1;
            debug!(
                session_id,
                evicted = evicted.len(),
                retained = buffer.turns.len(),
                "Conversation window compressed"
            );
        }

        // Written under the session lock so snapshots land in turn order.
        self.persist(session_id, &slot.buffer).await;
        turn
    }

    /// Summary block (if any) followed by the formatted recent turns.
    pub async fn get_context(&self, session_id: &str) -> String {
        let buffer = self.snapshot(session_id).await;
        let mut parts = Vec::new();

        if let Some(summary) = &buffer.summary {
            parts.push(format!("[Previous conversation summary]\n{summary}\n"));
        }
        if !buffer.turns.is_empty() {
            parts.push("[Recent conversation]".to_string());
            parts.extend(buffer.turns.iter().map(ConversationTurn::render));
        }

        parts.join("\n")
    }

    /// Turns currently in the window, oldest first.
    pub async fn turns(&self, session_id: &str) -> Vec<ConversationTurn> {
        self.snapshot(session_id).await.turns.into_iter().collect()
    }

    pub async fn summary(&self, session_id: &str) -> Option<String> {
        self.snapshot(session_id).await.summary
    }

    pub async fn last_assistant_message(&self, session_id: &str) -> Option<String> {
        self.snapshot(session_id)
            .await
            .turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Assistant && t.error.is_none())
            .map(|t| t.content.clone())
    }

    /// Empty the buffer and summary of one session.
    pub async fn clear(&self, session_id: &str) {
        let slot = self.slot(session_id);
        let mut slot = slot.lock().await;
        slot.buffer = SessionBuffer::default();
        slot.loaded = true;

        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&format!("{KEY_PREFIX}{session_id}")).await {
                warn!(session_id, error = %e, "Failed to delete conversation snapshot");
            }
        }
    }

    pub async fn stats(&self, session_id: &str) -> ConversationStats {
        let buffer = self.snapshot(session_id).await;
        ConversationStats {
            session_id: session_id.to_string(),
            turns_in_window: buffer.turns.len(),
            total_turns: buffer.total_turns,
            summarizations: buffer.summarizations,
            has_summary: buffer.summary.is_some(),
            approx_tokens: buffer.turns.iter().map(|t| t.content.len()).sum::<usize>() / 4,
        }
    }

    // ── Internals ──

    fn slot(&self, session_id: &str) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
        {
            return slot.clone();
        }
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    buffer: SessionBuffer::default(),
                    loaded: false,
                }))
            })
            .clone()
    }

    async fn snapshot(&self, session_id: &str) -> SessionBuffer {
        let slot = self.slot(session_id);
        let mut slot = slot.lock().await;
        self.ensure_loaded(session_id, &mut slot).await;
        slot.buffer.clone()
    }

    async fn ensure_loaded(&self, session_id: &str, slot: &mut Slot) {
        if slot.loaded {
            return;
        }
        slot.loaded = true;
        let Some(store) = &self.store else { return };

        let key = format!("{KEY_PREFIX}{session_id}");
        match store.get(&key).await {
            Ok(Some(raw)) => match Envelope::decode::<SessionBuffer>(&raw, SCHEMA, VERSION) {
                Ok(buffer) => {
                    debug!(session_id, turns = buffer.turns.len(), "Conversation restored");
                    slot.buffer = buffer;
                }
                Err(e) => warn!(session_id, error = %e, "Skipping unreadable conversation snapshot"),
            },
            Ok(None) => {}
            Err(e) => warn!(session_id, error = %e, "Failed to load conversation snapshot"),
        }
    }

    async fn persist(&self, session_id: &str, buffer: &SessionBuffer) {
        let Some(store) = &self.store else { return };
        let key = format!("{KEY_PREFIX}{session_id}");
        let result = match Envelope::encode(SCHEMA, VERSION, buffer) {
            Ok(raw) => store.put(&key, raw).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(session_id, error = %e, "Failed to persist conversation snapshot");
        }
    }

    async fn summarize(&self, session_id: &str, evicted: &[ConversationTurn]) -> String {
        if let Some(summarizer) = &self.summarizer {
            let text = evicted
                .iter()
                .map(ConversationTurn::render)
                .collect::<Vec<_>>()
                .join("\n");
            let params = serde_json::json!({
                "query": text,
                "turns": evicted,
            });
            let output = summarizer.execute(params).await;
            if output.success && !output.output.trim().is_empty() {
                return output.output.trim().to_string();
            }
            warn!(
                session_id,
                capability = summarizer.name(),
                error = output.error.as_deref().unwrap_or("empty summary"),
                "Summarizer failed, using extractive summary"
            );
        }
        summarize_turns(evicted)
    }
}
