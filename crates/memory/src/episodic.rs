//! Episodic store: one finalized record per past session, searchable by
//! keyword.
//!
//! Episodes live in a [`SessionStore`] under `episode:{session_id}` and are
//! indexed in memory at open. Records that fail to decode are skipped with a
//! warning; opening never fails because of a bad record.

use chrono::{DateTime, Utc};
use routewise_core::capability::Capability;
use routewise_core::error::MemoryError;
use routewise_core::message::{ConversationTurn, Role};
use routewise_core::store::{Envelope, SessionStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::text::{keywords, summarize_turns, tokenize};

const SCHEMA: &str = "episode";
const VERSION: u32 = 1;
const KEY_PREFIX: &str = "episode:";
const MAX_ENTITIES: usize = 24;

/// What happened to one user query in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeOutcome {
    pub query: String,
    pub success: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A finalized session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub session_id: String,
    pub summary: String,
    pub queries: Vec<String>,
    pub capabilities: Vec<String>,
    pub outcomes: Vec<EpisodeOutcome>,
    pub entities: Vec<String>,
    pub turn_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeMatch {
    pub episode: Episode,
    /// Number of query keywords found in the summary or entities
    pub score: usize,
}

pub struct EpisodicStore {
    store: Arc<dyn SessionStore>,
    summarizer: Option<Arc<dyn Capability>>,
    index: RwLock<HashMap<String, Episode>>,
}

impl EpisodicStore {
    /// Load every episode record from `store`.
    pub async fn open(
        store: Arc<dyn SessionStore>,
        summarizer: Option<Arc<dyn Capability>>,
    ) -> Result<Self, MemoryError> {
        let mut index = HashMap::new();
        let mut skipped = 0usize;

        for key in store.keys(KEY_PREFIX).await? {
            let raw = match store.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable episode");
                    skipped += 1;
                    continue;
                }
            };
            match Envelope::decode::<Episode>(&raw, SCHEMA, VERSION) {
                Ok(episode) => {
                    index.insert(episode.session_id.clone(), episode);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping corrupt episode");
                    skipped += 1;
                }
            }
        }

        info!(backend = store.name(), loaded = index.len(), skipped, "Episodic store opened");
        Ok(Self {
            store,
            summarizer,
            index: RwLock::new(index),
        })
    }

    /// Persist an episode, replacing any previous record for its session.
    pub async fn add(&self, episode: Episode) -> Result<(), MemoryError> {
        let raw = Envelope::encode(SCHEMA, VERSION, &episode)?;
        let mut index = self.index.write().await;
        self.store
            .put(&format!("{KEY_PREFIX}{}", episode.session_id), raw)
            .await?;
        debug!(session_id = %episode.session_id, "Episode stored");
        index.insert(episode.session_id.clone(), episode);
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Option<Episode> {
        self.index.read().await.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Episodes ranked by keyword overlap with summary and entities, most
    /// recent first among equals. Episodes with no overlap are excluded.
    pub async fn search(&self, keywords: &[String], limit: usize) -> Vec<EpisodeMatch> {
        let wanted: BTreeSet<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        if wanted.is_empty() || limit == 0 {
            return Vec::new();
        }

        let index = self.index.read().await;
        let mut matches: Vec<EpisodeMatch> = index
            .values()
            .filter_map(|episode| {
                let mut vocabulary: BTreeSet<String> = tokenize(&episode.summary).into_iter().collect();
                vocabulary.extend(episode.entities.iter().map(|e| e.to_lowercase()));
                let score = wanted.iter().filter(|k| vocabulary.contains(*k)).count();
                (score > 0).then(|| EpisodeMatch {
                    episode: episode.clone(),
                    score,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(b.episode.created_at.cmp(&a.episode.created_at))
                .then(a.episode.session_id.cmp(&b.episode.session_id))
        });
        matches.truncate(limit);
        matches
    }

    /// [`search`](Self::search) with keywords extracted from free text.
    pub async fn search_text(&self, query: &str, limit: usize) -> Vec<EpisodeMatch> {
        self.search(&keywords(query), limit).await
    }

    /// The `n` most recent episodes.
    pub async fn recent(&self, n: usize) -> Vec<Episode> {
        let mut all: Vec<Episode> = self.index.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(a.session_id.cmp(&b.session_id))
        });
        all.truncate(n);
        all
    }

    /// Episodes in which `capability` was used.
    pub async fn episodes_using(&self, capability: &str) -> Vec<Episode> {
        let mut found: Vec<Episode> = self
            .index
            .read()
            .await
            .values()
            .filter(|e| e.capabilities.iter().any(|c| c == capability))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    /// Build an episode from a session's conversation and store it.
    ///
    /// The result depends only on the turns (and `prior_summary`), so
    /// finalizing the same conversation twice yields the same record.
    pub async fn finalize_session(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
        prior_summary: Option<&str>,
    ) -> Result<Episode, MemoryError> {
        let mut summary = self.summarize(session_id, turns).await;
        if let Some(prior) = prior_summary.filter(|p| !p.trim().is_empty()) {
            summary = format!("{}\n{summary}", prior.trim());
        }

        let queries: Vec<String> = turns
            .iter()
            .filter(|t| t.role == Role::User)
            .map(|t| t.content.clone())
            .collect();

        let mut capabilities: Vec<String> = Vec::new();
        for tool in turns.iter().flat_map(|t| t.tool_calls.iter()) {
            if !capabilities.contains(tool) {
                capabilities.push(tool.clone());
            }
        }

        let outcomes = pair_outcomes(turns);

        let mut entities: Vec<String> = Vec::new();
        let entity_source = queries
            .iter()
            .map(String::as_str)
            .chain(prior_summary)
            .collect::<Vec<_>>()
            .join(" ");
        for word in keywords(&entity_source).into_iter().chain(capabilities.iter().cloned()) {
            if entities.len() >= MAX_ENTITIES {
                break;
            }
            if !entities.contains(&word) {
                entities.push(word);
            }
        }

        let created_at = turns.last().map(|t| t.timestamp).unwrap_or_else(Utc::now);

        let episode = Episode {
            session_id: session_id.to_string(),
            summary,
            queries,
            capabilities,
            outcomes,
            entities,
            turn_count: turns.len(),
            created_at,
        };
        self.add(episode.clone()).await?;
        info!(session_id, turns = turns.len(), "Session finalized into episode");
        Ok(episode)
    }

    async fn summarize(&self, session_id: &str, turns: &[ConversationTurn]) -> String {
        if let Some(summarizer) = &self.summarizer {
            let text = turns
                .iter()
                .map(ConversationTurn::render)
                .collect::<Vec<_>>()
                .join("\n");
            let output = summarizer
                .execute(serde_json::json!({ "query": text, "turns": turns }))
                .await;
            if output.success && !output.output.trim().is_empty() {
                return output.output.trim().to_string();
            }
            warn!(session_id, "Summarizer failed for episode, using extractive summary");
        }
        summarize_turns(turns)
    }
}

/// Render matches as a context block for the enriched query.
pub fn format_episode_context(matches: &[EpisodeMatch]) -> String {
    if matches.is_empty() {
        return String::new();
    }
    let mut out = String::from("[Relevant past conversations]");
    for (i, m) in matches.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. ({}) {}",
            i + 1,
            m.episode.created_at.format("%Y-%m-%d"),
            m.episode.summary.replace('\n', " ")
        ));
    }
    out
}

/// Pair each user turn with the assistant/error turn that answered it.
fn pair_outcomes(turns: &[ConversationTurn]) -> Vec<EpisodeOutcome> {
    let mut outcomes = Vec::new();
    let mut pending: Option<&ConversationTurn> = None;
    for turn in turns {
        match turn.role {
            Role::User => {
                if let Some(unanswered) = pending.replace(turn) {
                    outcomes.push(EpisodeOutcome {
                        query: unanswered.content.clone(),
                        success: false,
                        capabilities: Vec::new(),
                    });
                }
            }
            Role::Assistant | Role::System => {
                if let Some(user) = pending.take() {
                    outcomes.push(EpisodeOutcome {
                        query: user.content.clone(),
                        success: turn.error.is_none(),
                        capabilities: turn.tool_calls.clone(),
                    });
                }
            }
        }
    }
    if let Some(unanswered) = pending {
        outcomes.push(EpisodeOutcome {
            query: unanswered.content.clone(),
            success: false,
            capabilities: Vec::new(),
        });
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemorySessionStore;
    use chrono::Duration;
    use routewise_core::error::ErrorKind;
    use routewise_core::message::TurnDraft;

    fn conversation() -> Vec<ConversationTurn> {
        vec![
            TurnDraft::user("What is the revenue forecast for Acme?").into_turn(0),
            TurnDraft::assistant("Revenue is up 4%")
                .with_tool_calls(vec!["document_search".into()])
                .into_turn(1),
            TurnDraft::user("Compute 4% of 200").into_turn(2),
            TurnDraft::assistant("Timed out")
                .with_error(ErrorKind::CapabilityTimeout)
                .into_turn(3),
        ]
    }

    fn episode(session: &str, summary: &str, entities: &[&str], age_minutes: i64) -> Episode {
        Episode {
            session_id: session.into(),
            summary: summary.into(),
            queries: vec![],
            capabilities: vec![],
            outcomes: vec![],
            entities: entities.iter().map(|e| e.to_string()).collect(),
            turn_count: 0,
            created_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    async fn empty_store() -> (Arc<InMemorySessionStore>, EpisodicStore) {
        let backing = Arc::new(InMemorySessionStore::new());
        let store = EpisodicStore::open(backing.clone(), None).await.unwrap();
        (backing, store)
    }

    #[tokio::test]
    async fn finalize_builds_episode() {
        let (_, store) = empty_store().await;
        let ep = store.finalize_session("s1", &conversation(), None).await.unwrap();

        assert_eq!(ep.queries.len(), 2);
        assert_eq!(ep.capabilities, vec!["document_search"]);
        assert_eq!(ep.outcomes.len(), 2);
        assert!(ep.outcomes[0].success);
        assert!(!ep.outcomes[1].success);
        assert!(ep.entities.contains(&"revenue".to_string()));
        assert!(ep.entities.contains(&"acme".to_string()));
        assert!(ep.summary.starts_with("User asked about:"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let (_, store) = empty_store().await;
        let turns = conversation();
        let first = store.finalize_session("s1", &turns, None).await.unwrap();
        let second = store.finalize_session("s1", &turns, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("s1").await, Some(first));
    }

    #[tokio::test]
    async fn search_ranks_by_overlap_then_recency() {
        let (_, store) = empty_store().await;
        store.add(episode("old", "revenue forecast review", &["acme"], 60)).await.unwrap();
        store.add(episode("new", "revenue numbers", &["acme"], 1)).await.unwrap();
        store.add(episode("best", "revenue forecast", &["acme"], 30)).await.unwrap();
        store.add(episode("none", "weather chat", &[], 0)).await.unwrap();

        let hits = store
            .search(&["revenue".into(), "forecast".into(), "acme".into()], 10)
            .await;
        let order: Vec<_> = hits.iter().map(|h| h.episode.session_id.as_str()).collect();
        // "best" and "old" both score 3; "best" is newer
        assert_eq!(order, vec!["best", "old", "new"]);
        assert_eq!(hits[0].score, 3);
        assert_eq!(hits[2].score, 2);
    }

    #[tokio::test]
    async fn search_text_extracts_keywords() {
        let (_, store) = empty_store().await;
        store.add(episode("s", "User asked about: pricing tiers", &[], 0)).await.unwrap();
        let hits = store.search_text("What were the pricing options?", 2).await;
        assert_eq!(hits.len(), 1);
        assert!(store.search_text("the a of", 2).await.is_empty());
    }

    #[tokio::test]
    async fn open_skips_corrupt_records() {
        let backing = Arc::new(InMemorySessionStore::new());
        {
            let store = EpisodicStore::open(backing.clone(), None).await.unwrap();
            store.add(episode("good", "fine", &[], 0)).await.unwrap();
        }
        backing.put("episode:bad", "{{{{".into()).await.unwrap();
        backing
            .put("episode:foreign", r#"{"schema":"other","version":1,"payload":{}}"#.into())
            .await
            .unwrap();

        let reopened = EpisodicStore::open(backing, None).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(reopened.get("good").await.is_some());
    }

    #[tokio::test]
    async fn helpers_filter_and_order() {
        let (_, store) = empty_store().await;
        let mut a = episode("a", "x", &[], 10);
        a.capabilities = vec!["calculator".into()];
        store.add(a).await.unwrap();
        store.add(episode("b", "y", &[], 5)).await.unwrap();

        let recent: Vec<_> = store.recent(5).await.into_iter().map(|e| e.session_id).collect();
        assert_eq!(recent, vec!["b", "a"]);
        assert_eq!(store.episodes_using("calculator").await.len(), 1);
        assert!(store.episodes_using("web").await.is_empty());
    }

    #[test]
    fn context_block_format() {
        let mut ep = episode("s", "User asked about: revenue", &[], 0);
        ep.created_at = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let block = format_episode_context(&[EpisodeMatch { episode: ep, score: 1 }]);
        assert_eq!(
            block,
            "[Relevant past conversations]\n1. (2026-03-01) User asked about: revenue"
        );
        assert_eq!(format_episode_context(&[]), "");
    }
}
