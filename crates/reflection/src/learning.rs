//! Learning module: aggregates reflections into routing preferences.
//!
//! The statistics are owned by a single actor task; every other component
//! talks to it through a cloneable [`LearningHandle`]. Each `learn` is
//! written through to the session store before it is acknowledged, so a
//! restart never loses an acknowledged update.

use crate::category::QueryCategory;
use crate::reflection::{Reflection, ReflectionDetails};
use routewise_core::store::{Envelope, SessionStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Session-store key of the persisted statistics.
pub const LEARNING_KEY: &str = "learning:stats";
const LEARNING_SCHEMA: &str = "learning_stats";
const LEARNING_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityStats {
    pub usage_count: u64,
    pub successes: u64,
    pub failures: u64,
    /// Every recorded latency, oldest first.
    #[serde(default)]
    pub latency_ms: Vec<u64>,
    /// Error category → count.
    #[serde(default)]
    pub errors: BTreeMap<String, u64>,
}

impl CapabilityStats {
    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.latency_ms.is_empty() {
            0.0
        } else {
            self.latency_ms.iter().sum::<u64>() as f64 / self.latency_ms.len() as f64
        }
    }
}

/// Per-category histogram: capability → (uses, successes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    #[serde(default)]
    pub usage: BTreeMap<String, u64>,
    #[serde(default)]
    pub successes: BTreeMap<String, u64>,
}

impl CategoryStats {
    fn success_rate(&self, capability: &str) -> f64 {
        let uses = self.usage.get(capability).copied().unwrap_or(0);
        if uses == 0 {
            return 0.0;
        }
        self.successes.get(capability).copied().unwrap_or(0) as f64 / uses as f64
    }

    /// Capabilities ranked by (success rate, usage) descending, then name.
    fn ranked(&self) -> Vec<(&str, f64, u64)> {
        let mut ranked: Vec<(&str, f64, u64)> = self
            .usage
            .iter()
            .map(|(name, uses)| (name.as_str(), self.success_rate(name), *uses))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then(b.2.cmp(&a.2))
                .then(a.0.cmp(b.0))
        });
        ranked
    }
}

/// Everything the learning module knows. Only grows, except on reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningStats {
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityStats>,
    #[serde(default)]
    pub categories: BTreeMap<QueryCategory, CategoryStats>,
    /// Global error category → count.
    #[serde(default)]
    pub errors: BTreeMap<String, u64>,
    #[serde(default)]
    pub quality_scores: Vec<u8>,
}

/// Per-capability metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityPerformance {
    pub capability: String,
    pub usage_count: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_errors: u64,
}

/// Aggregate view for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningSummary {
    pub total_actions: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub avg_quality_score: f64,
    pub unique_capabilities: usize,
    pub categories_learned: usize,
    /// Capabilities by usage × success rate, best first.
    pub rankings: Vec<(String, f64)>,
    /// Most frequent error categories, at most three.
    pub common_errors: Vec<(String, u64)>,
    /// Preferred capability per learned category.
    pub preferences: BTreeMap<String, String>,
}

impl LearningStats {
    /// Fold one reflection into the statistics.
    pub fn apply(&mut self, reflection: &Reflection) {
        match &reflection.details {
            ReflectionDetails::ToolSelection {
                category,
                capability,
                success,
                duration_ms,
                chained,
                ..
            } => {
                let stats = self.capabilities.entry(capability.clone()).or_default();
                stats.usage_count += 1;
                if *success {
                    stats.successes += 1;
                } else {
                    stats.failures += 1;
                }
                stats.latency_ms.push(*duration_ms);

                // A chained step was picked by the chain, not for the category.
                if *chained {
                    return;
                }
                let cat = self.categories.entry(*category).or_default();
                *cat.usage.entry(capability.clone()).or_insert(0) += 1;
                if *success {
                    *cat.successes.entry(capability.clone()).or_insert(0) += 1;
                }
            }
            ReflectionDetails::AnswerQuality { .. } => {
                if let Some(score) = reflection.score {
                    self.quality_scores.push(score);
                }
            }
            ReflectionDetails::ErrorAnalysis {
                capability, category, ..
            } => {
                *self.errors.entry(category.as_str().to_string()).or_insert(0) += 1;
                if let Some(name) = capability {
                    *self
                        .capabilities
                        .entry(name.clone())
                        .or_default()
                        .errors
                        .entry(category.as_str().to_string())
                        .or_insert(0) += 1;
                }
            }
            ReflectionDetails::SessionSummary { .. } => {}
        }
    }

    /// Top-ranked capability for the category that has succeeded at least once.
    pub fn best_for(&self, category: QueryCategory) -> Option<String> {
        self.categories
            .get(&category)?
            .ranked()
            .into_iter()
            .find(|(_, rate, _)| *rate > 0.0)
            .map(|(name, _, _)| name.to_string())
    }

    /// Best capability for the category other than `exclude`.
    pub fn alternate_for(&self, category: QueryCategory, exclude: &str) -> Option<String> {
        self.categories
            .get(&category)?
            .ranked()
            .into_iter()
            .find(|(name, rate, _)| *name != exclude && *rate > 0.0)
            .map(|(name, _, _)| name.to_string())
    }

    pub fn performance(&self, capability: &str) -> Option<CapabilityPerformance> {
        self.capabilities.get(capability).map(|s| CapabilityPerformance {
            capability: capability.to_string(),
            usage_count: s.usage_count,
            success_rate: s.success_rate(),
            avg_latency_ms: s.avg_latency_ms(),
            total_errors: s.errors.values().sum(),
        })
    }

    pub fn summary(&self) -> LearningSummary {
        let total_actions = self.capabilities.values().map(|s| s.usage_count).sum();
        let total_successes: u64 = self.capabilities.values().map(|s| s.successes).sum();
        let total_failures: u64 = self.capabilities.values().map(|s| s.failures).sum();
        let decided = total_successes + total_failures;

        let mut rankings: Vec<(String, f64)> = self
            .capabilities
            .iter()
            .filter(|(_, s)| s.usage_count > 0)
            .map(|(name, s)| (name.clone(), s.usage_count as f64 * s.success_rate()))
            .collect();
        rankings.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut common_errors: Vec<(String, u64)> =
            self.errors.iter().map(|(k, v)| (k.clone(), *v)).collect();
        common_errors.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        common_errors.truncate(3);

        let preferences = self
            .categories
            .keys()
            .filter_map(|c| self.best_for(*c).map(|best| (c.as_str().to_string(), best)))
            .collect();

        LearningSummary {
            total_actions,
            total_successes,
            total_failures,
            success_rate: if decided == 0 {
                0.0
            } else {
                total_successes as f64 / decided as f64
            },
            avg_quality_score: if self.quality_scores.is_empty() {
                0.0
            } else {
                self.quality_scores.iter().map(|&q| q as f64).sum::<f64>()
                    / self.quality_scores.len() as f64
            },
            unique_capabilities: self.capabilities.values().filter(|s| s.usage_count > 0).count(),
            categories_learned: self.categories.len(),
            rankings,
            common_errors,
            preferences,
        }
    }

    /// Serialize into the persisted envelope.
    pub fn save(&self) -> Result<String, routewise_core::MemoryError> {
        Envelope::encode(LEARNING_SCHEMA, LEARNING_VERSION, self)
    }

    /// Parse a persisted envelope.
    pub fn load(raw: &str) -> Result<Self, routewise_core::MemoryError> {
        Envelope::decode(raw, LEARNING_SCHEMA, LEARNING_VERSION)
    }
}

// ── Actor ──────────────────────────────────────────────────────

enum Command {
    Learn(Box<Reflection>, oneshot::Sender<()>),
    BestFor(QueryCategory, oneshot::Sender<Option<String>>),
    AlternateFor(QueryCategory, String, oneshot::Sender<Option<String>>),
    Performance(String, oneshot::Sender<Option<CapabilityPerformance>>),
    Summary(oneshot::Sender<LearningSummary>),
    Snapshot(oneshot::Sender<LearningStats>),
    Reset(oneshot::Sender<()>),
}

/// Spawns the learning actor.
pub struct LearningModule;

impl LearningModule {
    /// Load persisted statistics (if any) and start the actor.
    ///
    /// Missing or unreadable data starts empty with a warning.
    pub async fn spawn(store: Option<Arc<dyn SessionStore>>) -> LearningHandle {
        let stats = match &store {
            Some(store) => load_stats(store.as_ref()).await,
            None => LearningStats::default(),
        };
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(stats, store, rx));
        LearningHandle { tx }
    }
}

async fn load_stats(store: &dyn SessionStore) -> LearningStats {
    match store.get(LEARNING_KEY).await {
        Ok(Some(raw)) => match LearningStats::load(&raw) {
            Ok(stats) => {
                info!(
                    capabilities = stats.capabilities.len(),
                    categories = stats.categories.len(),
                    "Loaded learning statistics"
                );
                stats
            }
            Err(e) => {
                warn!(error = %e, "Learning statistics unreadable, starting empty");
                LearningStats::default()
            }
        },
        Ok(None) => {
            debug!("No learning statistics yet");
            LearningStats::default()
        }
        Err(e) => {
            warn!(store = store.name(), error = %e, "Failed to read learning statistics, starting empty");
            LearningStats::default()
        }
    }
}

async fn persist(store: &Option<Arc<dyn SessionStore>>, stats: &LearningStats) {
    let Some(store) = store else {
        return;
    };
    match stats.save() {
        Ok(raw) => {
            if let Err(e) = store.put(LEARNING_KEY, raw).await {
                warn!(store = store.name(), error = %e, "Failed to persist learning statistics");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode learning statistics"),
    }
}

async fn run(
    mut stats: LearningStats,
    store: Option<Arc<dyn SessionStore>>,
    mut rx: mpsc::Receiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Learn(reflection, ack) => {
                stats.apply(&reflection);
                persist(&store, &stats).await;
                let _ = ack.send(());
            }
            Command::BestFor(category, reply) => {
                let _ = reply.send(stats.best_for(category));
            }
            Command::AlternateFor(category, exclude, reply) => {
                let _ = reply.send(stats.alternate_for(category, &exclude));
            }
            Command::Performance(capability, reply) => {
                let _ = reply.send(stats.performance(&capability));
            }
            Command::Summary(reply) => {
                let _ = reply.send(stats.summary());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(stats.clone());
            }
            Command::Reset(ack) => {
                stats = LearningStats::default();
                persist(&store, &stats).await;
                info!("Learning statistics reset");
                let _ = ack.send(());
            }
        }
    }
    debug!("Learning actor stopped");
}

/// Cloneable handle to the learning actor.
///
/// Queries answer with defaults if the actor is gone.
#[derive(Clone)]
pub struct LearningHandle {
    tx: mpsc::Sender<Command>,
}

impl LearningHandle {
    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(make(reply)).await.is_err() {
            warn!("Learning actor is not running");
            return None;
        }
        rx.await.ok()
    }

    /// Fold a reflection in; returns once it is persisted.
    pub async fn learn(&self, reflection: Reflection) {
        self.ask(|ack| Command::Learn(Box::new(reflection), ack)).await;
    }

    pub async fn best_capability_for(&self, category: QueryCategory) -> Option<String> {
        self.ask(|reply| Command::BestFor(category, reply)).await.flatten()
    }

    /// Next-best capability with a success record in the category.
    pub async fn alternate_for(&self, category: QueryCategory, exclude: &str) -> Option<String> {
        let exclude = exclude.to_string();
        self.ask(|reply| Command::AlternateFor(category, exclude, reply))
            .await
            .flatten()
    }

    pub async fn performance(&self, capability: &str) -> Option<CapabilityPerformance> {
        let capability = capability.to_string();
        self.ask(|reply| Command::Performance(capability, reply))
            .await
            .flatten()
    }

    pub async fn summary(&self) -> LearningSummary {
        match self.ask(Command::Summary).await {
            Some(summary) => summary,
            None => LearningStats::default().summary(),
        }
    }

    pub async fn snapshot(&self) -> LearningStats {
        self.ask(Command::Snapshot).await.unwrap_or_default()
    }

    /// Forget everything, including the persisted copy.
    pub async fn reset(&self) {
        self.ask(Command::Reset).await;
    }
}
