//! Reflection module: structured post-hoc evaluation of routing
//! decisions, answers, errors and whole sessions.
//!
//! Every reflection is forwarded to the [`LearningHandle`] and appended to
//! the durable reflection log.

use crate::category::QueryCategory;
use crate::learning::LearningHandle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use routewise_core::capability::Capability;
use routewise_core::error::ErrorKind;
use routewise_core::event::{DomainEvent, EventBus};
use routewise_core::request::{ExecutionRequest, ExecutionResult};
use routewise_core::store::{Envelope, LogStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Log stream holding reflection records.
pub const REFLECTION_STREAM: &str = "reflections";
const REFLECTION_SCHEMA: &str = "reflection";
const REFLECTION_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionKind {
    ToolSelection,
    AnswerQuality,
    ErrorAnalysis,
    SessionSummary,
}

impl ReflectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReflectionKind::ToolSelection => "tool_selection",
            ReflectionKind::AnswerQuality => "answer_quality",
            ReflectionKind::ErrorAnalysis => "error_analysis",
            ReflectionKind::SessionSummary => "session_summary",
        }
    }
}

/// What went wrong, coarsely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    NotFound,
    Permission,
    InvalidInput,
    Unknown,
}

impl ErrorCategory {
    /// Classify by error kind first, then by message wording.
    pub fn classify(kind: Option<ErrorKind>, message: &str) -> Self {
        match kind {
            Some(ErrorKind::CapabilityTimeout | ErrorKind::RequestTimeout) => {
                return ErrorCategory::Timeout;
            }
            Some(ErrorKind::CapabilityNotFound) => return ErrorCategory::NotFound,
            Some(ErrorKind::PolicyViolation) => return ErrorCategory::Permission,
            _ => {}
        }
        let lowered = message.to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| lowered.contains(w));
        if any(&["not found", "does not exist", "no such"]) {
            ErrorCategory::NotFound
        } else if any(&["timeout", "timed out"]) {
            ErrorCategory::Timeout
        } else if any(&["permission", "denied", "unauthorized", "forbidden"]) {
            ErrorCategory::Permission
        } else if any(&["invalid", "syntax", "parse", "malformed", "missing"]) {
            ErrorCategory::InvalidInput
        } else {
            ErrorCategory::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Permission => "permission",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Suggested way out of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    RetryWithBackoff,
    AlternateCapability,
    AskForClarification,
}

impl Recovery {
    pub fn for_error(category: ErrorCategory, kind: Option<ErrorKind>) -> Self {
        match category {
            ErrorCategory::Timeout => Recovery::RetryWithBackoff,
            ErrorCategory::NotFound => Recovery::AlternateCapability,
            ErrorCategory::Permission | ErrorCategory::InvalidInput => Recovery::AskForClarification,
            ErrorCategory::Unknown => match kind {
                Some(ErrorKind::Throttled | ErrorKind::Busy) => Recovery::RetryWithBackoff,
                _ => Recovery::AlternateCapability,
            },
        }
    }
}

fn suggestions_for(category: ErrorCategory, capability: Option<&str>) -> Vec<String> {
    match category {
        ErrorCategory::Timeout => vec![
            "Retry after a short backoff".into(),
            "Narrow the request so the capability answers faster".into(),
        ],
        ErrorCategory::NotFound => vec![
            "Route to an alternate capability".into(),
            "Verify the resource exists before accessing it".into(),
        ],
        ErrorCategory::Permission => vec![
            "Check the policy that blocked the request".into(),
            "Ask the user to rephrase or request authorization".into(),
        ],
        ErrorCategory::InvalidInput => vec![
            "Validate parameters before execution".into(),
            "Ask the user to clarify the request".into(),
        ],
        ErrorCategory::Unknown => vec![
            "Log the error details for analysis".into(),
            match capability {
                Some(name) => format!("Review the '{name}' capability configuration"),
                None => "Review the capability configuration".into(),
            },
        ],
    }
}

/// Kind-specific payload of a reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReflectionDetails {
    ToolSelection {
        query: String,
        category: QueryCategory,
        capability: String,
        success: bool,
        duration_ms: u64,
        /// Capability learning preferred for this category, when it differs.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred: Option<String>,
        /// Reached by chaining from an earlier step rather than routed.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        chained: bool,
    },
    AnswerQuality {
        raw_score: f32,
        answer_length: usize,
        source_count: usize,
        cited: bool,
        hedged: bool,
        scorer: String,
    },
    ErrorAnalysis {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capability: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
        category: ErrorCategory,
        recovery: Recovery,
        message: String,
    },
    SessionSummary {
        interactions: usize,
        successes: usize,
        success_rate: f32,
        capabilities: BTreeMap<String, u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        average_quality: Option<f32>,
        #[serde(default)]
        top_insights: Vec<String>,
    },
}

/// A structured evaluation of one action or session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub id: String,
    pub session_id: String,
    /// What was evaluated: a capability name, `answer`, or `session`.
    pub subject: String,
    pub kind: ReflectionKind,
    /// 1–5, when the kind is scored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    pub insight: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub details: ReflectionDetails,
    pub created_at: DateTime<Utc>,
}

impl Reflection {
    pub fn new(
        session_id: impl Into<String>,
        subject: impl Into<String>,
        kind: ReflectionKind,
        insight: impl Into<String>,
        details: ReflectionDetails,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            subject: subject.into(),
            kind,
            score: None,
            insight: insight.into(),
            suggestions: Vec::new(),
            details,
            created_at: Utc::now(),
        }
    }

    pub fn with_score(mut self, score: u8) -> Self {
        self.score = Some(score.clamp(1, 5));
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    /// Whether this reflection reports something that did not go well.
    pub fn is_negative(&self) -> bool {
        match &self.details {
            ReflectionDetails::ToolSelection { success, preferred, .. } => !success || preferred.is_some(),
            ReflectionDetails::ErrorAnalysis { .. } => true,
            ReflectionDetails::AnswerQuality { .. } => self.score.is_some_and(|s| s <= 2),
            ReflectionDetails::SessionSummary { .. } => false,
        }
    }
}

// ── Answer scoring ─────────────────────────────────────────────

/// A 1–5 score with the signals that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerScore {
    pub score: u8,
    pub raw: f32,
    pub cited: bool,
    pub hedged: bool,
    pub scorer: String,
}

/// Grades a synthesized answer.
#[async_trait]
pub trait AnswerScorer: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, answer: &str, sources: &[String]) -> AnswerScore;
}

const HEDGES: &[&str] = &[
    "i'm not sure",
    "i am not sure",
    "i don't know",
    "i do not know",
    "not certain",
    "might be",
    "possibly",
    "it is unclear",
    "cannot determine",
    "can't determine",
];

/// Deterministic built-in scorer.
///
/// Starts at 3; short answers lose a point and long ones gain half a point;
/// citing available sources gains half a point and ignoring them loses half;
/// error wording and hedging each lose a point. Clamped to 1–5.
#[derive(Debug, Default, Clone)]
pub struct HeuristicScorer;

impl HeuristicScorer {
    pub fn evaluate(answer: &str, sources: &[String]) -> AnswerScore {
        let lowered = answer.to_lowercase();
        let length = answer.chars().count();
        let mut raw: f32 = 3.0;

        if length < 20 {
            raw -= 1.0;
        } else if length > 100 {
            raw += 0.5;
        }

        let cited = !sources.is_empty()
            && (lowered.contains("sources:") || sources.iter().any(|s| answer.contains(s.as_str())));
        if !sources.is_empty() {
            raw += if cited { 0.5 } else { -0.5 };
        }

        if lowered.contains("error") || lowered.contains("failed") {
            raw -= 1.0;
        }

        let hedged = HEDGES.iter().any(|h| lowered.contains(h));
        if hedged {
            raw -= 1.0;
        }

        let raw = raw.clamp(1.0, 5.0);
        AnswerScore {
            score: raw.round() as u8,
            raw,
            cited,
            hedged,
            scorer: "heuristic".into(),
        }
    }
}

#[async_trait]
impl AnswerScorer for HeuristicScorer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn score(&self, answer: &str, sources: &[String]) -> AnswerScore {
        Self::evaluate(answer, sources)
    }
}

/// Delegates grading to a capability (`{"score": n}` or a bare number),
/// falling back to [`HeuristicScorer`] on any failure.
pub struct CapabilityScorer {
    capability: Arc<dyn Capability>,
}

impl CapabilityScorer {
    pub fn new(capability: Arc<dyn Capability>) -> Self {
        Self { capability }
    }

    fn parse(output: &str) -> Option<f32> {
        let trimmed = output.trim();
        let value = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(serde_json::Value::Object(map)) => map.get("score").and_then(|s| s.as_f64()),
            Ok(serde_json::Value::Number(n)) => n.as_f64(),
            _ => trimmed.parse::<f64>().ok(),
        }?;
        (1.0..=5.0).contains(&value).then_some(value as f32)
    }
}

#[async_trait]
impl AnswerScorer for CapabilityScorer {
    fn name(&self) -> &str {
        self.capability.name()
    }

    async fn score(&self, answer: &str, sources: &[String]) -> AnswerScore {
        let fallback = HeuristicScorer::evaluate(answer, sources);
        let output = self
            .capability
            .execute(serde_json::json!({ "answer": answer, "sources": sources }))
            .await;
        if !output.success {
            warn!(scorer = self.capability.name(), "Scoring capability failed, using heuristic");
            return fallback;
        }
        match Self::parse(&output.output) {
            Some(raw) => AnswerScore {
                score: raw.round() as u8,
                raw,
                scorer: self.capability.name().to_string(),
                ..fallback
            },
            None => {
                warn!(scorer = self.capability.name(), "Unusable score, using heuristic");
                fallback
            }
        }
    }
}

// ── Module ─────────────────────────────────────────────────────

/// Produces reflections and routes them to learning and the durable log.
pub struct ReflectionModule {
    learning: LearningHandle,
    log: Option<Arc<dyn LogStore>>,
    scorer: Arc<dyn AnswerScorer>,
    events: Option<Arc<EventBus>>,
}

impl ReflectionModule {
    pub fn new(learning: LearningHandle) -> Self {
        Self {
            learning,
            log: None,
            scorer: Arc::new(HeuristicScorer),
            events: None,
        }
    }

    pub fn with_log_store(mut self, log: Arc<dyn LogStore>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn AnswerScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn learning(&self) -> &LearningHandle {
        &self.learning
    }

    /// Affirm a routing choice, or flag it when learning prefers another
    /// capability for the query's category.
    pub async fn reflect_on_tool_selection(
        &self,
        request: &ExecutionRequest,
        chosen: &str,
        result: &ExecutionResult,
    ) -> Reflection {
        let category = QueryCategory::detect(&request.query);
        let preferred = self
            .learning
            .best_capability_for(category)
            .await
            .filter(|best| best != chosen);

        let (insight, suggestions) = match (&preferred, result.success) {
            (Some(best), _) => (
                format!("Chose '{chosen}' for a {category} query, but '{best}' has the better track record"),
                vec![format!("Prefer '{best}' for {category} queries")],
            ),
            (None, true) => (
                format!("Capability '{chosen}' handled the {category} query"),
                Vec::new(),
            ),
            (None, false) => (
                format!(
                    "Capability '{chosen}' failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                ),
                vec!["Consider an alternate capability for similar queries".into()],
            ),
        };

        let reflection = Reflection::new(
            &request.session_id,
            chosen,
            ReflectionKind::ToolSelection,
            insight,
            ReflectionDetails::ToolSelection {
                query: request.query.clone(),
                category,
                capability: chosen.to_string(),
                success: result.success,
                duration_ms: result.duration_ms,
                preferred,
                chained: false,
            },
        )
        .with_suggestions(suggestions);
        self.record(reflection).await
    }

    /// Record a step the chain picked after the routed capability. It counts
    /// toward the capability's own record but not toward category routing.
    pub async fn reflect_on_chained_step(
        &self,
        request: &ExecutionRequest,
        chosen: &str,
        result: &ExecutionResult,
    ) -> Reflection {
        let insight = if result.success {
            format!("Chained capability '{chosen}' consumed the previous output")
        } else {
            format!(
                "Chained capability '{chosen}' failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            )
        };
        let reflection = Reflection::new(
            &request.session_id,
            chosen,
            ReflectionKind::ToolSelection,
            insight,
            ReflectionDetails::ToolSelection {
                query: request.query.clone(),
                category: QueryCategory::detect(&request.query),
                capability: chosen.to_string(),
                success: result.success,
                duration_ms: result.duration_ms,
                preferred: None,
                chained: true,
            },
        );
        self.record(reflection).await
    }

    /// Grade a synthesized answer on a 1–5 scale.
    pub async fn reflect_on_answer_quality(
        &self,
        session_id: &str,
        answer: &str,
        sources: &[String],
    ) -> Reflection {
        let graded = self.scorer.score(answer, sources).await;
        let mut insight = if graded.score >= 4 {
            "High-quality answer with good detail".to_string()
        } else if graded.score <= 2 {
            "Answer may lack detail or have issues".to_string()
        } else {
            "Adequate answer".to_string()
        };
        if !sources.is_empty() {
            insight.push_str(&format!("; grounded in {} source(s)", sources.len()));
        }

        let mut suggestions = Vec::new();
        if graded.hedged {
            suggestions.push("Avoid hedging when the capability output is conclusive".to_string());
        }
        if !sources.is_empty() && !graded.cited {
            suggestions.push("Cite the sources the answer relied on".to_string());
        }

        let reflection = Reflection::new(
            session_id,
            "answer",
            ReflectionKind::AnswerQuality,
            insight,
            ReflectionDetails::AnswerQuality {
                raw_score: graded.raw,
                answer_length: answer.chars().count(),
                source_count: sources.len(),
                cited: graded.cited,
                hedged: graded.hedged,
                scorer: graded.scorer,
            },
        )
        .with_score(graded.score)
        .with_suggestions(suggestions);
        self.record(reflection).await
    }

    /// Categorize a failure and suggest a recovery.
    pub async fn reflect_on_error(&self, request: &ExecutionRequest, result: &ExecutionResult) -> Reflection {
        let message = result.error.clone().unwrap_or_else(|| "unknown error".into());
        let category = ErrorCategory::classify(result.error_kind, &message);
        let recovery = Recovery::for_error(category, result.error_kind);
        let capability = (!result.capability.is_empty()).then(|| result.capability.clone());

        let reflection = Reflection::new(
            &request.session_id,
            capability.as_deref().unwrap_or("request"),
            ReflectionKind::ErrorAnalysis,
            format!("Error category: {}", category.as_str()),
            ReflectionDetails::ErrorAnalysis {
                capability: capability.clone(),
                error_kind: result.error_kind,
                category,
                recovery,
                message,
            },
        )
        .with_suggestions(suggestions_for(category, capability.as_deref()));
        self.record(reflection).await
    }

    /// Aggregate a session's reflections into a summary.
    pub async fn summarize_session(&self, session_id: &str, reflections: &[Reflection]) -> Reflection {
        let mut interactions = 0usize;
        let mut successes = 0usize;
        let mut capabilities: BTreeMap<String, u64> = BTreeMap::new();
        let mut quality: Vec<u8> = Vec::new();

        for r in reflections {
            match &r.details {
                ReflectionDetails::ToolSelection { capability, success, .. } => {
                    interactions += 1;
                    if *success {
                        successes += 1;
                    }
                    *capabilities.entry(capability.clone()).or_insert(0) += 1;
                }
                ReflectionDetails::ErrorAnalysis { .. } => interactions += 1,
                ReflectionDetails::AnswerQuality { .. } => quality.extend(r.score),
                ReflectionDetails::SessionSummary { .. } => {}
            }
        }

        let success_rate = if interactions == 0 {
            0.0
        } else {
            successes as f32 / interactions as f32
        };
        let average_quality = (!quality.is_empty())
            .then(|| quality.iter().map(|&q| q as f32).sum::<f32>() / quality.len() as f32);

        // Problems first, then everything else; distinct, at most three.
        let mut top: Vec<String> = Vec::new();
        let ordered = reflections
            .iter()
            .filter(|r| r.is_negative())
            .chain(reflections.iter().filter(|r| !r.is_negative()));
        for r in ordered {
            if r.kind != ReflectionKind::SessionSummary && !top.contains(&r.insight) {
                top.push(r.insight.clone());
            }
            if top.len() == 3 {
                break;
            }
        }

        let mut insight = format!(
            "{successes}/{interactions} interactions succeeded ({:.0}%)",
            success_rate * 100.0
        );
        if let Some((name, count)) = capabilities.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))) {
            insight.push_str(&format!("; most used: {name} ({count})"));
        }

        let score = if interactions == 0 {
            3
        } else {
            1 + (success_rate * 4.0).round() as u8
        };
        let mut suggestions = Vec::new();
        if interactions > 0 && success_rate < 0.7 {
            suggestions.push("Several interactions failed; review the error patterns".to_string());
        }
        if capabilities.len() == 1 && interactions >= 3 {
            suggestions.push("Only one capability was used; check routing coverage".to_string());
        }

        let reflection = Reflection::new(
            session_id,
            "session",
            ReflectionKind::SessionSummary,
            insight,
            ReflectionDetails::SessionSummary {
                interactions,
                successes,
                success_rate,
                capabilities,
                average_quality,
                top_insights: top,
            },
        )
        .with_score(score)
        .with_suggestions(suggestions);
        self.record(reflection).await
    }

    /// Read the reflection log back, skipping unreadable records.
    pub async fn load_log(store: &dyn LogStore) -> Vec<Reflection> {
        let raw = match store.read_all(REFLECTION_STREAM).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(store = store.name(), error = %e, "Failed to read reflection log");
                return Vec::new();
            }
        };
        raw.iter()
            .enumerate()
            .filter_map(|(line, record)| {
                match Envelope::decode::<Reflection>(record, REFLECTION_SCHEMA, REFLECTION_VERSION) {
                    Ok(r) => Some(r),
                    Err(e) => {
                        warn!(line = line + 1, error = %e, "Skipping unreadable reflection record");
                        None
                    }
                }
            })
            .collect()
    }

    async fn record(&self, reflection: Reflection) -> Reflection {
        debug!(
            session_id = %reflection.session_id,
            kind = reflection.kind.as_str(),
            score = ?reflection.score,
            "Reflection recorded"
        );
        self.learning.learn(reflection.clone()).await;

        if let Some(log) = &self.log {
            match Envelope::encode(REFLECTION_SCHEMA, REFLECTION_VERSION, &reflection) {
                Ok(encoded) => {
                    if let Err(e) = log.append(REFLECTION_STREAM, encoded).await {
                        warn!(store = log.name(), error = %e, "Failed to persist reflection");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode reflection"),
            }
        }

        if let Some(events) = &self.events {
            events.publish(DomainEvent::ReflectionRecorded {
                session_id: reflection.session_id.clone(),
                kind: reflection.kind.as_str().to_string(),
                score: reflection.score,
                timestamp: reflection.created_at,
            });
        }
        reflection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::LearningModule;
    use routewise_core::capability::CapabilityOutput;
    use routewise_memory::InMemoryLogStore;

    fn ok_result(capability: &str) -> ExecutionResult {
        let now = Utc::now();
        ExecutionResult::from_output(capability, CapabilityOutput::ok("84"), now, now)
    }

    async fn module() -> (ReflectionModule, Arc<InMemoryLogStore>) {
        let log = Arc::new(InMemoryLogStore::new());
        let learning = LearningModule::spawn(None).await;
        (ReflectionModule::new(learning).with_log_store(log.clone()), log)
    }

    #[test]
    fn heuristic_scores() {
        let short = HeuristicScorer::evaluate("84", &[]);
        assert_eq!(short.score, 2);

        let long = "The result of the calculation is 84, obtained by multiplying twelve by seven \
                    and checking the product twice for accuracy.";
        assert_eq!(HeuristicScorer::evaluate(long, &[]).score, 4);

        let hedged = HeuristicScorer::evaluate("I'm not sure, it might be 84 or so.", &[]);
        assert!(hedged.hedged);
        assert_eq!(hedged.score, 2);

        let sources = vec!["guide.md".to_string()];
        let cited = HeuristicScorer::evaluate("Ownership moves values.\n\nSources:\n- guide.md", &sources);
        assert!(cited.cited);
        let uncited = HeuristicScorer::evaluate("Ownership moves values between bindings.", &sources);
        assert!(!uncited.cited);
        assert!(cited.raw > uncited.raw);
    }

    #[test]
    fn heuristic_is_clamped() {
        let s = HeuristicScorer::evaluate("error failed, I don't know", &["x".into()]);
        assert_eq!(s.score, 1);
    }

    #[test]
    fn error_classification() {
        assert_eq!(
            ErrorCategory::classify(Some(ErrorKind::CapabilityTimeout), "boom"),
            ErrorCategory::Timeout
        );
        assert_eq!(ErrorCategory::classify(None, "File does not exist"), ErrorCategory::NotFound);
        assert_eq!(ErrorCategory::classify(None, "Permission denied"), ErrorCategory::Permission);
        assert_eq!(ErrorCategory::classify(None, "Invalid expression"), ErrorCategory::InvalidInput);
        assert_eq!(ErrorCategory::classify(None, "kaboom"), ErrorCategory::Unknown);
        assert_eq!(
            Recovery::for_error(ErrorCategory::Timeout, None),
            Recovery::RetryWithBackoff
        );
        assert_eq!(
            Recovery::for_error(ErrorCategory::InvalidInput, None),
            Recovery::AskForClarification
        );
        assert_eq!(
            Recovery::for_error(ErrorCategory::NotFound, None),
            Recovery::AlternateCapability
        );
    }

    #[tokio::test]
    async fn tool_selection_affirms_then_flags_misroute() {
        let (module, log) = module().await;
        let request = ExecutionRequest::new("s1", "Calculate 12*7");

        let first = module
            .reflect_on_tool_selection(&request, "calculator", &ok_result("calculator"))
            .await;
        assert!(!first.is_negative());
        assert!(first.insight.contains("handled"));

        let second = module
            .reflect_on_tool_selection(&request, "document_search", &ok_result("document_search"))
            .await;
        match &second.details {
            ReflectionDetails::ToolSelection { preferred, .. } => {
                assert_eq!(preferred.as_deref(), Some("calculator"));
            }
            other => panic!("unexpected details: {other:?}"),
        }
        assert!(second.is_negative());

        assert_eq!(ReflectionModule::load_log(log.as_ref()).await.len(), 2);
    }

    #[tokio::test]
    async fn chained_step_keeps_the_routed_preference() {
        let (module, log) = module().await;
        let request = ExecutionRequest::new("s1", "Calculate 12*7");
        module
            .reflect_on_tool_selection(&request, "calculator", &ok_result("calculator"))
            .await;
        for _ in 0..3 {
            let step = module
                .reflect_on_chained_step(&request, "fetcher", &ok_result("fetcher"))
                .await;
            assert!(!step.is_negative());
        }

        let category = QueryCategory::detect(&request.query);
        assert_eq!(
            module.learning().best_capability_for(category).await.as_deref(),
            Some("calculator")
        );
        assert_eq!(module.learning().performance("fetcher").await.map(|p| p.usage_count), Some(3));

        let loaded = ReflectionModule::load_log(log.as_ref()).await;
        assert!(matches!(
            loaded.last().map(|r| &r.details),
            Some(ReflectionDetails::ToolSelection { chained: true, .. })
        ));
    }

    #[tokio::test]
    async fn error_reflection_feeds_learning() {
        let (module, _log) = module().await;
        let request = ExecutionRequest::new("s1", "search the web");
        let result = ExecutionResult::failed(
            "web_search",
            ErrorKind::CapabilityTimeout,
            "Capability 'web_search' timed out after 10ms",
            Utc::now(),
        );
        let reflection = module.reflect_on_error(&request, &result).await;
        assert_eq!(reflection.kind, ReflectionKind::ErrorAnalysis);
        match &reflection.details {
            ReflectionDetails::ErrorAnalysis { category, recovery, .. } => {
                assert_eq!(*category, ErrorCategory::Timeout);
                assert_eq!(*recovery, Recovery::RetryWithBackoff);
            }
            other => panic!("unexpected details: {other:?}"),
        }
        let perf = module.learning().performance("web_search").await;
        assert_eq!(perf.map(|p| p.total_errors), Some(1));
    }

    #[tokio::test]
    async fn session_summary_aggregates() {
        let (module, _log) = module().await;
        let request = ExecutionRequest::new("s1", "Calculate 1+1");
        let mut all = vec![
            module
                .reflect_on_tool_selection(&request, "calculator", &ok_result("calculator"))
                .await,
            module.reflect_on_answer_quality("s1", "2", &[]).await,
        ];
        let failed = ExecutionResult::failed("calculator", ErrorKind::CapabilityExecutionError, "Invalid expression", Utc::now());
        all.push(module.reflect_on_error(&request, &failed).await);

        let summary = module.summarize_session("s1", &all).await;
        assert_eq!(summary.kind, ReflectionKind::SessionSummary);
        match &summary.details {
            ReflectionDetails::SessionSummary {
                interactions,
                successes,
                capabilities,
                top_insights,
                ..
            } => {
                assert_eq!(*interactions, 2);
                assert_eq!(*successes, 1);
                assert_eq!(capabilities.get("calculator"), Some(&1));
                assert!(top_insights.contains(&"Error category: invalid_input".to_string()));
                assert_eq!(top_insights.len(), 3);
            }
            other => panic!("unexpected details: {other:?}"),
        }
        assert_eq!(summary.score, Some(3));
        assert_eq!(summary.suggestions.len(), 1);
        assert!(summary.insight.starts_with("1/2 interactions succeeded"));
    }

    #[tokio::test]
    async fn log_skips_corrupt_and_foreign_records() {
        let (module, log) = module().await;
        module.reflect_on_answer_quality("s1", "fine answer here, long enough", &[]).await;
        log.append(REFLECTION_STREAM, "not json".into()).await.unwrap();
        log.append(
            REFLECTION_STREAM,
            r#"{"schema":"reflection","version":99,"payload":{}}"#.into(),
        )
        .await
        .unwrap();
        let loaded = ReflectionModule::load_log(log.as_ref()).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].kind, ReflectionKind::AnswerQuality);
    }

    #[tokio::test]
    async fn torn_log_line_costs_only_itself() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(routewise_memory::JsonlLogStore::new(dir.path()));
        let learning = LearningModule::spawn(None).await;
        let module = ReflectionModule::new(learning).with_log_store(log.clone());
        let request = ExecutionRequest::new("s1", "Calculate 12*7");
        module
            .reflect_on_tool_selection(&request, "calculator", &ok_result("calculator"))
            .await;
        module.reflect_on_answer_quality("s1", "The product is 84.", &[]).await;

        let path = dir.path().join(format!("{REFLECTION_STREAM}.jsonl"));
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"\xff\xfe torn\n");
        std::fs::write(&path, raw).unwrap();

        let loaded = ReflectionModule::load_log(log.as_ref()).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].kind, ReflectionKind::AnswerQuality);
    }

    struct FixedScore(&'static str, bool);

    #[async_trait]
    impl Capability for FixedScore {
        fn name(&self) -> &str {
            "grader"
        }
        fn description(&self) -> &str {
            "Grades answers"
        }
        async fn execute(&self, _parameters: serde_json::Value) -> CapabilityOutput {
            if self.1 {
                CapabilityOutput::ok(self.0)
            } else {
                CapabilityOutput::failure("grader offline")
            }
        }
    }

    #[tokio::test]
    async fn capability_scorer_falls_back() {
        let good = CapabilityScorer::new(Arc::new(FixedScore(r#"{"score": 5}"#, true)));
        let s = good.score("84", &[]).await;
        assert_eq!((s.score, s.scorer.as_str()), (5, "grader"));

        let garbage = CapabilityScorer::new(Arc::new(FixedScore("excellent!", true)));
        assert_eq!(garbage.score("84", &[]).await.scorer, "heuristic");

        let offline = CapabilityScorer::new(Arc::new(FixedScore("4", false)));
        let s = offline.score("84", &[]).await;
        assert_eq!((s.score, s.scorer.as_str()), (2, "heuristic"));
    }
}
