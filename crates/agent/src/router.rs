//! Capability routing: learned preference, then the reasoning
//! capability, then the first available capability.

use routewise_core::capability::{CapabilityRegistry, ReferenceKind};
use routewise_reflection::{LearningHandle, QueryCategory};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// How a route was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Learned,
    Reasoned,
    Fallback,
    /// Follow-up hop consuming references from the previous output.
    Chained,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub capability: String,
    /// Extra parameters suggested by the reasoning capability.
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub source: RouteSource,
    pub confidence: Option<f64>,
}

impl Route {
    fn new(capability: impl Into<String>, source: RouteSource) -> Self {
        Self {
            capability: capability.into(),
            parameters: serde_json::Map::new(),
            source,
            confidence: None,
        }
    }
}

/// The structured choice the reasoning capability answers with.
#[derive(Debug, Deserialize)]
struct ReasonedChoice {
    capability: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    parameters: Option<serde_json::Map<String, serde_json::Value>>,
}

pub struct Router {
    reasoning_capability: String,
    summarizer_capability: String,
    reasoning_timeout: Duration,
}

impl Router {
    pub fn new(
        reasoning_capability: impl Into<String>,
        summarizer_capability: impl Into<String>,
        reasoning_timeout: Duration,
    ) -> Self {
        Self {
            reasoning_capability: reasoning_capability.into(),
            summarizer_capability: summarizer_capability.into(),
            reasoning_timeout,
        }
    }

    /// Whether `name` is an internal helper rather than a routing target.
    pub fn is_internal(&self, name: &str) -> bool {
        name == self.reasoning_capability || name == self.summarizer_capability
    }

    fn is_target(&self, registry: &CapabilityRegistry, name: &str) -> bool {
        name != self.reasoning_capability && registry.get(name).is_ok_and(|d| d.available)
    }

    /// Pick a capability for `query`.
    ///
    /// `None` only when the registry has nothing routable at all.
    pub async fn route(
        &self,
        registry: &CapabilityRegistry,
        learning: &LearningHandle,
        query: &str,
        category: QueryCategory,
    ) -> Option<Route> {
        if let Some(learned) = learning.best_capability_for(category).await {
            if self.is_target(registry, &learned) {
                debug!(capability = %learned, category = %category, "Routing by learned preference");
                return Some(Route::new(learned, RouteSource::Learned));
            }
            debug!(capability = %learned, "Learned capability is not routable, rerouting");
        }

        if let Some(route) = self.reason(registry, query).await {
            return Some(route);
        }

        let fallback = registry
            .first_available(&[self.reasoning_capability.as_str(), self.summarizer_capability.as_str()])
            .or_else(|| registry.first_available(&[self.reasoning_capability.as_str()]))?;
        debug!(capability = %fallback.name, "Routing to first available capability");
        Some(Route::new(fallback.name, RouteSource::Fallback))
    }

    async fn reason(&self, registry: &CapabilityRegistry, query: &str) -> Option<Route> {
        let reasoner = registry.capability(&self.reasoning_capability).ok()?;
        if !reasoner.is_available() {
            return None;
        }

        let block = registry
            .describe_for_prompt(&[self.reasoning_capability.as_str(), self.summarizer_capability.as_str()]);
        if block.is_empty() {
            return None;
        }

        let params = serde_json::json!({ "query": query, "capabilities": block });
        let output = match tokio::time::timeout(self.reasoning_timeout, reasoner.execute(params)).await {
            Ok(output) => output,
            Err(_) => {
                warn!(capability = %self.reasoning_capability, "Reasoning capability timed out");
                return None;
            }
        };
        if !output.success {
            warn!(
                capability = %self.reasoning_capability,
                error = output.error.as_deref().unwrap_or(""),
                "Reasoning capability failed"
            );
            return None;
        }

        let choice = output
            .data
            .and_then(|d| serde_json::from_value::<ReasonedChoice>(d).ok())
            .or_else(|| parse_choice(&output.output));
        let Some(choice) = choice else {
            warn!(output = %output.output, "Unparseable routing choice");
            return None;
        };
        if !self.is_target(registry, &choice.capability) {
            warn!(capability = %choice.capability, "Reasoning chose an unknown capability");
            return None;
        }

        debug!(capability = %choice.capability, confidence = ?choice.confidence, "Routing by reasoning");
        Some(Route {
            capability: choice.capability,
            parameters: choice.parameters.unwrap_or_default(),
            source: RouteSource::Reasoned,
            confidence: choice.confidence,
        })
    }

    /// Next hop for an output carrying references, if the chain may grow.
    pub fn next_hop(
        &self,
        registry: &CapabilityRegistry,
        kind: ReferenceKind,
        already_run: &[String],
    ) -> Option<Route> {
        registry
            .consumers_of(kind)
            .into_iter()
            .find(|d| !self.is_internal(&d.name) && !already_run.contains(&d.name))
            .map(|d| Route::new(d.name, RouteSource::Chained))
    }
}

/// Accept either a bare JSON object or one embedded in surrounding text.
fn parse_choice(text: &str) -> Option<ReasonedChoice> {
    if let Ok(choice) = serde_json::from_str(text.trim()) {
        return Some(choice);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end)
        .then(|| serde_json::from_str(&text[start..=end]).ok())
        .flatten()
}

/// `http(s)` URLs in `text`, in order, without trailing punctuation.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '"' | '\'' | '(' | ')' | '[' | ']')) {
        if !(token.starts_with("http://") || token.starts_with("https://")) {
            continue;
        }
        let url = token.trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if url.len() > "https://".len() && !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

const DEPTH_WORDS: &[&str] = &[
    "detail", "details", "detailed", "deeper", "depth", "elaborate", "expand", "fetch", "full",
    "in-depth", "more", "open", "read", "thorough",
];

/// Whether the query asks for more than a first answer.
pub fn wants_depth(query: &str) -> bool {
    query
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .any(|t| DEPTH_WORDS.contains(&t))
}
