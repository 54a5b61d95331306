//! Keyword-overlap reasoner. Picks a capability for a query from the
//! registry's description block.
//!
//! Produces the structured choice the orchestrator expects:
//! `{"capability": "...", "confidence": 0.0..1.0, "parameters": {...}}`.

use async_trait::async_trait;
use routewise_core::capability::{Capability, CapabilityOutput};
use routewise_memory::text::keywords;

pub struct KeywordReasoner;

/// Shared-prefix length for two words to count as the same stem.
const STEM: usize = 5;

fn same_stem(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    a.len() >= STEM && b.len() >= STEM && a.as_bytes()[..STEM] == b.as_bytes()[..STEM]
}

/// Parse `- name: description` lines.
fn parse_block(block: &str) -> Vec<(String, String)> {
    block
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("- ")?;
            let (name, description) = rest.split_once(':')?;
            Some((name.trim().to_string(), description.trim().to_string()))
        })
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

fn has_arithmetic(query: &str) -> bool {
    let chars: Vec<char> = query.chars().filter(|c| !c.is_whitespace()).collect();
    chars
        .windows(3)
        .any(|w| w[0].is_ascii_digit() && matches!(w[1], '+' | '-' | '*' | '/' | '^' | 'x') && w[2].is_ascii_digit())
}

/// Score every candidate; returns `(name, score)` in block order.
fn score(query: &str, candidates: &[(String, String)]) -> Vec<(String, usize)> {
    let query_words = keywords(query);
    let arithmetic = has_arithmetic(query);
    candidates
        .iter()
        .map(|(name, description)| {
            let description_words = keywords(&format!("{} {}", name.replace('_', " "), description));
            let mut hits = query_words
                .iter()
                .filter(|q| description_words.iter().any(|d| same_stem(q, d)))
                .count();
            if arithmetic
                && description_words
                    .iter()
                    .any(|d| d.starts_with("calculat") || d.starts_with("arithmetic") || d.starts_with("math"))
            {
                hits += 2;
            }
            (name.clone(), hits)
        })
        .collect()
}

#[async_trait]
impl Capability for KeywordReasoner {
    fn name(&self) -> &str {
        "reasoner"
    }

    fn description(&self) -> &str {
        "Choose the best capability for a query from a list of capability descriptions."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "capabilities": {
                    "type": "string",
                    "description": "One '- name: description' line per candidate"
                }
            },
            "required": ["query", "capabilities"]
        })
    }

    async fn execute(&self, parameters: serde_json::Value) -> CapabilityOutput {
        let Some(query) = parameters["query"].as_str() else {
            return CapabilityOutput::failure("Missing 'query' argument");
        };
        let candidates: Vec<(String, String)> = parse_block(parameters["capabilities"].as_str().unwrap_or(""))
            .into_iter()
            .filter(|(name, _)| name != self.name())
            .collect();
        if candidates.is_empty() {
            return CapabilityOutput::failure("No candidate capabilities supplied");
        }

        let scored = score(query, &candidates);
        let total: usize = scored.iter().map(|(_, s)| *s).sum();
        let best = scored
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.1.cmp(&b.1).then(ib.cmp(ia)))
            .map(|(_, b)| b.clone());

        let (choice, confidence) = match best {
            Some((name, hits)) if hits > 0 => (name, hits as f64 / total.max(1) as f64),
            _ => {
                // Nothing overlaps: prefer a general-purpose capability.
                match candidates
                    .iter()
                    .find(|(_, d)| d.to_lowercase().contains("general"))
                {
                    Some((name, _)) => (name.clone(), 0.1),
                    None => return CapabilityOutput::failure("No capability matches the query"),
                }
            }
        };

        let decision = serde_json::json!({
            "capability": choice,
            "confidence": confidence,
            "parameters": {},
        });
        CapabilityOutput::ok(decision.to_string()).with_data(decision)
    }
}
