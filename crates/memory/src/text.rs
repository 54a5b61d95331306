//! Deterministic text helpers shared by memory components: keyword
//! extraction and the extractive conversation summary.

use routewise_core::message::{ConversationTurn, Role};

const STOPWORDS: &[&str] = &[
    "a", "about", "all", "also", "an", "and", "any", "are", "as", "at", "be", "but", "by",
    "can", "could", "did", "do", "does", "for", "from", "get", "give", "had", "has", "have",
    "how", "i", "if", "in", "into", "is", "it", "its", "me", "more", "my", "no", "not", "of",
    "on", "or", "our", "please", "show", "so", "some", "tell", "than", "that", "the", "their",
    "them", "then", "there", "these", "they", "this", "to", "us", "was", "we", "were", "what",
    "when", "where", "which", "who", "why", "will", "with", "would", "you", "your",
];

/// Lowercased alphanumeric tokens, in order of appearance.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Distinct non-stopword tokens of at least three characters, first
/// occurrence first.
pub fn keywords(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in tokenize(text) {
        if token.chars().count() < 3 || STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        if !out.contains(&token) {
            out.push(token);
        }
    }
    out
}

/// Extractive summary of a run of turns:
/// `User asked about: q1, q2, q3. and N other topics. Used tools: a, b`.
pub fn summarize_turns(turns: &[ConversationTurn]) -> String {
    let queries: Vec<&str> = turns
        .iter()
        .filter(|t| t.role == Role::User)
        .map(|t| t.content.trim())
        .collect();

    let mut tools: Vec<&str> = Vec::new();
    for turn in turns.iter().filter(|t| t.role == Role::Assistant) {
        for tool in &turn.tool_calls {
            if !tools.contains(&tool.as_str()) {
                tools.push(tool);
            }
        }
    }

    let mut parts = Vec::new();
    if !queries.is_empty() {
        let shown: Vec<&str> = queries.iter().take(3).copied().collect();
        parts.push(format!("User asked about: {}", shown.join(", ")));
        if queries.len() > 3 {
            parts.push(format!("and {} other topics", queries.len() - 3));
        }
    }
    if !tools.is_empty() {
        parts.push(format!("Used tools: {}", tools.join(", ")));
    }

    if parts.is_empty() {
        "Brief conversation session".to_string()
    } else {
        parts.join(". ")
    }
}

/// The first `max_sentences` sentences of `text`, whitespace-normalized.
pub fn leading_sentences(text: &str, max_sentences: usize) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out = String::new();
    let mut count = 0;
    for (i, c) in normalized.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let next = normalized[i + c.len_utf8()..].chars().next();
            if next.is_none() || next == Some(' ') {
                count += 1;
                if count == max_sentences {
                    out = normalized[..i + c.len_utf8()].to_string();
                    break;
                }
            }
        }
    }
    if out.is_empty() { normalized } else { out }
}

/// Truncate to at most `max_chars` characters, keeping the tail.
pub fn keep_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
