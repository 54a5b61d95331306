//! Query categorization used to key learned routing preferences.

use serde::{Deserialize, Serialize};

/// Coarse kind of request, detected from the query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryCategory {
    Calculation,
    CodeExecution,
    FileOperation,
    WebSearch,
    DocumentManagement,
    DocumentSearch,
}

const CALCULATION: &[&str] = &[
    "calculate", "calculation", "compute", "multiply", "divide", "add", "subtract", "plus",
    "minus", "times", "sum", "sqrt", "percent", "percentage", "math",
];
const CODE: &[&str] = &["python", "code", "execute", "run", "script", "program", "function"];
const FILES: &[&str] = &["file", "files", "read", "list", "directory", "folder"];
const WEB: &[&str] = &["current", "latest", "today", "weather", "news", "recent", "search", "web"];
const DOCUMENTS: &[&str] = &["documents", "indexed", "stats", "collection"];

impl QueryCategory {
    pub const ALL: [QueryCategory; 6] = [
        QueryCategory::Calculation,
        QueryCategory::CodeExecution,
        QueryCategory::FileOperation,
        QueryCategory::WebSearch,
        QueryCategory::DocumentManagement,
        QueryCategory::DocumentSearch,
    ];

    /// Detect the category of a query. First matching family wins;
    /// anything unrecognized is a document search.
    pub fn detect(query: &str) -> Self {
        let lowered = query.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        let has = |words: &[&str]| tokens.iter().any(|t| words.contains(t));

        if has(CALCULATION) || has_arithmetic(&lowered) {
            QueryCategory::Calculation
        } else if has(CODE) {
            QueryCategory::CodeExecution
        } else if has(FILES) {
            QueryCategory::FileOperation
        } else if has(WEB) {
            QueryCategory::WebSearch
        } else if has(DOCUMENTS) {
            QueryCategory::DocumentManagement
        } else {
            QueryCategory::DocumentSearch
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryCategory::Calculation => "calculation",
            QueryCategory::CodeExecution => "code_execution",
            QueryCategory::FileOperation => "file_operation",
            QueryCategory::WebSearch => "web_search",
            QueryCategory::DocumentManagement => "document_management",
            QueryCategory::DocumentSearch => "document_search",
        }
    }
}

impl std::fmt::Display for QueryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A digit, an arithmetic operator, then a digit (spaces allowed).
fn has_arithmetic(text: &str) -> bool {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(3).any(|w| {
        w[0].is_ascii_digit() && matches!(w[1], '+' | '-' | '*' | '/' | '^' | '%' | 'x') && w[2].is_ascii_digit()
    })
}
