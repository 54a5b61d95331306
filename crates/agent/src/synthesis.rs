//! Combine capability outputs into the final answer.

use routewise_core::request::ExecutionResult;

/// A synthesized answer and the sources it rests on.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub answer: String,
    pub sources: Vec<String>,
}

/// Build the answer from successful outputs, in execution order.
///
/// A single output is the answer as-is; several are labelled by
/// capability. Sources are deduplicated in first-seen order and listed
/// after the answer.
pub fn synthesize(query: &str, results: &[ExecutionResult]) -> Synthesis {
    let successful: Vec<&ExecutionResult> = results
        .iter()
        .filter(|r| r.success && !r.output.trim().is_empty())
        .collect();

    let mut sources: Vec<String> = Vec::new();
    for source in successful.iter().flat_map(|r| r.sources()) {
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    let mut answer = match successful.as_slice() {
        [] => format!("No result could be produced for: {}", query.trim()),
        [only] => only.output.trim().to_string(),
        many => many
            .iter()
            .map(|r| format!("[{}]\n{}", r.capability, r.output.trim()))
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    if !sources.is_empty() {
        answer.push_str("\n\nSources:");
        for source in &sources {
            answer.push_str(&format!("\n- {source}"));
        }
    }

    Synthesis { answer, sources }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use routewise_core::capability::CapabilityOutput;

    fn result(capability: &str, output: CapabilityOutput) -> ExecutionResult {
        let now = Utc::now();
        ExecutionResult::from_output(capability, output, now, now)
    }

    #[test]
    fn single_output_is_the_answer() {
        let s = synthesize("Calculate 12*7", &[result("calculator", CapabilityOutput::ok("12*7 = 84"))]);
        assert_eq!(s.answer, "12*7 = 84");
        assert!(s.sources.is_empty());
    }

    #[test]
    fn multiple_outputs_keep_order_and_merge_sources() {
        let s = synthesize(
            "rust ownership, more detail",
            &[
                result(
                    "search",
                    CapabilityOutput::ok("See https://a.example")
                        .with_data(serde_json::json!({"sources": ["a.md", "b.md"]})),
                ),
                result("broken", CapabilityOutput::failure("nope")),
                result(
                    "fetch",
                    CapabilityOutput::ok("Page body").with_data(serde_json::json!({"sources": ["b.md"]})),
                ),
            ],
        );
        let search_at = s.answer.find("[search]").unwrap();
        let fetch_at = s.answer.find("[fetch]").unwrap();
        assert!(search_at < fetch_at);
        assert!(!s.answer.contains("[broken]"));
        assert_eq!(s.sources, vec!["a.md", "b.md"]);
        assert!(s.answer.ends_with("Sources:\n- a.md\n- b.md"));
    }

    #[test]
    fn nothing_successful() {
        let s = synthesize("q", &[result("x", CapabilityOutput::failure("boom"))]);
        assert!(s.answer.starts_with("No result could be produced"));
    }
}
