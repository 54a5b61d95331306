//! `routewise ask`: one query, one answer.

use routewise_agent::{TaskFailure, TaskOutcome};
use routewise_core::request::ExecutionRequest;

use crate::runtime;

pub async fn run(
    query: &str,
    session: &str,
    user: Option<String>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    let orchestrator = runtime::build(&config).await?;

    let mut request = ExecutionRequest::new(session, query);
    if let Some(user) = user {
        request = request.with_user(user);
    }
    let result = orchestrator.handle(request).await;
    // Let background reflection land before the process exits.
    orchestrator.wait_idle(session).await;

    match result {
        Ok(outcome) if json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        Ok(outcome) => print_outcome(&outcome),
        Err(failure) if json => println!("{}", serde_json::to_string_pretty(&failure)?),
        Err(failure) => {
            print_failure(&failure);
            return Err(failure.into());
        }
    }
    Ok(())
}

pub fn print_outcome(outcome: &TaskOutcome) {
    println!("{}", outcome.answer);
    if outcome.partial {
        eprintln!("  (partial result)");
    }
    for warning in &outcome.warnings {
        eprintln!("  warning: {warning}");
    }
}

pub fn print_failure(failure: &TaskFailure) {
    eprintln!("  [{}] {}", failure.kind, failure.message);
    if failure.retryable {
        eprintln!("  (retryable)");
    }
}
