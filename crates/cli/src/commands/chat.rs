//! `routewise chat`: interactive session.
//!
//! `/end` closes the session into an episode and starts a new one,
//! `/clear` forgets the current conversation, `exit` quits.

use chrono::Utc;
use routewise_core::request::ExecutionRequest;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::commands::ask::{print_failure, print_outcome};
use crate::runtime;

fn fresh_session() -> String {
    format!("chat-{}", Utc::now().format("%Y%m%d%H%M%S%3f"))
}

pub async fn run(session: Option<String>, user: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    let orchestrator = runtime::build(&config).await?;
    let mut session_id = session.unwrap_or_else(fresh_session);

    println!();
    println!("  Routewise, interactive mode");
    println!();
    println!("  Session:      {session_id}");
    println!("  Capabilities: {}", orchestrator.registry().names().join(", "));
    println!("  Policies:     {}", if orchestrator.policy().is_enabled() { "enabled" } else { "disabled" });
    println!();
    println!("  /end closes the session, /clear forgets it, exit quits.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;

    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        match input {
            "" => {}
            "exit" | "quit" | "/exit" => break,
            "/end" => {
                match orchestrator.finalize_session(&session_id).await {
                    Ok(episode) => {
                        println!("  Session closed: {}", episode.summary);
                    }
                    Err(e) => eprintln!("  [Error] {e}"),
                }
                session_id = fresh_session();
                println!("  New session: {session_id}");
            }
            "/clear" => {
                orchestrator.clear_session(&session_id).await;
                println!("  Conversation cleared.");
            }
            query => {
                let mut request = ExecutionRequest::new(&session_id, query);
                if let Some(user) = &user {
                    request = request.with_user(user);
                }
                match orchestrator.handle(request).await {
                    Ok(outcome) => {
                        println!();
                        print_outcome(&outcome);
                    }
                    Err(failure) => print_failure(&failure),
                }
                println!();
            }
        }
        prompt()?;
    }

    orchestrator.wait_idle(&session_id).await;
    println!();
    println!("  Goodbye!");
    Ok(())
}

fn prompt() -> std::io::Result<()> {
    use std::io::Write;
    print!("  You > ");
    std::io::stdout().flush()
}
