//! `routewise episodes`: search finalized sessions.

use crate::runtime;

pub async fn run(query: Option<String>, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    let orchestrator = runtime::build(&config).await?;
    let episodic = orchestrator.episodic();

    let episodes: Vec<(usize, routewise_memory::Episode)> = match &query {
        Some(q) => {
            println!("Searching episodes for: \"{q}\"");
            episodic
                .search_text(q, limit)
                .await
                .into_iter()
                .map(|m| (m.score, m.episode))
                .collect()
        }
        None => {
            println!("Recent episodes ({} stored)", episodic.len().await);
            episodic.recent(limit).await.into_iter().map(|e| (0, e)).collect()
        }
    };
    println!();

    if episodes.is_empty() {
        println!("   No episodes found.");
        return Ok(());
    }

    for (i, (score, episode)) in episodes.iter().enumerate() {
        let when = episode.created_at.format("%Y-%m-%d %H:%M");
        if query.is_some() {
            println!("  {:>2}. [{when}] {} (matches: {score})", i + 1, episode.session_id);
        } else {
            println!("  {:>2}. [{when}] {}", i + 1, episode.session_id);
        }
        println!("      {}", episode.summary);
        if !episode.capabilities.is_empty() {
            println!("      capabilities: {}", episode.capabilities.join(", "));
        }
    }

    Ok(())
}
