//! `routewise stats` and `routewise reset-learning`.

use crate::runtime;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    let orchestrator = runtime::build(&config).await?;
    let summary = orchestrator.learning().summary().await;

    println!("Learning Summary");
    println!("─────────────────────────────────────");
    println!("  Actions:        {}", summary.total_actions);
    println!("  Successes:      {}", summary.total_successes);
    println!("  Failures:       {}", summary.total_failures);
    println!("  Success rate:   {:.1}%", summary.success_rate * 100.0);
    println!("  Avg quality:    {:.2}", summary.avg_quality_score);
    println!("  Capabilities:   {}", summary.unique_capabilities);
    println!("  Categories:     {}", summary.categories_learned);

    if !summary.rankings.is_empty() {
        println!();
        println!("  Rankings:");
        for (i, (capability, score)) in summary.rankings.iter().enumerate() {
            println!("    {:>2}. {capability:<24} {score:.3}", i + 1);
        }
    }

    if !summary.preferences.is_empty() {
        println!();
        println!("  Preferred per category:");
        for (category, capability) in &summary.preferences {
            println!("    {category:<20} → {capability}");
        }
    }

    if !summary.common_errors.is_empty() {
        println!();
        println!("  Common errors:");
        for (category, count) in &summary.common_errors {
            println!("    {category:<20} {count}");
        }
    }

    Ok(())
}

pub async fn reset(confirm: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !confirm {
        println!("This forgets all learned routing statistics.");
        println!("   Run with --confirm to proceed:");
        println!("   routewise reset-learning --confirm");
        return Ok(());
    }

    let config = runtime::load_config()?;
    let orchestrator = runtime::build(&config).await?;
    orchestrator.learning().reset().await;
    println!("Learning statistics reset.");
    Ok(())
}
