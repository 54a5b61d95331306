//! `routewise policies` and `routewise violations`.

use routewise_policy::PolicyEngine;

use crate::runtime;

pub async fn rules() -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    let engine = runtime::load_policies(&config)?;

    if !engine.is_enabled() {
        println!("Policy evaluation is disabled (policy_enabled = false).");
        return Ok(());
    }

    let rules = engine.list_rules();
    println!("Policy Rules ({} active)", engine.active_count());
    println!("─────────────────────────────────────────────────────");
    println!("{:<24} {:<16} {:<10} {:>8}", "Rule", "Type", "Action", "Priority");
    for rule in &rules {
        let marker = if rule.enabled { "" } else { " (disabled)" };
        println!(
            "{:<24} {:<16} {:<10} {:>8}{marker}",
            rule.id,
            rule.rule_type().to_string(),
            rule.effective_action().to_string(),
            rule.priority
        );
        if !rule.description.is_empty() {
            println!("    {}", rule.description);
        }
    }

    if let Some(path) = &config.policy_file {
        println!();
        println!("  Loaded from: {path}");
    }

    Ok(())
}

pub async fn violations(session: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime::load_config()?;
    let (_, logs) = runtime::open_stores(&config)?;

    let records: Vec<_> = PolicyEngine::load_violations(logs.as_ref())
        .await
        .into_iter()
        .filter(|v| session.as_deref().is_none_or(|s| v.session_id == s))
        .collect();

    if records.is_empty() {
        println!("No policy violations recorded.");
        return Ok(());
    }

    println!("Policy Violations ({})", records.len());
    println!("─────────────────────────────────────────────────────");
    for v in &records {
        println!(
            "  [{}] {} {} by '{}' ({})",
            v.timestamp.format("%Y-%m-%d %H:%M:%S"),
            v.session_id,
            v.action,
            v.rule_id,
            v.rule_type
        );
        if let Some(capability) = &v.capability {
            println!("      capability: {capability}");
        }
        println!("      {}", v.message);
    }

    Ok(())
}
