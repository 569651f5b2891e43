use std::path::Path;

use serde_json::json;

use super::demo::{build_context, AUDIT_AGENT};
use super::load_config;

/// Run `runs` audits against the demo context, with every other run
/// failing, then print the health report.
pub async fn run(config_path: Option<&Path>, runs: usize) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let context = build_context(config, true).await?;

    let mut failed = 0usize;
    for i in 0..runs {
        let site = format!("site-{}.example", i);
        if context
            .dispatcher()
            .execute_operation(AUDIT_AGENT, "initial_audit", json!({ "site": site }))
            .await
            .is_err()
        {
            failed += 1;
        }
    }

    let report = context.registry().perform_health_check().await;

    println!();
    println!("🩺 conductor health ({} runs, {} failed)", runs, failed);
    println!("================================");
    for (name, assessment) in &report.agents {
        let rate = assessment
            .success_rate
            .map(|r| format!("{:.0}%", r * 100.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<14} {:<10} score {:.2}  success {}",
            name, assessment.health, assessment.score, rate
        );
        for check in assessment.checks.iter().filter(|c| !c.passed) {
            println!("      ✗ {}: {}", check.name, check.detail);
        }
    }
    println!();
    let stats = context.registry().get_statistics().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
