use anyhow::Result;
use std::path::Path;

use crate::cli::config::Config;
use crate::engine::plan::RunPlan;
use crate::utils::format_duration;

/// Validate a scenario file without generating load.
/// Checks for:
/// - YAML/JSON syntax errors
/// - Stage, request, check and threshold validity
pub fn run_validate(scenario: &Path) -> Result<RunPlan> {
    println!("Validating {}...", scenario.display());

    let plan = match Config::load(scenario).and_then(Config::into_plan) {
        Ok(plan) => plan,
        Err(e) => {
            println!("  ✗ Validation failed: {}", e);
            return Err(e.into());
        }
    };

    println!("  ✓ Scenario parsed");
    println!("    name: {}", plan.name);
    println!(
        "    request: {} {}",
        plan.request.method(),
        plan.request.url()
    );
    println!(
        "    stages: {} stage(s), {} total, peak {} VUs",
        plan.timeline.stages().len(),
        format_duration(plan.timeline.total_duration()),
        plan.timeline.peak_target()
    );
    for (i, stage) in plan.timeline.stages().iter().enumerate() {
        println!(
            "      {}. {} -> {} VUs",
            i + 1,
            format_duration(stage.duration),
            stage.target
        );
    }
    if !plan.checks.is_empty() {
        println!("    checks: {}", plan.checks.len());
    }
    for threshold in &plan.thresholds {
        let abort = if threshold.abort_on_fail { " (abort on fail)" } else { "" };
        println!("    threshold: {} {}{}", threshold.metric, threshold.expression, abort);
    }

    Ok(plan)
}
