use std::path::Path;

use anyhow::bail;

use sr_core::plan::load_plan;
use sr_core::validator::PlanValidator;

pub fn run(plan_path: &Path, strict: bool, json: bool) -> anyhow::Result<()> {
    let plan = load_plan(plan_path)?;
    let report = PlanValidator::new().with_strict(strict).validate(&plan);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "plan '{}': {} tasks, {}",
            plan.name,
            plan.tasks.len(),
            if report.valid { "valid" } else { "INVALID" }
        );
        for error in &report.errors {
            println!("  error: {error}");
        }
        for cycle in &report.circular_dependencies {
            println!("  cycle: {cycle}");
        }
        for missing in &report.missing_dependencies {
            println!(
                "  missing dependency: task '{}' requires '{}'",
                missing.task_id, missing.missing
            );
        }
        for conflict in &report.conflicts {
            println!("  conflict: {conflict}");
        }
    }

    if !report.valid {
        bail!("plan validation failed");
    }
    Ok(())
}
