use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{info, warn};

use sr_core::config::EngineConfig;
use sr_core::events::EventBus;
use sr_core::graph::TaskGraph;
use sr_core::plan::load_plan;
use sr_core::scope::ScopeValidator;
use sr_core::types::{ExecutionContext, Plan, TaskStatus, ValidationMode, VcsMode};
use sr_core::validator::PlanValidator;
use sr_engine::agent::SubprocessAgent;
use sr_engine::cancel::CancelSignal;
use sr_engine::scheduler::Scheduler;
use sr_engine::strategy::strategy_for_mode;
use sr_vcs::backend::select_backend;
use sr_vcs::process::{CommandRunner, TokioCommandRunner};

pub struct RunArgs {
    pub plan: PathBuf,
    pub repo: PathBuf,
    pub mode: Option<String>,
    pub continue_on_error: bool,
    pub max_retries: Option<u32>,
    pub agent: Option<String>,
    pub parent_ref: Option<String>,
    pub permissive: bool,
    pub dry_run: bool,
    pub json: bool,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let plan = load_plan(&args.plan)?;
    let mut config = EngineConfig::load(&args.repo).context("loading engine config")?;
    if let Some(max_retries) = args.max_retries {
        config.run.max_retries = max_retries;
    }
    if let Some(agent) = &args.agent {
        config.agent.command = agent.clone();
    }

    // Validation gates the run regardless of mode.
    let report = PlanValidator::new().validate(&plan);
    if !report.valid {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        bail!("plan '{}' is invalid; run `sr validate` for details", plan.name);
    }

    if args.dry_run {
        return print_layer_plan(&plan, args.json);
    }

    // Resolve the backend: an explicitly requested tool must exist, the
    // default may fall back to merge-commit.
    let requested = match &args.mode {
        Some(name) => match VcsMode::parse(name) {
            Some(mode) => mode,
            None => bail!("unknown vcs mode '{name}'"),
        },
        None => VcsMode::GitSpice,
    };
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
    let timeout = Duration::from_secs(config.vcs.subprocess_timeout_secs);
    let (_backend, mode) =
        select_backend(requested, args.mode.is_some(), runner.clone(), timeout).await?;

    let validation_mode = if args.permissive {
        ValidationMode::Permissive
    } else {
        config.scope.validation_mode
    };
    let scope = Arc::new(ScopeValidator::new(
        &plan.tasks,
        validation_mode,
        config.scope.allow_new_files,
    ));

    let events = EventBus::new();
    let strategy = strategy_for_mode(
        mode,
        runner.clone(),
        scope.clone(),
        &config,
        events.clone(),
        &args.repo,
    );
    let agent = Arc::new(SubprocessAgent::new(runner, config.agent.clone()));

    let cancel = CancelSignal::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight tasks then stopping");
            ctrl_c_cancel.cancel();
        }
    });

    let mut ctx = ExecutionContext::new(&args.repo, mode);
    ctx.agent_type = config.agent.command.clone();
    ctx.continue_on_error = args.continue_on_error || config.run.continue_on_error;
    ctx.max_retries = config.run.max_retries;
    ctx.validation_mode = validation_mode;
    ctx.parent_ref = args.parent_ref.clone();

    let scheduler = Scheduler::new(agent, strategy, scope, events, cancel);
    let result = scheduler.execute_plan(&plan, &ctx).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for task in &result.tasks {
            let marker = match task.status {
                TaskStatus::Success => "ok",
                TaskStatus::Failure => "FAILED",
                TaskStatus::Skipped => "skipped",
            };
            match &task.error {
                Some(error) => println!("  {:<8} {}  ({error})", marker, task.task_id),
                None => println!("  {:<8} {}", marker, task.task_id),
            }
        }
        println!(
            "{} succeeded, {} failed, {} skipped in {}ms",
            result.succeeded(),
            result.failed(),
            result.skipped(),
            result.total_duration_ms
        );
        if !result.branches.is_empty() {
            println!("branches:");
            for branch in &result.branches {
                println!("  {branch}");
            }
        }
    }

    info!(
        plan = %plan.name,
        succeeded = result.succeeded(),
        failed = result.failed(),
        "run complete"
    );
    if result.has_failures() {
        bail!("{} task(s) failed", result.failed());
    }
    Ok(())
}

/// Print the layers the scheduler would dispatch, without running anything.
fn print_layer_plan(plan: &Plan, json: bool) -> anyhow::Result<()> {
    let graph = TaskGraph::build(&plan.tasks);
    let mut level: Vec<usize> = vec![0; graph.len()];
    let Some(order) = graph.topological_order() else {
        bail!("plan contains a dependency cycle");
    };
    for &idx in &order {
        level[idx] = graph
            .requires_of(idx)
            .iter()
            .map(|&dep| level[dep] + 1)
            .max()
            .unwrap_or(0);
    }

    let depth = level.iter().copied().max().map(|d| d + 1).unwrap_or(0);
    let layers: Vec<Vec<&str>> = (0..depth)
        .map(|layer| {
            order
                .iter()
                .filter(|&&idx| level[idx] == layer)
                .map(|&idx| graph.task(idx).id.as_str())
                .collect()
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&layers)?);
    } else {
        println!("plan '{}': {} layers", plan.name, layers.len());
        for (i, layer) in layers.iter().enumerate() {
            println!("  layer {}: {}", i + 1, layer.join(", "));
        }
    }
    Ok(())
}
