//! The execute handler: drives the layer-by-layer loop over the plan.
//!
//! Each iteration asks the transition manager for the runnable layer,
//! dispatches every task in it on its own worker, awaits the whole batch,
//! applies results (with in-layer retries), and either continues or halts
//! per the continue-on-error policy. Between layers the scheduler is
//! single-threaded and owns every state mutation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};
use uuid::Uuid;

use sr_core::events::{EngineEvent, EventBus};
use sr_core::scope::ScopeValidator;
use sr_core::types::{
    ExecutionContext, ExecutionResult, ExecutionTask, Plan, PlanStrategy, Task, TaskReport,
    TaskStatus, WorktreeContext,
};
use sr_core::validator::PlanValidator;

use crate::agent::{build_prompt, Agent, AgentRequest, AgentStatus};
use crate::cancel::CancelSignal;
use crate::strategy::{EngineError, Result, VcsStrategy};
use crate::transitions::TransitionManager;

// ---------------------------------------------------------------------------
// Worker result
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum WorkerOutcome {
    Completed {
        commit: String,
        branch: Option<String>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug)]
struct WorkerResult {
    task_id: String,
    duration_ms: u64,
    output: Option<String>,
    worktree: Option<WorktreeContext>,
    outcome: WorkerOutcome,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    agent: Arc<dyn Agent>,
    strategy: Arc<dyn VcsStrategy>,
    scope: Arc<ScopeValidator>,
    events: EventBus,
    cancel: CancelSignal,
    sequential: bool,
}

impl Scheduler {
    pub fn new(
        agent: Arc<dyn Agent>,
        strategy: Arc<dyn VcsStrategy>,
        scope: Arc<ScopeValidator>,
        events: EventBus,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            agent,
            strategy,
            scope,
            events,
            cancel,
            sequential: false,
        }
    }

    /// Force one-task layers even for parallel-capable strategies.
    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    /// Validate the plan, then execute it. The engine refuses to start on an
    /// invalid plan.
    pub async fn execute_plan(&self, plan: &Plan, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let report = PlanValidator::new().validate(plan);
        if !report.valid {
            let mut problems = report.errors.clone();
            problems.extend(report.circular_dependencies.iter().map(|c| format!("cycle: {c}")));
            problems.extend(
                report
                    .missing_dependencies
                    .iter()
                    .map(|m| format!("task '{}' requires unknown task '{}'", m.task_id, m.missing)),
            );
            problems.extend(report.conflicts.iter().map(|c| format!("conflict: {c}")));
            return Err(EngineError::PlanInvalid(problems.join("; ")));
        }

        let sequential = self.sequential || plan.strategy == PlanStrategy::Sequential;
        self.execute_inner(&plan.tasks, ctx, sequential).await
    }

    /// Execute a pre-validated task list.
    pub async fn execute(&self, tasks: &[Task], ctx: &ExecutionContext) -> Result<ExecutionResult> {
        self.execute_inner(tasks, ctx, self.sequential).await
    }

    async fn execute_inner(
        &self,
        tasks: &[Task],
        ctx: &ExecutionContext,
        sequential: bool,
    ) -> Result<ExecutionResult> {
        let run_id = Uuid::new_v4();
        let start = Instant::now();
        info!(
            run_id = %run_id,
            tasks = tasks.len(),
            mode = %ctx.vcs_mode,
            strategy = self.strategy.name(),
            "starting run"
        );

        self.strategy.initialize(tasks, ctx).await?;
        self.strategy.prepare_contexts(tasks, ctx).await?;

        let mut manager = TransitionManager::new(tasks, ctx.max_retries);
        let mut exec_tasks: HashMap<String, ExecutionTask> = tasks
            .iter()
            .map(|t| (t.id.clone(), ExecutionTask::new(t.clone(), ctx.max_retries)))
            .collect();
        let mut reports: HashMap<String, TaskReport> = HashMap::new();
        let serial = sequential || !self.strategy.supports_parallel();

        while !manager.all_terminal() {
            if self.cancel.is_cancelled() {
                skip_remaining(&mut manager, &mut reports, &self.events, "cancelled");
                break;
            }

            let mut batch = manager.executable_tasks();
            if batch.is_empty() {
                // Layers are awaited synchronously, so nothing is in flight:
                // whatever remains is blocked on a failed dependency.
                skip_remaining(&mut manager, &mut reports, &self.events, "dependency failed or was skipped");
                break;
            }
            if serial {
                batch.truncate(1);
            }

            let halt = self
                .run_layer_with_retries(batch, &mut manager, &mut exec_tasks, &mut reports, ctx)
                .await;

            if halt && !ctx.continue_on_error {
                skip_remaining(&mut manager, &mut reports, &self.events, "halted due to prior failure");
                break;
            }
        }

        let output = self.strategy.finalize(ctx).await?;

        let failed_ids: HashSet<String> = reports
            .values()
            .filter(|r| r.status == TaskStatus::Failure)
            .map(|r| r.task_id.clone())
            .collect();
        if let Err(e) = self.strategy.cleanup(ctx, &failed_ids).await {
            warn!(error = %e, "cleanup failed");
        }

        // Exactly one entry per input task, in input order.
        let task_reports = tasks
            .iter()
            .map(|t| {
                reports.remove(&t.id).unwrap_or_else(|| TaskReport {
                    task_id: t.id.clone(),
                    status: TaskStatus::Skipped,
                    duration_ms: 0,
                    output: None,
                    error: Some("not executed".into()),
                })
            })
            .collect();

        let result = ExecutionResult {
            tasks: task_reports,
            total_duration_ms: start.elapsed().as_millis() as u64,
            branches: dedup(output.branches),
            commits: dedup(output.commits),
        };

        info!(
            run_id = %run_id,
            succeeded = result.succeeded(),
            failed = result.failed(),
            skipped = result.skipped(),
            branches = result.branches.len(),
            total_ms = result.total_duration_ms,
            "run finished"
        );
        Ok(result)
    }

    /// Run one layer to settlement, including in-place retries. Returns
    /// `true` when some task failed terminally.
    async fn run_layer_with_retries(
        &self,
        batch: Vec<String>,
        manager: &mut TransitionManager,
        exec_tasks: &mut HashMap<String, ExecutionTask>,
        reports: &mut HashMap<String, TaskReport>,
        ctx: &ExecutionContext,
    ) -> bool {
        let mut halt = false;
        let mut to_run = batch;

        while !to_run.is_empty() {
            let results = self.run_layer(&to_run, manager, exec_tasks, ctx).await;
            let mut retries = Vec::new();

            for result in results {
                let id = result.task_id.clone();
                match result.outcome {
                    WorkerOutcome::Completed { commit, branch } => {
                        if let Some(exec) = exec_tasks.get_mut(&id) {
                            exec.commit = Some(commit);
                            exec.branch = branch;
                            exec.worktree_path = result.worktree.as_ref().map(|w| w.path.clone());
                        }
                        manager.complete_task(&id);
                        reports.insert(
                            id.clone(),
                            TaskReport {
                                task_id: id,
                                status: TaskStatus::Success,
                                duration_ms: result.duration_ms,
                                output: result.output,
                                error: None,
                            },
                        );
                    }
                    WorkerOutcome::Failed { error } => {
                        manager.fail_task(&id, &error);
                        self.events.publish(EngineEvent::task_failed(&id, &error));

                        if manager.retry_task(&id) {
                            info!(
                                task_id = %id,
                                attempt = manager.retry_count(&id),
                                "retrying failed task in place"
                            );
                            if let Some(exec) = exec_tasks.get_mut(&id) {
                                exec.retry_count = manager.retry_count(&id);
                            }
                            if let (Some(wctx), Some(exec)) =
                                (&result.worktree, exec_tasks.get(&id))
                            {
                                if let Err(e) =
                                    self.strategy.reset_for_retry(&exec.task, wctx).await
                                {
                                    warn!(task_id = %id, error = %e, "retry reset failed");
                                }
                            }
                            retries.push(id);
                        } else {
                            halt = true;
                            reports.insert(
                                id.clone(),
                                TaskReport {
                                    task_id: id,
                                    status: TaskStatus::Failure,
                                    duration_ms: result.duration_ms,
                                    output: result.output,
                                    error: Some(error),
                                },
                            );
                        }
                    }
                }
            }

            to_run = retries;
        }

        halt
    }

    /// Dispatch one batch concurrently and await all of it (the layer
    /// barrier). Worker panics are converted to task failures.
    async fn run_layer(
        &self,
        ids: &[String],
        manager: &mut TransitionManager,
        exec_tasks: &HashMap<String, ExecutionTask>,
        ctx: &ExecutionContext,
    ) -> Vec<WorkerResult> {
        let mut handles = Vec::with_capacity(ids.len());

        for id in ids {
            manager.start_task(id);
            let task = exec_tasks
                .get(id)
                .map(|e| e.task.clone())
                .expect("task exists for dispatched id");

            let agent = self.agent.clone();
            let strategy = self.strategy.clone();
            let scope = self.scope.clone();
            let events = self.events.clone();
            let cancel = self.cancel.clone();
            let ctx = ctx.clone();

            handles.push(tokio::spawn(async move {
                run_worker(agent, strategy, scope, events, cancel, task, ctx).await
            }));
        }

        let mut results = Vec::with_capacity(ids.len());
        for (id, handle) in ids.iter().zip(handles) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push(WorkerResult {
                    task_id: id.clone(),
                    duration_ms: 0,
                    output: None,
                    worktree: None,
                    outcome: WorkerOutcome::Failed {
                        error: format!("worker panicked: {e}"),
                    },
                }),
            }
        }
        results
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Per-task pipeline: prepare the working copy, invoke the agent, then let
/// the strategy validate and commit. Never panics outward; every failure is
/// a structured result.
async fn run_worker(
    agent: Arc<dyn Agent>,
    strategy: Arc<dyn VcsStrategy>,
    scope: Arc<ScopeValidator>,
    events: EventBus,
    cancel: CancelSignal,
    task: Task,
    ctx: ExecutionContext,
) -> WorkerResult {
    let start = Instant::now();
    events.publish(EngineEvent::task_started(&task.id));

    let wctx = match strategy.prepare_task(&task, &ctx).await {
        Ok(wctx) => wctx,
        Err(e) => {
            return WorkerResult {
                task_id: task.id.clone(),
                duration_ms: start.elapsed().as_millis() as u64,
                output: None,
                worktree: None,
                outcome: WorkerOutcome::Failed {
                    error: format!("workspace preparation failed: {e}"),
                },
            }
        }
    };

    let allowed: Vec<String> = scope.allowed_files(&task.id).into_iter().collect();
    let forbidden = scope.forbidden_files(&task.id);
    let prompt = build_prompt(&task, &allowed, &forbidden);

    let request = AgentRequest {
        task_id: task.id.clone(),
        name: task.name.clone(),
        prompt,
        files: allowed,
        forbidden_files: forbidden,
        workdir: wctx.path.clone(),
        agent_type: ctx.agent_type.clone(),
    };

    let outcome = agent.execute_task(&request, &cancel).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    if outcome.status == AgentStatus::Failed {
        return WorkerResult {
            task_id: task.id.clone(),
            duration_ms,
            output: outcome.output,
            worktree: Some(wctx),
            outcome: WorkerOutcome::Failed {
                error: outcome.error.unwrap_or_else(|| "agent failed".into()),
            },
        };
    }

    let commit = strategy.handle_completion(&task, &wctx, &ctx).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match commit.commit {
        Some(hash) => WorkerResult {
            task_id: task.id.clone(),
            duration_ms,
            output: outcome.output,
            worktree: Some(wctx),
            outcome: WorkerOutcome::Completed {
                commit: hash,
                branch: commit.branch,
            },
        },
        None => WorkerResult {
            task_id: task.id.clone(),
            duration_ms,
            output: outcome.output,
            worktree: Some(wctx),
            outcome: WorkerOutcome::Failed {
                error: commit
                    .error
                    .unwrap_or_else(|| "no changes to commit".into()),
            },
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn skip_remaining(
    manager: &mut TransitionManager,
    reports: &mut HashMap<String, TaskReport>,
    events: &EventBus,
    reason: &str,
) {
    for id in manager.task_ids().to_vec() {
        let terminal = manager
            .state(&id)
            .map(|s| s.is_terminal())
            .unwrap_or(true);
        if terminal {
            continue;
        }
        manager.skip_task(&id, reason);
        events.publish(EngineEvent::task_skipped(&id, reason));
        reports.entry(id.clone()).or_insert_with(|| TaskReport {
            task_id: id,
            status: TaskStatus::Skipped,
            duration_ms: 0,
            output: None,
            error: Some(reason.to_string()),
        });
    }
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
