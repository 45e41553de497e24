//! End-to-end scheduler scenarios: happy paths, diamonds, halts, retries,
//! and scope violations, driven through the real strategies over a scripted
//! command runner and a scripted agent (no real git, no real agent CLI).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use sr_core::config::EngineConfig;
use sr_core::events::EventBus;
use sr_core::scope::ScopeValidator;
use sr_core::types::{
    Complexity, ExecutionContext, Plan, Task, TaskStatus, ValidationMode, VcsMode,
};
use sr_engine::agent::{Agent, AgentOutcome, AgentRequest};
use sr_engine::cancel::CancelSignal;
use sr_engine::scheduler::Scheduler;
use sr_engine::strategy::{strategy_for_mode, EngineError};
use sr_vcs::process::{CmdOutput, CmdRequest, CommandRunner};

// ===========================================================================
// Test doubles
// ===========================================================================

/// Command runner simulating a healthy repository: every tool call succeeds,
/// `rev-parse HEAD` mints a fresh hash, and `diff --cached` answers from a
/// per-worktree script (or a FIFO queue for the direct strategy, where every
/// task shares one cwd).
struct FakeRepoRunner {
    commands: Mutex<Vec<String>>,
    hash_counter: AtomicUsize,
    /// (cwd substring, staged file list) — first match wins.
    staged_by_dir: Vec<(String, String)>,
    /// Popped per `diff --cached` call before `staged_by_dir` is consulted.
    staged_queue: Mutex<Vec<String>>,
}

impl FakeRepoRunner {
    fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            hash_counter: AtomicUsize::new(0),
            staged_by_dir: Vec::new(),
            staged_queue: Mutex::new(Vec::new()),
        }
    }

    fn with_staged_by_dir(mut self, entries: &[(&str, &str)]) -> Self {
        self.staged_by_dir = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    fn with_staged_queue(self, entries: &[&str]) -> Self {
        *self.staged_queue.lock().unwrap() = entries.iter().map(|s| s.to_string()).collect();
        self
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRepoRunner {
    async fn run(&self, req: &CmdRequest) -> sr_vcs::process::Result<CmdOutput> {
        let line = req.display_line();
        self.commands.lock().unwrap().push(line.clone());

        let stdout = if line == "git rev-parse HEAD" {
            let n = self.hash_counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!("hash{n:04}\n")
        } else if line == "git diff --cached --name-only" {
            let mut queue = self.staged_queue.lock().unwrap();
            if !queue.is_empty() {
                queue.remove(0)
            } else {
                let cwd = req.cwd.to_string_lossy();
                self.staged_by_dir
                    .iter()
                    .find(|(key, _)| cwd.contains(key.as_str()))
                    .map(|(_, files)| files.clone())
                    .unwrap_or_else(|| "src/file.rs\n".to_string())
            }
        } else {
            String::new()
        };

        Ok(CmdOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

/// Agent with scripted outcomes per task id. Default outcome is success.
/// Tracks invocation counts and the peak number of concurrent invocations.
struct ScriptedAgent {
    outcomes: Mutex<HashMap<String, Vec<AgentOutcome>>>,
    invocations: Mutex<Vec<String>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedAgent {
    fn all_success() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Script outcomes for one task; once exhausted the agent succeeds.
    fn script(self, task_id: &str, outcomes: Vec<AgentOutcome>) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .insert(task_id.to_string(), outcomes);
        self
    }

    fn invocation_count(&self, task_id: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == task_id)
            .count()
    }

    fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn execute_task(&self, req: &AgentRequest, _cancel: &CancelSignal) -> AgentOutcome {
        self.invocations.lock().unwrap().push(req.task_id.clone());

        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        // Give overlapping workers a chance to overlap observably.
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        let mut outcomes = self.outcomes.lock().unwrap();
        match outcomes.get_mut(&req.task_id) {
            Some(scripted) if !scripted.is_empty() => scripted.remove(0),
            _ => AgentOutcome::completed(format!("agent done: {}", req.task_id)),
        }
    }
}

// ===========================================================================
// Helpers
// ===========================================================================

fn task(id: &str, files: &[&str], requires: &[&str]) -> Task {
    Task::new(id, id.to_uppercase(), Complexity::S)
        .with_description("apply the planned modification")
        .with_files(files.iter().map(|s| s.to_string()).collect())
        .with_requires(requires.iter().map(|s| s.to_string()).collect())
}

fn scheduler(
    root: &Path,
    runner: Arc<FakeRepoRunner>,
    agent: Arc<ScriptedAgent>,
    tasks: &[Task],
    mode: VcsMode,
) -> (Scheduler, ExecutionContext) {
    let mut config = EngineConfig::default();
    config.stack.backoff_base_ms = 1;

    let scope = Arc::new(ScopeValidator::new(tasks, ValidationMode::Strict, false));
    let events = EventBus::new();
    let strategy = strategy_for_mode(
        mode,
        runner,
        scope.clone(),
        &config,
        events.clone(),
        root,
    );

    let scheduler = Scheduler::new(agent, strategy, scope, events, CancelSignal::new());
    let mut ctx = ExecutionContext::new(root, mode);
    ctx.parent_ref = Some("main".into());
    (scheduler, ctx)
}

fn report_for<'a>(
    result: &'a sr_core::types::ExecutionResult,
    id: &str,
) -> &'a sr_core::types::TaskReport {
    result
        .tasks
        .iter()
        .find(|t| t.task_id == id)
        .unwrap_or_else(|| panic!("no report for task {id}"))
}

// ===========================================================================
// S1 — happy path, linear, stacked
// ===========================================================================

#[tokio::test]
async fn linear_stacked_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![
        task("a", &["a.rs"], &[]),
        task("b", &["b.rs"], &["a"]),
        task("c", &["c.rs"], &["b"]),
    ];
    let runner = Arc::new(FakeRepoRunner::new().with_staged_by_dir(&[
        ("shadows/a", "a.rs\n"),
        ("shadows/b", "b.rs\n"),
        ("shadows/c", "c.rs\n"),
    ]));
    let agent = Arc::new(ScriptedAgent::all_success());
    let (scheduler, ctx) = scheduler(dir.path(), runner, agent, &tasks, VcsMode::GitSpice);

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();

    assert_eq!(result.tasks.len(), 3);
    assert!(result.tasks.iter().all(|t| t.status == TaskStatus::Success));
    assert_eq!(
        result.branches,
        vec![
            "task/a".to_string(),
            "task/b".to_string(),
            "task/c".to_string()
        ]
    );
    assert_eq!(result.commits.len(), 3);
}

// ===========================================================================
// S2 — diamond, stacked, middle layer concurrent
// ===========================================================================

#[tokio::test]
async fn diamond_runs_middle_layer_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![
        task("a", &["a.rs"], &[]),
        task("b", &["b.rs"], &["a"]),
        task("c", &["c.rs"], &["a"]),
        task("d", &["d.rs"], &["b", "c"]),
    ];
    let runner = Arc::new(FakeRepoRunner::new().with_staged_by_dir(&[
        ("shadows/a", "a.rs\n"),
        ("shadows/b", "b.rs\n"),
        ("shadows/c", "c.rs\n"),
        ("shadows/d", "d.rs\n"),
    ]));
    let agent = Arc::new(ScriptedAgent::all_success());
    let (scheduler, ctx) =
        scheduler(dir.path(), runner.clone(), agent.clone(), &tasks, VcsMode::GitSpice);

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();

    assert_eq!(result.tasks.len(), 4);
    assert!(result.tasks.iter().all(|t| t.status == TaskStatus::Success));

    // b and c overlapped inside their layer.
    assert!(agent.peak_concurrency() >= 2, "middle layer should be concurrent");

    // Topological branch order: a first, d last.
    assert_eq!(result.branches.len(), 4);
    assert_eq!(result.branches.first().map(String::as_str), Some("task/a"));
    assert_eq!(result.branches.last().map(String::as_str), Some("task/d"));

    // Each branch's recorded parent is an ancestor of everything the task
    // requires. The backend checks out the parent immediately before the
    // stack-aware branch creation, so the nearest preceding checkout is the
    // chosen parent (creations are serialized by the builder, so the
    // checkout/create pairs never interleave).
    let commands = runner.commands();
    let parent_of = |branch: &str| -> String {
        let pos = commands
            .iter()
            .position(|c| c == &format!("gs branch create {branch}"))
            .unwrap_or_else(|| panic!("no branch creation for {branch}"));
        commands[..pos]
            .iter()
            .rev()
            .find_map(|c| c.strip_prefix("git checkout "))
            .unwrap_or_else(|| panic!("no checkout before creation of {branch}"))
            .to_string()
    };

    assert_eq!(parent_of("task/a"), "main");
    assert_eq!(parent_of("task/b"), "task/a");
    // c requires only a: it must not fork from its sibling b even when b
    // was stacked first.
    assert_eq!(parent_of("task/c"), "task/a");
    // d requires both siblings; its parent is whichever was stacked later.
    let d_parent = parent_of("task/d");
    assert!(
        d_parent == "task/b" || d_parent == "task/c",
        "d's parent should be a sibling branch, got {d_parent}"
    );
}

// ===========================================================================
// S3 — cycle is rejected before execution
// ===========================================================================

#[tokio::test]
async fn cycle_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![task("a", &[], &["b"]), task("b", &[], &["a"])];
    let plan = Plan::new("cyclic", tasks.clone());

    let runner = Arc::new(FakeRepoRunner::new());
    let agent = Arc::new(ScriptedAgent::all_success());
    let (scheduler, ctx) =
        scheduler(dir.path(), runner, agent.clone(), &tasks, VcsMode::GitSpice);

    let err = scheduler.execute_plan(&plan, &ctx).await.unwrap_err();
    match err {
        EngineError::PlanInvalid(msg) => assert!(msg.contains("cycle")),
        other => panic!("expected PlanInvalid, got {other:?}"),
    }
    assert_eq!(agent.invocation_count("a"), 0);
}

// ===========================================================================
// S4 — upstream failure halts the run
// ===========================================================================

#[tokio::test]
async fn upstream_failure_halts_and_skips_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![
        task("a", &["a.rs"], &[]),
        task("b", &["b.rs"], &["a"]),
        task("c", &["c.rs"], &["b"]),
    ];
    let runner = Arc::new(FakeRepoRunner::new());
    let agent = Arc::new(
        ScriptedAgent::all_success().script("a", vec![AgentOutcome::failed("model refused")]),
    );
    let (scheduler, mut ctx) =
        scheduler(dir.path(), runner, agent, &tasks, VcsMode::GitSpice);
    ctx.continue_on_error = false;
    ctx.max_retries = 0;

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();

    assert_eq!(report_for(&result, "a").status, TaskStatus::Failure);
    let b = report_for(&result, "b");
    assert_eq!(b.status, TaskStatus::Skipped);
    assert!(b.error.as_deref().unwrap().contains("prior failure"));
    assert_eq!(report_for(&result, "c").status, TaskStatus::Skipped);

    assert!(result.branches.is_empty());
    assert!(result.commits.is_empty());
}

// ===========================================================================
// S5 — continue-on-error runs the independent task
// ===========================================================================

#[tokio::test]
async fn continue_on_error_still_runs_independent_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![
        task("a", &["a.rs"], &[]),
        task("b", &["b.rs"], &["a"]),
        task("c", &["c.rs"], &["b"]),
        task("x", &["x.rs"], &[]),
    ];
    let runner = Arc::new(
        FakeRepoRunner::new().with_staged_by_dir(&[("shadows/x", "x.rs\n")]),
    );
    let agent = Arc::new(
        ScriptedAgent::all_success().script("a", vec![AgentOutcome::failed("model refused")]),
    );
    let (scheduler, mut ctx) =
        scheduler(dir.path(), runner, agent, &tasks, VcsMode::GitSpice);
    ctx.continue_on_error = true;
    ctx.max_retries = 0;

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();

    assert_eq!(report_for(&result, "a").status, TaskStatus::Failure);
    assert_eq!(report_for(&result, "b").status, TaskStatus::Skipped);
    assert_eq!(report_for(&result, "c").status, TaskStatus::Skipped);
    assert_eq!(report_for(&result, "x").status, TaskStatus::Success);

    assert_eq!(result.branches, vec!["task/x".to_string()]);
    assert_eq!(result.commits.len(), 1);
}

// ===========================================================================
// S6 — parallel file conflict is rejected
// ===========================================================================

#[tokio::test]
async fn parallel_file_conflict_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![
        task("a", &["shared.ts"], &[]),
        task("b", &["shared.ts"], &[]),
    ];
    let plan = Plan::new("conflicting", tasks.clone());

    let runner = Arc::new(FakeRepoRunner::new());
    let agent = Arc::new(ScriptedAgent::all_success());
    let (scheduler, ctx) = scheduler(dir.path(), runner, agent, &tasks, VcsMode::GitSpice);

    let err = scheduler.execute_plan(&plan, &ctx).await.unwrap_err();
    match err {
        EngineError::PlanInvalid(msg) => assert!(msg.contains("shared.ts")),
        other => panic!("expected PlanInvalid, got {other:?}"),
    }
}

// ===========================================================================
// S7 — runtime scope violation fails only the offender
// ===========================================================================

#[tokio::test]
async fn scope_violation_fails_offending_task_only() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![task("a", &["a.ts"], &[]), task("b", &["b.ts"], &[])];
    // b's agent also touched a.ts.
    let runner = Arc::new(FakeRepoRunner::new().with_staged_by_dir(&[
        ("shadows/a", "a.ts\n"),
        ("shadows/b", "b.ts\na.ts\n"),
    ]));
    let agent = Arc::new(ScriptedAgent::all_success());
    let (scheduler, ctx) = scheduler(dir.path(), runner, agent, &tasks, VcsMode::Worktree);

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();

    assert_eq!(report_for(&result, "a").status, TaskStatus::Success);
    let b = report_for(&result, "b");
    assert_eq!(b.status, TaskStatus::Failure);
    let error = b.error.as_deref().unwrap();
    assert!(error.contains("a.ts"));
    assert!(error.contains("'a'"), "violation should name the owning task: {error}");
}

// ===========================================================================
// S8 — transitive refinement of a shared file is allowed
// ===========================================================================

#[tokio::test]
async fn refinement_of_ancestor_file_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![
        task("a", &["layout.ts"], &[]),
        task("b", &["layout.ts"], &["a"]),
    ];
    let runner = Arc::new(FakeRepoRunner::new().with_staged_by_dir(&[
        ("shadows/a", "layout.ts\n"),
        ("shadows/b", "layout.ts\n"),
    ]));
    let agent = Arc::new(ScriptedAgent::all_success());
    let (scheduler, ctx) = scheduler(dir.path(), runner, agent, &tasks, VcsMode::GitSpice);

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();
    assert!(result.tasks.iter().all(|t| t.status == TaskStatus::Success));
    assert_eq!(result.branches.len(), 2);
}

// ===========================================================================
// S9 — retry recovers a flaky agent
// ===========================================================================

#[tokio::test]
async fn retry_recovers_after_transient_agent_failure() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![task("t", &["t.rs"], &[])];
    let runner = Arc::new(
        FakeRepoRunner::new().with_staged_by_dir(&[("shadows/t", "t.rs\n")]),
    );
    let agent = Arc::new(
        ScriptedAgent::all_success().script("t", vec![AgentOutcome::failed("first call flaked")]),
    );
    let (scheduler, mut ctx) =
        scheduler(dir.path(), runner, agent.clone(), &tasks, VcsMode::GitSpice);
    ctx.max_retries = 1;

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();

    assert_eq!(report_for(&result, "t").status, TaskStatus::Success);
    assert_eq!(agent.invocation_count("t"), 2);
    assert_eq!(result.commits.len(), 1);
}

// ===========================================================================
// Boundary behaviors
// ===========================================================================

#[tokio::test]
async fn empty_plan_returns_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let tasks: Vec<Task> = Vec::new();
    let runner = Arc::new(FakeRepoRunner::new());
    let agent = Arc::new(ScriptedAgent::all_success());
    let (scheduler, ctx) = scheduler(dir.path(), runner, agent, &tasks, VcsMode::GitSpice);

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();
    assert!(result.tasks.is_empty());
    assert!(result.branches.is_empty());
    assert!(result.commits.is_empty());
}

#[tokio::test]
async fn direct_strategy_executes_serially() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![task("t1", &["a.rs"], &[]), task("t2", &["b.rs"], &[])];
    // Direct mode commits in one shared checkout; staged sets arrive in
    // dispatch order.
    let runner = Arc::new(FakeRepoRunner::new().with_staged_queue(&["a.rs\n", "b.rs\n"]));
    let agent = Arc::new(ScriptedAgent::all_success());
    let (scheduler, ctx) =
        scheduler(dir.path(), runner, agent.clone(), &tasks, VcsMode::MergeCommit);

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();

    assert!(result.tasks.iter().all(|t| t.status == TaskStatus::Success));
    assert_eq!(
        agent.peak_concurrency(),
        1,
        "direct strategy must never overlap workers"
    );
    assert!(result.branches.is_empty());
    assert_eq!(result.commits.len(), 2);
}

#[tokio::test]
async fn every_input_task_appears_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![
        task("a", &["a.rs"], &[]),
        task("b", &["b.rs"], &["a"]),
        task("x", &["x.rs"], &[]),
    ];
    let runner = Arc::new(FakeRepoRunner::new());
    let agent = Arc::new(
        ScriptedAgent::all_success().script("a", vec![AgentOutcome::failed("nope")]),
    );
    let (scheduler, mut ctx) = scheduler(dir.path(), runner, agent, &tasks, VcsMode::GitSpice);
    ctx.continue_on_error = true;

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();

    let mut ids: Vec<&str> = result.tasks.iter().map(|t| t.task_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "x"]);
}

#[tokio::test]
async fn cancellation_skips_pending_work() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![task("a", &["a.rs"], &[]), task("b", &["b.rs"], &["a"])];
    let runner = Arc::new(
        FakeRepoRunner::new().with_staged_by_dir(&[("shadows/a", "a.rs\n")]),
    );
    let agent = Arc::new(ScriptedAgent::all_success());

    let mut config = EngineConfig::default();
    config.stack.backoff_base_ms = 1;
    let scope = Arc::new(ScopeValidator::new(&tasks, ValidationMode::Strict, false));
    let events = EventBus::new();
    let strategy = strategy_for_mode(
        VcsMode::GitSpice,
        runner,
        scope.clone(),
        &config,
        events.clone(),
        dir.path(),
    );
    let cancel = CancelSignal::new();
    let scheduler = Scheduler::new(agent, strategy, scope, events, cancel.clone());
    let mut ctx = ExecutionContext::new(dir.path(), VcsMode::GitSpice);
    ctx.parent_ref = Some("main".into());

    // Cancel before the run starts its second layer: a completes, b is
    // refused.
    cancel.cancel();
    let result = scheduler.execute(&tasks, &ctx).await.unwrap();

    assert!(result
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Skipped));
    let a = report_for(&result, "a");
    assert!(a.error.as_deref().unwrap().contains("cancelled"));
}

#[tokio::test]
async fn sequential_plan_strategy_forces_single_task_layers() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![task("t1", &["a.rs"], &[]), task("t2", &["b.rs"], &[])];
    let mut plan = Plan::new("sequential-plan", tasks.clone());
    plan.strategy = sr_core::types::PlanStrategy::Sequential;

    let runner = Arc::new(FakeRepoRunner::new().with_staged_by_dir(&[
        ("shadows/t1", "a.rs\n"),
        ("shadows/t2", "b.rs\n"),
    ]));
    let agent = Arc::new(ScriptedAgent::all_success());
    let (scheduler, ctx) =
        scheduler(dir.path(), runner, agent.clone(), &tasks, VcsMode::GitSpice);

    let result = scheduler.execute_plan(&plan, &ctx).await.unwrap();
    assert!(result.tasks.iter().all(|t| t.status == TaskStatus::Success));
    assert_eq!(agent.peak_concurrency(), 1);
}

#[tokio::test]
async fn worktree_mode_reports_branches_without_stack() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = vec![task("t1", &["a.rs"], &[]), task("t2", &["b.rs"], &[])];
    let runner = Arc::new(FakeRepoRunner::new().with_staged_by_dir(&[
        ("shadows/t1", "a.rs\n"),
        ("shadows/t2", "b.rs\n"),
    ]));
    let agent = Arc::new(ScriptedAgent::all_success());
    let (scheduler, ctx) =
        scheduler(dir.path(), runner.clone(), agent, &tasks, VcsMode::Worktree);

    let result = scheduler.execute(&tasks, &ctx).await.unwrap();

    assert!(result.tasks.iter().all(|t| t.status == TaskStatus::Success));
    let mut branches = result.branches.clone();
    branches.sort();
    assert_eq!(branches, vec!["task/t1".to_string(), "task/t2".to_string()]);

    // The worktrees were created eagerly, one per task, before any agent ran.
    let adds = runner
        .commands()
        .iter()
        .filter(|c| c.starts_with("git worktree add"))
        .count();
    assert_eq!(adds, 2);
}
