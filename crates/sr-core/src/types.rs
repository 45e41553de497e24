use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Complexity
// ---------------------------------------------------------------------------

/// Informational size label attached to every task.
///
/// The stacked strategy uses the ordering (XS lowest) to break ties when
/// computing the stack order, so simpler tasks land lower in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Complexity {
    Xs,
    S,
    M,
    L,
    Xl,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Complexity::Xs => "XS",
            Complexity::S => "S",
            Complexity::M => "M",
            Complexity::L => "L",
            Complexity::Xl => "XL",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Queued,
    Running,
    Failed,
    Completed,
    Skipped,
    Blocked,
}

impl TaskState {
    /// Terminal states admit no further transitions (except `failed`, which
    /// may re-queue while retries remain).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Skipped
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// The full table:
    /// - pending  -> ready | blocked | skipped
    /// - ready    -> queued | blocked | skipped
    /// - queued   -> running | skipped
    /// - running  -> completed | failed | skipped
    /// - failed   -> queued (retry)
    /// - blocked  -> skipped
    pub fn can_transition_to(&self, target: &TaskState) -> bool {
        matches!(
            (self, target),
            (TaskState::Pending, TaskState::Ready)
                | (TaskState::Pending, TaskState::Blocked)
                | (TaskState::Pending, TaskState::Skipped)
                | (TaskState::Ready, TaskState::Queued)
                | (TaskState::Ready, TaskState::Blocked)
                | (TaskState::Ready, TaskState::Skipped)
                | (TaskState::Queued, TaskState::Running)
                | (TaskState::Queued, TaskState::Skipped)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::Skipped)
                | (TaskState::Failed, TaskState::Queued)
                | (TaskState::Blocked, TaskState::Skipped)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Failed => "failed",
            TaskState::Completed => "completed",
            TaskState::Skipped => "skipped",
            TaskState::Blocked => "blocked",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// StateTransition
// ---------------------------------------------------------------------------

/// One recorded state change of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

impl StateTransition {
    pub fn new(from: TaskState, to: TaskState, reason: Option<String>) -> Self {
        Self {
            from,
            to,
            timestamp: Utc::now(),
            reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The unit of work: a planned code modification with a declared file scope
/// and dependency list. Tasks are immutable inputs to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier, unique within a plan.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Natural-language description used to build the agent prompt.
    pub description: String,
    pub complexity: Complexity,
    /// File paths the task is allowed to touch.
    #[serde(default)]
    pub files: Vec<String>,
    /// Ids of tasks that must complete before this one may run.
    #[serde(default, rename = "dependencies")]
    pub requires: Vec<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>, complexity: Complexity) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            complexity,
            files: Vec::new(),
            requires: Vec::new(),
            phase: None,
            acceptance_criteria: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_requires(mut self, requires: Vec<String>) -> Self {
        self.requires = requires;
        self
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanStrategy {
    Sequential,
    Parallel,
    PhasedParallel,
}

impl Default for PlanStrategy {
    fn default() -> Self {
        PlanStrategy::Parallel
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPhase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub strategy: Option<PlanStrategy>,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
}

/// An immutable collection of tasks plus execution strategy metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub strategy: PlanStrategy,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub success_metrics: Vec<String>,
}

impl Plan {
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            description: None,
            strategy: PlanStrategy::default(),
            phases: Vec::new(),
            tasks,
            success_metrics: Vec::new(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

// ---------------------------------------------------------------------------
// ExecutionTask
// ---------------------------------------------------------------------------

/// The mutable companion to a [`Task`] created by the engine for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub task: Task,
    pub retry_count: u32,
    pub max_retries: u32,
    pub worktree_path: Option<PathBuf>,
    pub commit: Option<String>,
    pub branch: Option<String>,
}

impl ExecutionTask {
    pub fn new(task: Task, max_retries: u32) -> Self {
        Self {
            task,
            retry_count: 0,
            max_retries,
            worktree_path: None,
            commit: None,
            branch: None,
        }
    }

    /// A retry is permitted while the recorded count is strictly below the
    /// configured maximum.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

// ---------------------------------------------------------------------------
// WorktreeContext
// ---------------------------------------------------------------------------

/// The physical realization of a task's workspace: an isolated working copy
/// on its own branch. The direct strategy shares one synthetic context over
/// the main checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeContext {
    pub task_id: String,
    pub branch: String,
    /// The ref the worktree was forked from.
    pub base_ref: String,
    /// Absolute filesystem path of the working copy.
    pub path: PathBuf,
    /// Path relative to the repository root.
    pub repo_path: String,
    pub created_at: DateTime<Utc>,
}

impl WorktreeContext {
    /// Synthetic context over the main checkout, used by the direct strategy.
    pub fn direct(cwd: impl Into<PathBuf>, base_ref: impl Into<String>) -> Self {
        Self {
            task_id: String::new(),
            branch: String::new(),
            base_ref: base_ref.into(),
            path: cwd.into(),
            repo_path: ".".to_string(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// CommitResult
// ---------------------------------------------------------------------------

/// Produced by a task completion. A missing commit means the agent reported
/// success without modifying anything, which the engine treats as a failure
/// signal by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResult {
    pub task_id: String,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub error: Option<String>,
}

impl CommitResult {
    pub fn success(task_id: impl Into<String>, commit: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            task_id: task_id.into(),
            commit: Some(commit.into()),
            branch,
            error: None,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            commit: None,
            branch: None,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
    Skipped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", label)
    }
}

/// Per-task entry in the final execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub status: TaskStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The aggregate outcome of one engine run. Contains exactly one entry per
/// input task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub tasks: Vec<TaskReport>,
    pub total_duration_ms: u64,
    pub branches: Vec<String>,
    pub commits: Vec<String>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failure)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Skipped)
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }
}

// ---------------------------------------------------------------------------
// VcsMode
// ---------------------------------------------------------------------------

/// How task results are turned into version-control state.
///
/// The mode selects both the execution strategy (direct / worktree / stacked)
/// and the backend tool driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VcsMode {
    /// Commit every task directly on the current branch, serially.
    MergeCommit,
    /// One isolated worktree per task; no stack is built.
    Worktree,
    /// Stacked branches via git-spice.
    GitSpice,
    /// Stacked branches via graphite.
    Graphite,
    /// Stacked branches via sapling.
    Sapling,
}

/// The execution strategy family a [`VcsMode`] maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Direct,
    Worktree,
    Stacked,
}

impl VcsMode {
    /// Parse a mode name, accepting the legacy aliases `simple`
    /// (merge-commit) and `stacked` (git-spice).
    pub fn parse(s: &str) -> Option<VcsMode> {
        match s {
            "merge-commit" | "simple" | "direct" => Some(VcsMode::MergeCommit),
            "worktree" => Some(VcsMode::Worktree),
            "git-spice" | "stacked" => Some(VcsMode::GitSpice),
            "graphite" => Some(VcsMode::Graphite),
            "sapling" => Some(VcsMode::Sapling),
            _ => None,
        }
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        match self {
            VcsMode::MergeCommit => StrategyKind::Direct,
            VcsMode::Worktree => StrategyKind::Worktree,
            VcsMode::GitSpice | VcsMode::Graphite | VcsMode::Sapling => StrategyKind::Stacked,
        }
    }
}

impl fmt::Display for VcsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VcsMode::MergeCommit => "merge-commit",
            VcsMode::Worktree => "worktree",
            VcsMode::GitSpice => "git-spice",
            VcsMode::Graphite => "graphite",
            VcsMode::Sapling => "sapling",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// ValidationMode
// ---------------------------------------------------------------------------

/// Behavior of the file-modification validator on violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Violations abort the task's commit.
    Strict,
    /// Violations are reported as warnings; the commit proceeds.
    Permissive,
}

impl Default for ValidationMode {
    fn default() -> Self {
        ValidationMode::Strict
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Per-run settings handed to the scheduler and the VCS strategy.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Repository root the run operates on.
    pub cwd: PathBuf,
    /// Which agent CLI to invoke (e.g. "claude").
    pub agent_type: String,
    pub vcs_mode: VcsMode,
    pub continue_on_error: bool,
    pub max_retries: u32,
    pub validation_mode: ValidationMode,
    /// Base reference all task branches descend from. Defaults to HEAD.
    pub parent_ref: Option<String>,
}

impl ExecutionContext {
    pub fn new(cwd: impl Into<PathBuf>, vcs_mode: VcsMode) -> Self {
        Self {
            cwd: cwd.into(),
            agent_type: "claude".to_string(),
            vcs_mode,
            continue_on_error: false,
            max_retries: 0,
            validation_mode: ValidationMode::default(),
            parent_ref: None,
        }
    }

    pub fn base_ref(&self) -> &str {
        self.parent_ref.as_deref().unwrap_or("HEAD")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_ordering() {
        assert!(Complexity::Xs < Complexity::S);
        assert!(Complexity::S < Complexity::M);
        assert!(Complexity::M < Complexity::L);
        assert!(Complexity::L < Complexity::Xl);
    }

    #[test]
    fn complexity_serde_uppercase() {
        let json = serde_json::to_string(&Complexity::Xs).unwrap();
        assert_eq!(json, "\"XS\"");
        let back: Complexity = serde_json::from_str("\"XL\"").unwrap();
        assert_eq!(back, Complexity::Xl);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(!TaskState::Blocked.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn legal_transitions() {
        assert!(TaskState::Pending.can_transition_to(&TaskState::Ready));
        assert!(TaskState::Ready.can_transition_to(&TaskState::Queued));
        assert!(TaskState::Queued.can_transition_to(&TaskState::Running));
        assert!(TaskState::Running.can_transition_to(&TaskState::Completed));
        assert!(TaskState::Running.can_transition_to(&TaskState::Failed));
        assert!(TaskState::Failed.can_transition_to(&TaskState::Queued));
        assert!(TaskState::Blocked.can_transition_to(&TaskState::Skipped));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!TaskState::Pending.can_transition_to(&TaskState::Running));
        assert!(!TaskState::Completed.can_transition_to(&TaskState::Queued));
        assert!(!TaskState::Skipped.can_transition_to(&TaskState::Ready));
        assert!(!TaskState::Failed.can_transition_to(&TaskState::Running));
    }

    #[test]
    fn execution_task_retry_budget() {
        let task = Task::new("t1", "Task 1", Complexity::S);
        let mut exec = ExecutionTask::new(task, 2);
        assert!(exec.can_retry());
        exec.retry_count = 2;
        assert!(!exec.can_retry());
    }

    #[test]
    fn vcs_mode_aliases() {
        assert_eq!(VcsMode::parse("simple"), Some(VcsMode::MergeCommit));
        assert_eq!(VcsMode::parse("stacked"), Some(VcsMode::GitSpice));
        assert_eq!(VcsMode::parse("worktree"), Some(VcsMode::Worktree));
        assert_eq!(VcsMode::parse("graphite"), Some(VcsMode::Graphite));
        assert_eq!(VcsMode::parse("nope"), None);
    }

    #[test]
    fn vcs_mode_strategy_mapping() {
        assert_eq!(VcsMode::MergeCommit.strategy_kind(), StrategyKind::Direct);
        assert_eq!(VcsMode::Worktree.strategy_kind(), StrategyKind::Worktree);
        assert_eq!(VcsMode::GitSpice.strategy_kind(), StrategyKind::Stacked);
        assert_eq!(VcsMode::Sapling.strategy_kind(), StrategyKind::Stacked);
    }

    #[test]
    fn execution_result_counts() {
        let result = ExecutionResult {
            tasks: vec![
                TaskReport {
                    task_id: "a".into(),
                    status: TaskStatus::Success,
                    duration_ms: 10,
                    output: None,
                    error: None,
                },
                TaskReport {
                    task_id: "b".into(),
                    status: TaskStatus::Failure,
                    duration_ms: 5,
                    output: None,
                    error: Some("boom".into()),
                },
                TaskReport {
                    task_id: "c".into(),
                    status: TaskStatus::Skipped,
                    duration_ms: 0,
                    output: None,
                    error: None,
                },
            ],
            total_duration_ms: 15,
            branches: vec![],
            commits: vec![],
        };
        assert_eq!(result.succeeded(), 1);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.skipped(), 1);
        assert!(result.has_failures());
    }

    #[test]
    fn plan_lookup() {
        let plan = Plan::new(
            "demo",
            vec![
                Task::new("a", "A", Complexity::S),
                Task::new("b", "B", Complexity::M),
            ],
        );
        assert!(plan.task("a").is_some());
        assert!(plan.task("z").is_none());
    }
}
