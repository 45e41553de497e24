//! The VCS strategy seam: how per-task lifecycle events are translated into
//! backend operations. Three implementations exist (direct, worktree,
//! stacked); the scheduler talks to them only through this trait.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use sr_core::config::EngineConfig;
use sr_core::events::EventBus;
use sr_core::scope::ScopeValidator;
use sr_core::types::{CommitResult, ExecutionContext, Task, VcsMode, WorktreeContext};
use sr_vcs::backend::{backend_for_mode, VcsBackend, VcsError};
use sr_vcs::git::GitBackend;
use sr_vcs::process::CommandRunner;
use sr_vcs::worktree::WorktreeManager;

use crate::direct::DirectStrategy;
use crate::stacked::StackedStrategy;
use crate::worktree_strategy::WorktreeStrategy;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("plan is invalid: {0}")]
    PlanInvalid(String),
    #[error(transparent)]
    Vcs(#[from] VcsError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// VcsStrategy
// ---------------------------------------------------------------------------

/// Branches and commits reported at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct StrategyOutput {
    pub branches: Vec<String>,
    pub commits: Vec<String>,
}

/// A state-bearing strategy driving one run's version-control side effects.
///
/// The scheduler calls `initialize` and `prepare_contexts` once,
/// `prepare_task`/`handle_completion` per task (possibly from concurrent
/// workers, so implementations guard their state), then `finalize` and
/// `cleanup` once.
#[async_trait]
pub trait VcsStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether tasks may run concurrently under this strategy.
    fn supports_parallel(&self) -> bool;

    fn supports_stacking(&self) -> bool;

    async fn initialize(&self, tasks: &[Task], ctx: &ExecutionContext) -> Result<()>;

    /// Eagerly create isolated contexts where the strategy wants them
    /// up-front; a no-op for deferring strategies.
    async fn prepare_contexts(&self, tasks: &[Task], ctx: &ExecutionContext) -> Result<()>;

    /// Produce (or look up) the working copy a task runs in.
    async fn prepare_task(&self, task: &Task, ctx: &ExecutionContext) -> Result<WorktreeContext>;

    /// Stage, validate, and commit a task's modifications. Failures are
    /// reported in the [`CommitResult`], never raised; the worker turns
    /// them into a task failure.
    async fn handle_completion(
        &self,
        task: &Task,
        wctx: &WorktreeContext,
        ctx: &ExecutionContext,
    ) -> CommitResult;

    /// Reset a task's working copy between retry attempts when the policy
    /// asks for it. Default: inherit the prior attempt's state.
    async fn reset_for_retry(&self, _task: &Task, _wctx: &WorktreeContext) -> Result<()> {
        Ok(())
    }

    async fn finalize(&self, ctx: &ExecutionContext) -> Result<StrategyOutput>;

    /// Remove contexts created during the run. `failed_tasks` lets the
    /// cleanup-on-failure policy preserve the interesting ones.
    async fn cleanup(&self, ctx: &ExecutionContext, failed_tasks: &HashSet<String>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the strategy (and its backend plumbing) for a mode.
pub fn strategy_for_mode(
    mode: VcsMode,
    runner: Arc<dyn CommandRunner>,
    scope: Arc<ScopeValidator>,
    config: &EngineConfig,
    events: EventBus,
    repo_root: &std::path::Path,
) -> Arc<dyn VcsStrategy> {
    let timeout = Duration::from_secs(config.vcs.subprocess_timeout_secs);
    let git = Arc::new(GitBackend::new(runner.clone(), timeout));
    let backend: Arc<dyn VcsBackend> = backend_for_mode(mode, runner, timeout);
    let manager = Arc::new(WorktreeManager::new(
        repo_root,
        config.vcs.shadow_path.clone(),
        config.vcs.branch_prefix.clone(),
        git.clone(),
        events.clone(),
    ));

    match mode.strategy_kind() {
        sr_core::types::StrategyKind::Direct => {
            Arc::new(DirectStrategy::new(git, scope, events))
        }
        sr_core::types::StrategyKind::Worktree => Arc::new(WorktreeStrategy::new(
            git,
            manager,
            scope,
            config.clone(),
            events,
        )),
        sr_core::types::StrategyKind::Stacked => Arc::new(StackedStrategy::new(
            backend,
            git,
            manager,
            scope,
            config.clone(),
            events,
            repo_root,
        )),
    }
}
