//! Stacked strategy: each task's result becomes a branch whose parent is the
//! stack tip of its dependencies, so the run produces one reviewable stack.
//!
//! Execution is worktree-isolated (one working copy per task, created on
//! demand from the task's fork point); completions are handed to the
//! incremental stack builder, which owns branch creation, retries, and
//! conflict fallback. Finalize restacks and reports the ordered branches.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use sr_core::config::EngineConfig;
use sr_core::events::{EngineEvent, EventBus};
use sr_core::graph::TaskGraph;
use sr_core::scope::ScopeValidator;
use sr_core::types::{CommitResult, ExecutionContext, Task, WorktreeContext};
use sr_vcs::backend::{VcsBackend, VcsError};
use sr_vcs::git::GitBackend;
use sr_vcs::stack::StackBuilder;
use sr_vcs::worktree::WorktreeManager;

use crate::commitmsg::commit_message;
use crate::strategy::{Result, StrategyOutput, VcsStrategy};

pub struct StackedStrategy {
    backend: Arc<dyn VcsBackend>,
    git: Arc<GitBackend>,
    manager: Arc<WorktreeManager>,
    scope: Arc<ScopeValidator>,
    config: EngineConfig,
    events: EventBus,
    /// Builder mutations and main-index operations are serialized here.
    builder: Mutex<StackBuilder>,
    state: Mutex<StackedState>,
}

#[derive(Default)]
struct StackedState {
    graph: Option<TaskGraph>,
    contexts: HashMap<String, WorktreeContext>,
    commits: Vec<String>,
}

impl StackedStrategy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn VcsBackend>,
        git: Arc<GitBackend>,
        manager: Arc<WorktreeManager>,
        scope: Arc<ScopeValidator>,
        config: EngineConfig,
        events: EventBus,
        repo_root: impl Into<PathBuf>,
    ) -> Self {
        let repo_root: PathBuf = repo_root.into();
        let builder = StackBuilder::new(
            backend.clone(),
            git.clone(),
            repo_root,
            config.vcs.branch_prefix.clone(),
            config.stack.clone(),
            events.clone(),
        );
        Self {
            backend,
            git,
            manager,
            scope,
            config,
            events,
            builder: Mutex::new(builder),
            state: Mutex::new(StackedState::default()),
        }
    }

    async fn commit_in(
        &self,
        task: &Task,
        wctx: &WorktreeContext,
    ) -> std::result::Result<String, String> {
        let cwd = wctx.path.as_path();

        self.git.add(cwd, &[]).await.map_err(|e| e.to_string())?;
        let staged = self
            .git
            .staged_files(cwd)
            .await
            .map_err(|e| e.to_string())?;

        let report = self.scope.check(&task.id, &staged);
        if !report.valid {
            if let Err(e) = self.git.reset_index(cwd).await {
                warn!(task_id = %task.id, error = %e, "index reset after violation failed");
            }
            let reasons: Vec<String> =
                report.violations.iter().map(|v| v.describe()).collect();
            return Err(reasons.join("; "));
        }

        let message = commit_message(task, &staged);
        self.git.commit(cwd, &message).await.map_err(|e| e.to_string())
    }

    async fn ancestor_ids(&self, task: &Task) -> HashSet<String> {
        let state = self.state.lock().await;
        let Some(graph) = &state.graph else {
            return HashSet::new();
        };
        let Some(idx) = graph.index_of(&task.id) else {
            return HashSet::new();
        };
        graph
            .ancestors(idx)
            .into_iter()
            .map(|i| graph.task(i).id.clone())
            .collect()
    }
}

#[async_trait]
impl VcsStrategy for StackedStrategy {
    fn name(&self) -> &'static str {
        "stacked"
    }

    fn supports_parallel(&self) -> bool {
        true
    }

    fn supports_stacking(&self) -> bool {
        true
    }

    /// Verify a stack order exists (topological, simpler tasks lower) and
    /// reset the builder onto the base reference.
    async fn initialize(&self, tasks: &[Task], ctx: &ExecutionContext) -> Result<()> {
        let graph = TaskGraph::build(tasks);
        if graph.topological_order().is_none() {
            return Err(VcsError::StackBuildFailed("dependency cycle in plan".into()).into());
        }

        let mut state = self.state.lock().await;
        state.graph = Some(graph);
        state.contexts.clear();
        state.commits.clear();

        self.builder.lock().await.initialize(ctx.base_ref());
        Ok(())
    }

    /// Worktrees are created on demand per task, so this is a no-op.
    async fn prepare_contexts(&self, _tasks: &[Task], _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Fork the task's worktree from the stack branch of its most recently
    /// stacked ancestor (the base reference when no ancestor is stacked).
    async fn prepare_task(&self, task: &Task, _ctx: &ExecutionContext) -> Result<WorktreeContext> {
        if let Some(existing) = self.state.lock().await.contexts.get(&task.id) {
            return Ok(existing.clone());
        }

        let ancestors = self.ancestor_ids(task).await;
        let fork_point = {
            let builder = self.builder.lock().await;
            builder.latest_branch_of(&ancestors).to_string()
        };

        info!(task_id = %task.id, fork_point = %fork_point, "preparing stacked worktree");
        let wctx = self.manager.create_for_task(&task.id, &fork_point).await?;
        self.state
            .lock()
            .await
            .contexts
            .insert(task.id.clone(), wctx.clone());
        Ok(wctx)
    }

    async fn handle_completion(
        &self,
        task: &Task,
        wctx: &WorktreeContext,
        _ctx: &ExecutionContext,
    ) -> CommitResult {
        let hash = match self.commit_in(task, wctx).await {
            Ok(hash) => hash,
            Err(error) => return CommitResult::failure(&task.id, error),
        };

        // Hand the completion to the builder; it serializes main-index work
        // and grows the stack as dependencies settle.
        let branch = {
            let mut builder = self.builder.lock().await;
            if let Err(e) = builder.add_task(task, Some(&hash), Some(wctx)).await {
                warn!(task_id = %task.id, error = %e, "stacking failed, commit is preserved");
            }
            builder.branch_for(&task.id).map(str::to_string)
        };

        self.state.lock().await.commits.push(hash.clone());
        self.events
            .publish(EngineEvent::task_completed(&task.id, Some(hash.clone())));
        CommitResult::success(&task.id, hash, branch)
    }

    async fn reset_for_retry(&self, task: &Task, wctx: &WorktreeContext) -> Result<()> {
        if self.config.run.reset_worktree_on_retry {
            info!(task_id = %task.id, base = %wctx.base_ref, "resetting worktree for retry");
            self.git.reset_hard(&wctx.path, &wctx.base_ref).await?;
        }
        Ok(())
    }

    /// Restack to repair any out-of-order parent relationships, then report
    /// the branches in stack order.
    async fn finalize(&self, ctx: &ExecutionContext) -> Result<StrategyOutput> {
        let builder = self.builder.lock().await;

        if !builder.branches().is_empty() {
            if let Err(e) = self.backend.restack(&ctx.cwd).await {
                warn!(error = %e, "restack failed, branches left as created");
            }
        }

        let branches = builder.branches().to_vec();
        for failed in builder.failed_tasks() {
            warn!(
                task_id = %failed.task_id,
                reason = %failed.reason,
                "task missing from stack"
            );
        }

        self.events.publish(EngineEvent::StackBuilt {
            branches: branches.clone(),
            timestamp: chrono::Utc::now(),
        });

        let commits = self.state.lock().await.commits.clone();
        Ok(StrategyOutput { branches, commits })
    }

    async fn cleanup(&self, _ctx: &ExecutionContext, failed_tasks: &HashSet<String>) -> Result<()> {
        let contexts: Vec<WorktreeContext> = self
            .state
            .lock()
            .await
            .contexts
            .values()
            .cloned()
            .collect();

        let preserve = if self.config.vcs.cleanup_on_failure {
            HashSet::new()
        } else {
            failed_tasks.clone()
        };

        self.manager.cleanup(&contexts, &preserve).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
