//! Worktree strategy: one isolated working copy per task, all forked from
//! the same base reference, so independent tasks can edit in parallel. No
//! stack is built; finalize renames each successful temporary branch to its
//! final name and reports the set.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use sr_core::config::EngineConfig;
use sr_core::events::{EngineEvent, EventBus};
use sr_core::scope::ScopeValidator;
use sr_core::types::{CommitResult, ExecutionContext, Task, WorktreeContext};
use sr_vcs::backend::{VcsBackend, VcsError};
use sr_vcs::git::GitBackend;
use sr_vcs::worktree::WorktreeManager;

use crate::commitmsg::commit_message;
use crate::strategy::{Result, StrategyOutput, VcsStrategy};

pub struct WorktreeStrategy {
    git: Arc<GitBackend>,
    manager: Arc<WorktreeManager>,
    scope: Arc<ScopeValidator>,
    config: EngineConfig,
    events: EventBus,
    contexts: Mutex<HashMap<String, WorktreeContext>>,
    /// (task id, commit hash) in completion order.
    completed: Mutex<Vec<(String, String)>>,
}

impl WorktreeStrategy {
    pub fn new(
        git: Arc<GitBackend>,
        manager: Arc<WorktreeManager>,
        scope: Arc<ScopeValidator>,
        config: EngineConfig,
        events: EventBus,
    ) -> Self {
        Self {
            git,
            manager,
            scope,
            config,
            events,
            contexts: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
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
}

#[async_trait]
impl VcsStrategy for WorktreeStrategy {
    fn name(&self) -> &'static str {
        "worktree"
    }

    fn supports_parallel(&self) -> bool {
        true
    }

    fn supports_stacking(&self) -> bool {
        false
    }

    async fn initialize(&self, _tasks: &[Task], _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Eagerly create one worktree per task, all forked from the base
    /// reference, so every task starts from the same commit.
    async fn prepare_contexts(&self, tasks: &[Task], ctx: &ExecutionContext) -> Result<()> {
        for task in tasks {
            let wctx = self.manager.create_for_task(&task.id, ctx.base_ref()).await?;
            self.contexts
                .lock()
                .expect("contexts lock")
                .insert(task.id.clone(), wctx);
        }
        Ok(())
    }

    async fn prepare_task(&self, task: &Task, _ctx: &ExecutionContext) -> Result<WorktreeContext> {
        self.contexts
            .lock()
            .expect("contexts lock")
            .get(&task.id)
            .cloned()
            .ok_or_else(|| {
                VcsError::WorktreeCreate(format!("no worktree prepared for task '{}'", task.id))
                    .into()
            })
    }

    async fn handle_completion(
        &self,
        task: &Task,
        wctx: &WorktreeContext,
        _ctx: &ExecutionContext,
    ) -> CommitResult {
        match self.commit_in(task, wctx).await {
            Ok(hash) => {
                info!(task_id = %task.id, commit = %hash, branch = %wctx.branch, "task committed in worktree");
                self.completed
                    .lock()
                    .expect("completed lock")
                    .push((task.id.clone(), hash.clone()));
                self.events
                    .publish(EngineEvent::task_completed(&task.id, Some(hash.clone())));
                CommitResult::success(&task.id, hash, Some(wctx.branch.clone()))
            }
            Err(error) => CommitResult::failure(&task.id, error),
        }
    }

    async fn reset_for_retry(&self, task: &Task, wctx: &WorktreeContext) -> Result<()> {
        if self.config.run.reset_worktree_on_retry {
            info!(task_id = %task.id, base = %wctx.base_ref, "resetting worktree for retry");
            self.git.reset_hard(&wctx.path, &wctx.base_ref).await?;
        }
        Ok(())
    }

    /// Rename each completed task's temporary branch to its final name and
    /// report branches + commits. No stack relationships are recorded.
    async fn finalize(&self, ctx: &ExecutionContext) -> Result<StrategyOutput> {
        let completed = self.completed.lock().expect("completed lock").clone();
        let mut branches = Vec::new();
        let mut commits = Vec::new();

        for (task_id, commit) in &completed {
            let tmp = self.manager.tmp_branch(task_id);
            let final_branch = self.manager.final_branch(task_id);
            match self.git.rename_branch(&ctx.cwd, &tmp, &final_branch).await {
                Ok(()) => {
                    // The temporary name is gone; stop cleanup from deleting
                    // the finalized branch.
                    if let Some(wctx) = self
                        .contexts
                        .lock()
                        .expect("contexts lock")
                        .get_mut(task_id)
                    {
                        wctx.branch = String::new();
                    }
                    branches.push(final_branch);
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "branch finalize rename failed");
                    branches.push(tmp);
                }
            }
            commits.push(commit.clone());
        }

        Ok(StrategyOutput { branches, commits })
    }

    async fn cleanup(&self, _ctx: &ExecutionContext, failed_tasks: &HashSet<String>) -> Result<()> {
        let contexts: Vec<WorktreeContext> = self
            .contexts
            .lock()
            .expect("contexts lock")
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
