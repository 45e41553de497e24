//! Direct strategy: every task commits straight onto the current branch of
//! the main checkout. No worktrees, no branch graph; execution is serial
//! because parallel tasks would contend on one index.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use sr_core::events::{EngineEvent, EventBus};
use sr_core::scope::ScopeValidator;
use sr_core::types::{CommitResult, ExecutionContext, Task, WorktreeContext};
use sr_vcs::backend::VcsBackend;
use sr_vcs::git::GitBackend;

use crate::commitmsg::commit_message;
use crate::strategy::{Result, StrategyOutput, VcsStrategy};

pub struct DirectStrategy {
    git: Arc<GitBackend>,
    scope: Arc<ScopeValidator>,
    events: EventBus,
    commits: Mutex<Vec<String>>,
}

impl DirectStrategy {
    pub fn new(git: Arc<GitBackend>, scope: Arc<ScopeValidator>, events: EventBus) -> Self {
        Self {
            git,
            scope,
            events,
            commits: Mutex::new(Vec::new()),
        }
    }

    async fn commit_in(
        &self,
        task: &Task,
        wctx: &WorktreeContext,
    ) -> std::result::Result<(String, Vec<String>), String> {
        let cwd = wctx.path.as_path();

        self.git.add(cwd, &[]).await.map_err(|e| e.to_string())?;
        let staged = self
            .git
            .staged_files(cwd)
            .await
            .map_err(|e| e.to_string())?;

        let report = self.scope.check(&task.id, &staged);
        if !report.valid {
            // Leave the checkout unstaged so the caller sees a clean index.
            if let Err(e) = self.git.reset_index(cwd).await {
                warn!(task_id = %task.id, error = %e, "index reset after violation failed");
            }
            let reasons: Vec<String> =
                report.violations.iter().map(|v| v.describe()).collect();
            return Err(reasons.join("; "));
        }

        let message = commit_message(task, &staged);
        let hash = self
            .git
            .commit(cwd, &message)
            .await
            .map_err(|e| e.to_string())?;
        Ok((hash, staged))
    }
}

#[async_trait]
impl VcsStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn supports_parallel(&self) -> bool {
        false
    }

    fn supports_stacking(&self) -> bool {
        false
    }

    async fn initialize(&self, _tasks: &[Task], _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn prepare_contexts(&self, _tasks: &[Task], _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn prepare_task(&self, task: &Task, ctx: &ExecutionContext) -> Result<WorktreeContext> {
        let mut wctx = WorktreeContext::direct(&ctx.cwd, ctx.base_ref());
        wctx.task_id = task.id.clone();
        Ok(wctx)
    }

    async fn handle_completion(
        &self,
        task: &Task,
        wctx: &WorktreeContext,
        _ctx: &ExecutionContext,
    ) -> CommitResult {
        match self.commit_in(task, wctx).await {
            Ok((hash, staged)) => {
                info!(task_id = %task.id, commit = %hash, files = staged.len(), "task committed");
                self.commits.lock().expect("commits lock").push(hash.clone());
                self.events
                    .publish(EngineEvent::task_completed(&task.id, Some(hash.clone())));
                CommitResult::success(&task.id, hash, None)
            }
            Err(error) => CommitResult::failure(&task.id, error),
        }
    }

    async fn finalize(&self, _ctx: &ExecutionContext) -> Result<StrategyOutput> {
        Ok(StrategyOutput {
            branches: Vec::new(),
            commits: self.commits.lock().expect("commits lock").clone(),
        })
    }

    async fn cleanup(&self, _ctx: &ExecutionContext, _failed: &HashSet<String>) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
