//! Task worktree lifecycle under the shadow directory.
//!
//! Each isolated task gets a working copy at
//! `<repo>/<shadow_path>/<task-id>/` on a temporary branch
//! `tmp-<prefix>/<task-id>`. Cleanup removes every worktree created during a
//! run (optionally preserving failed ones for post-mortem) and drops the
//! shadow directory once it is empty.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use sr_core::events::{EngineEvent, EventBus};
use sr_core::types::WorktreeContext;

use crate::backend::{Result, VcsBackend, VcsError};
use crate::git::GitBackend;

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

pub struct WorktreeManager {
    repo_root: PathBuf,
    shadow_path: String,
    branch_prefix: String,
    git: Arc<GitBackend>,
    events: EventBus,
}

impl WorktreeManager {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        shadow_path: impl Into<String>,
        branch_prefix: impl Into<String>,
        git: Arc<GitBackend>,
        events: EventBus,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            shadow_path: shadow_path.into(),
            branch_prefix: branch_prefix.into(),
            git,
            events,
        }
    }

    pub fn shadow_dir(&self) -> PathBuf {
        self.repo_root.join(&self.shadow_path)
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.shadow_dir().join(sanitize_name(task_id))
    }

    pub fn tmp_branch(&self, task_id: &str) -> String {
        format!("tmp-{}/{}", self.branch_prefix, sanitize_name(task_id))
    }

    pub fn final_branch(&self, task_id: &str) -> String {
        format!("{}/{}", self.branch_prefix, sanitize_name(task_id))
    }

    /// Create a worktree for `task_id` forked from `base_ref` on the task's
    /// temporary branch.
    pub async fn create_for_task(&self, task_id: &str, base_ref: &str) -> Result<WorktreeContext> {
        let path = self.path_for(task_id);
        let branch = self.tmp_branch(task_id);

        if path.exists() {
            return Err(VcsError::WorktreeCreate(format!(
                "worktree already exists: {}",
                path.display()
            )));
        }
        std::fs::create_dir_all(self.shadow_dir())?;

        info!(
            task_id = %task_id,
            worktree = %path.display(),
            branch = %branch,
            base = %base_ref,
            "creating worktree"
        );

        self.git
            .create_worktree(&self.repo_root, &path, base_ref, Some(&branch))
            .await?;

        self.events.publish(EngineEvent::worktree_created(
            task_id,
            path.display().to_string(),
            branch.clone(),
        ));

        Ok(WorktreeContext {
            task_id: task_id.to_string(),
            branch,
            base_ref: base_ref.to_string(),
            path,
            repo_path: format!("{}/{}", self.shadow_path, sanitize_name(task_id)),
            created_at: Utc::now(),
        })
    }

    pub async fn remove(&self, ctx: &WorktreeContext, force: bool) -> Result<()> {
        self.git
            .remove_worktree(&self.repo_root, &ctx.path, force)
            .await
    }

    /// Remove every worktree created during the run, except the ids in
    /// `preserve`. Branch deletion and worktree removal failures are logged
    /// and do not abort the sweep. The shadow directory is dropped once all
    /// worktrees are gone.
    pub async fn cleanup(
        &self,
        contexts: &[WorktreeContext],
        preserve: &HashSet<String>,
    ) -> CleanupSummary {
        let mut summary = CleanupSummary::default();

        for ctx in contexts {
            if preserve.contains(&ctx.task_id) {
                info!(task_id = %ctx.task_id, path = %ctx.path.display(), "preserving worktree for post-mortem");
                summary.preserved.push(ctx.task_id.clone());
                continue;
            }

            match self.remove(ctx, true).await {
                Ok(()) => summary.removed.push(ctx.task_id.clone()),
                Err(e) => {
                    warn!(task_id = %ctx.task_id, error = %e, "worktree removal failed");
                    summary.failed.push(ctx.task_id.clone());
                }
            }

            if !ctx.branch.is_empty() {
                if let Err(e) = self.git.delete_branch(&self.repo_root, &ctx.branch, true).await {
                    warn!(branch = %ctx.branch, error = %e, "temporary branch deletion failed");
                }
            }
        }

        if summary.preserved.is_empty() && summary.failed.is_empty() {
            let shadow = self.shadow_dir();
            if shadow.exists() {
                if let Err(e) = std::fs::remove_dir_all(&shadow) {
                    warn!(path = %shadow.display(), error = %e, "shadow directory removal failed");
                }
            }
        }

        summary
    }
}

/// Outcome of a cleanup sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupSummary {
    pub removed: Vec<String>,
    pub preserved: Vec<String>,
    pub failed: Vec<String>,
}

/// Sanitize a task id for use as a directory / branch segment.
pub(crate) fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
