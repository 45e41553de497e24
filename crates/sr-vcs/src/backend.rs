//! The VCS backend capability trait and backend selection.
//!
//! Each supported tool (git, git-spice, graphite, sapling) implements the
//! same capability set; absent tools are detected by `is_available()` and
//! surface as [`VcsError::ToolUnavailable`] with install hints.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use sr_core::types::VcsMode;

use crate::git::GitBackend;
use crate::graphite::GraphiteBackend;
use crate::process::{CommandRunner, ProcessError};
use crate::sapling::SaplingBackend;
use crate::spice::GitSpiceBackend;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("tool '{tool}' for mode '{mode}' is not available. {hint}")]
    ToolUnavailable {
        mode: String,
        tool: String,
        hint: String,
    },
    #[error("worktree creation failed: {0}")]
    WorktreeCreate(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("stack build failed: {0}")]
    StackBuildFailed(String),
    #[error("vcs command failed: {0}")]
    Command(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VcsError {
    /// Transient failures the stack builder retries with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            VcsError::Process(ProcessError::Timeout { .. }) => true,
            VcsError::Command(msg) | VcsError::StackBuildFailed(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("resource temporarily unavailable")
                    || msg.contains("index.lock")
                    || msg.contains("could not lock")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, VcsError>;

// ---------------------------------------------------------------------------
// Capability types
// ---------------------------------------------------------------------------

/// One branch in the backend's stack metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackBranch {
    pub branch: String,
    /// Recorded stack parent; `None` for the base of the stack.
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub draft: bool,
    pub fill: bool,
}

// ---------------------------------------------------------------------------
// VcsBackend
// ---------------------------------------------------------------------------

/// Capability set every backend tool exposes.
///
/// `cwd` is the directory the operation runs in: the repository root, or a
/// worktree path for operations scoped to a task's working copy.
#[async_trait]
pub trait VcsBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn is_available(&self) -> bool;

    async fn create_worktree(
        &self,
        repo: &Path,
        path: &Path,
        base_ref: &str,
        branch: Option<&str>,
    ) -> Result<()>;

    async fn remove_worktree(&self, repo: &Path, path: &Path, force: bool) -> Result<()>;

    /// Paths with uncommitted modifications in `cwd`.
    async fn status(&self, cwd: &Path) -> Result<Vec<String>>;

    /// Stage the given paths; all modifications when `paths` is empty.
    async fn add(&self, cwd: &Path, paths: &[String]) -> Result<()>;

    /// Paths currently staged in `cwd`.
    async fn staged_files(&self, cwd: &Path) -> Result<Vec<String>>;

    /// Commit staged changes; returns the new commit hash.
    async fn commit(&self, cwd: &Path, message: &str) -> Result<String>;

    async fn branch_exists(&self, cwd: &Path, name: &str) -> Result<bool>;

    /// Create `branch` carrying `commit` with `parent` recorded as its stack
    /// parent (where the tool tracks one).
    async fn create_branch_from_commit(
        &self,
        cwd: &Path,
        branch: &str,
        commit: &str,
        parent: &str,
    ) -> Result<()>;

    async fn cherry_pick(&self, cwd: &Path, commit: &str) -> Result<()>;

    /// Repair the stack so each branch sits on its parent's current tip.
    async fn restack(&self, cwd: &Path) -> Result<()>;

    async fn get_stack_info(&self, cwd: &Path) -> Result<Vec<StackBranch>>;

    async fn submit_stack(&self, cwd: &Path, options: &SubmitOptions) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// The tool a [`VcsMode`] is driven by.
pub fn tool_for_mode(mode: VcsMode) -> &'static str {
    match mode {
        VcsMode::MergeCommit | VcsMode::Worktree => "git",
        VcsMode::GitSpice => "gs",
        VcsMode::Graphite => "gt",
        VcsMode::Sapling => "sl",
    }
}

pub fn install_hint(mode: VcsMode) -> &'static str {
    match mode {
        VcsMode::MergeCommit | VcsMode::Worktree => {
            "Install git from https://git-scm.com/downloads"
        }
        VcsMode::GitSpice => {
            "Install git-spice with `brew install git-spice` or from https://abhinav.github.io/git-spice/"
        }
        VcsMode::Graphite => {
            "Install the Graphite CLI with `npm install -g @withgraphite/graphite-cli`"
        }
        VcsMode::Sapling => "Install sapling from https://sapling-scm.com/docs/introduction/installation",
    }
}

/// Construct the backend for a mode without checking availability.
pub fn backend_for_mode(
    mode: VcsMode,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
) -> Arc<dyn VcsBackend> {
    let git = Arc::new(GitBackend::new(runner.clone(), timeout));
    match mode {
        VcsMode::MergeCommit | VcsMode::Worktree => git,
        VcsMode::GitSpice => Arc::new(GitSpiceBackend::new(git, runner, timeout)),
        VcsMode::Graphite => Arc::new(GraphiteBackend::new(git, runner, timeout)),
        VcsMode::Sapling => Arc::new(SaplingBackend::new(git, runner, timeout)),
    }
}

/// Select and availability-check a backend.
///
/// When the requested tool is missing: an explicitly chosen mode fails with
/// [`VcsError::ToolUnavailable`]; an implicit choice falls back to
/// merge-commit with a warning.
pub async fn select_backend(
    mode: VcsMode,
    explicit: bool,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
) -> Result<(Arc<dyn VcsBackend>, VcsMode)> {
    let backend = backend_for_mode(mode, runner.clone(), timeout);
    if backend.is_available().await {
        return Ok((backend, mode));
    }

    if explicit {
        return Err(VcsError::ToolUnavailable {
            mode: mode.to_string(),
            tool: tool_for_mode(mode).to_string(),
            hint: install_hint(mode).to_string(),
        });
    }

    warn!(
        mode = %mode,
        tool = tool_for_mode(mode),
        "tool unavailable, falling back to merge-commit"
    );
    let fallback = backend_for_mode(VcsMode::MergeCommit, runner, timeout);
    Ok((fallback, VcsMode::MergeCommit))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
