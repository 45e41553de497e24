//! Graphite backend. Same shape as the git-spice backend: plain-git pieces
//! delegate to [`GitBackend`], stack-aware operations go through `gt`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{Result, StackBranch, SubmitOptions, VcsBackend, VcsError};
use crate::git::GitBackend;
use crate::process::{CmdOutput, CmdRequest, CommandRunner};
use crate::spice::{extract_urls, parse_stack_log};

pub struct GraphiteBackend {
    git: Arc<GitBackend>,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl GraphiteBackend {
    pub fn new(git: Arc<GitBackend>, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            git,
            runner,
            timeout,
        }
    }

    async fn run_gt(&self, cwd: &Path, args: &[&str]) -> Result<CmdOutput> {
        let req = CmdRequest::new("gt", cwd).args(args.iter().copied()).timeout(self.timeout);
        let output = self.runner.run(&req).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(VcsError::Command(format!(
                "gt {}: {}",
                args.first().copied().unwrap_or(""),
                output.error_text()
            )))
        }
    }
}

#[async_trait]
impl VcsBackend for GraphiteBackend {
    fn name(&self) -> &'static str {
        "graphite"
    }

    async fn is_available(&self) -> bool {
        let req = CmdRequest::new("gt", std::env::temp_dir())
            .arg("--version")
            .timeout(self.timeout);
        matches!(self.runner.run(&req).await, Ok(out) if out.success())
    }

    async fn create_worktree(
        &self,
        repo: &Path,
        path: &Path,
        base_ref: &str,
        branch: Option<&str>,
    ) -> Result<()> {
        self.git.create_worktree(repo, path, base_ref, branch).await
    }

    async fn remove_worktree(&self, repo: &Path, path: &Path, force: bool) -> Result<()> {
        self.git.remove_worktree(repo, path, force).await
    }

    async fn status(&self, cwd: &Path) -> Result<Vec<String>> {
        self.git.status(cwd).await
    }

    async fn add(&self, cwd: &Path, paths: &[String]) -> Result<()> {
        self.git.add(cwd, paths).await
    }

    async fn staged_files(&self, cwd: &Path) -> Result<Vec<String>> {
        self.git.staged_files(cwd).await
    }

    async fn commit(&self, cwd: &Path, message: &str) -> Result<String> {
        self.git.commit(cwd, message).await
    }

    async fn branch_exists(&self, cwd: &Path, name: &str) -> Result<bool> {
        self.git.branch_exists(cwd, name).await
    }

    async fn create_branch_from_commit(
        &self,
        cwd: &Path,
        branch: &str,
        commit: &str,
        parent: &str,
    ) -> Result<()> {
        self.git.checkout(cwd, parent).await?;
        self.run_gt(cwd, &["create", branch]).await?;
        self.git.cherry_pick(cwd, commit).await?;
        Ok(())
    }

    async fn cherry_pick(&self, cwd: &Path, commit: &str) -> Result<()> {
        self.git.cherry_pick(cwd, commit).await
    }

    async fn restack(&self, cwd: &Path) -> Result<()> {
        self.run_gt(cwd, &["restack"]).await?;
        Ok(())
    }

    async fn get_stack_info(&self, cwd: &Path) -> Result<Vec<StackBranch>> {
        let output = self.run_gt(cwd, &["log", "short"]).await?;
        Ok(parse_stack_log(&output.stdout))
    }

    async fn submit_stack(&self, cwd: &Path, options: &SubmitOptions) -> Result<Vec<String>> {
        let mut args = vec!["submit", "--stack"];
        if options.draft {
            args.push("--draft");
        }
        let output = self.run_gt(cwd, &args).await?;
        Ok(extract_urls(&output.stdout))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
