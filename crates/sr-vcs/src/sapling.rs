//! Sapling backend.
//!
//! Targets sapling's git-interop deployments: history operations go through
//! `sl` (bookmarks stand in for branches, `graft` for cherry-pick), while
//! worktree mechanics delegate to the git backend, which sapling-on-git
//! repositories support.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{Result, StackBranch, SubmitOptions, VcsBackend, VcsError};
use crate::git::GitBackend;
use crate::process::{CmdOutput, CmdRequest, CommandRunner};
use crate::spice::extract_urls;

pub struct SaplingBackend {
    git: Arc<GitBackend>,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl SaplingBackend {
    pub fn new(git: Arc<GitBackend>, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            git,
            runner,
            timeout,
        }
    }

    async fn run_sl(&self, cwd: &Path, args: &[&str]) -> Result<CmdOutput> {
        let req = CmdRequest::new("sl", cwd).args(args.iter().copied()).timeout(self.timeout);
        let output = self.runner.run(&req).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(VcsError::Command(format!(
                "sl {}: {}",
                args.first().copied().unwrap_or(""),
                output.error_text()
            )))
        }
    }
}

#[async_trait]
impl VcsBackend for SaplingBackend {
    fn name(&self) -> &'static str {
        "sapling"
    }

    async fn is_available(&self) -> bool {
        let req = CmdRequest::new("sl", std::env::temp_dir())
            .arg("version")
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
        let output = self.run_sl(cwd, &["status"]).await?;
        Ok(output
            .stdout
            .lines()
            .filter(|l| l.len() > 2)
            .map(|l| l[2..].trim().to_string())
            .collect())
    }

    async fn add(&self, cwd: &Path, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            self.run_sl(cwd, &["addremove"]).await?;
        } else {
            let mut args: Vec<&str> = vec!["add"];
            args.extend(paths.iter().map(String::as_str));
            self.run_sl(cwd, &args).await?;
        }
        Ok(())
    }

    /// Sapling has no staging area; the pending change set is the status.
    async fn staged_files(&self, cwd: &Path) -> Result<Vec<String>> {
        self.status(cwd).await
    }

    async fn commit(&self, cwd: &Path, message: &str) -> Result<String> {
        let output = self.run_sl(cwd, &["commit", "-m", message]).await;
        if let Err(e) = output {
            return Err(VcsError::CommitFailed(e.to_string()));
        }
        let node = self.run_sl(cwd, &["log", "-r", ".", "-T", "{node}"]).await?;
        Ok(node.stdout.trim().to_string())
    }

    async fn branch_exists(&self, cwd: &Path, name: &str) -> Result<bool> {
        let output = self.run_sl(cwd, &["bookmark", "--list"]).await?;
        Ok(output
            .stdout
            .lines()
            .any(|l| l.split_whitespace().any(|tok| tok == name)))
    }

    async fn create_branch_from_commit(
        &self,
        cwd: &Path,
        branch: &str,
        commit: &str,
        parent: &str,
    ) -> Result<()> {
        self.run_sl(cwd, &["goto", parent]).await?;
        self.run_sl(cwd, &["graft", commit]).await?;
        self.run_sl(cwd, &["bookmark", branch]).await?;
        Ok(())
    }

    async fn cherry_pick(&self, cwd: &Path, commit: &str) -> Result<()> {
        self.run_sl(cwd, &["graft", commit]).await?;
        Ok(())
    }

    async fn restack(&self, cwd: &Path) -> Result<()> {
        self.run_sl(cwd, &["rebase", "--restack"]).await?;
        Ok(())
    }

    async fn get_stack_info(&self, cwd: &Path) -> Result<Vec<StackBranch>> {
        // Bottom-up stack of the current commit's ancestry, bookmarks only.
        let output = self
            .run_sl(cwd, &["log", "-r", "stack()", "-T", "{bookmarks}\n"])
            .await?;
        let names: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok(names
            .iter()
            .enumerate()
            .map(|(i, name)| StackBranch {
                branch: name.clone(),
                parent: if i == 0 { None } else { names.get(i - 1).cloned() },
            })
            .collect())
    }

    async fn submit_stack(&self, cwd: &Path, options: &SubmitOptions) -> Result<Vec<String>> {
        let mut args = vec!["pr", "submit"];
        if options.draft {
            args.push("--draft");
        }
        let output = self.run_sl(cwd, &args).await?;
        Ok(extract_urls(&output.stdout))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
