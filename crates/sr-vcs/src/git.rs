//! Plain-git backend. Drives the merge-commit and worktree modes and
//! provides the low-level plumbing the stack builder's cherry-pick fallback
//! and the worktree manager build on.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{Result, StackBranch, SubmitOptions, VcsBackend, VcsError};
use crate::process::{CmdOutput, CmdRequest, CommandRunner};

// ---------------------------------------------------------------------------
// GitBackend
// ---------------------------------------------------------------------------

pub struct GitBackend {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl GitBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub(crate) async fn run_git(&self, cwd: &Path, args: &[&str]) -> Result<CmdOutput> {
        let req = CmdRequest::new("git", cwd).args(args.iter().copied()).timeout(self.timeout);
        Ok(self.runner.run(&req).await?)
    }

    /// Run git and map a non-zero exit to `VcsError::Command`.
    pub(crate) async fn git_ok(&self, cwd: &Path, args: &[&str]) -> Result<CmdOutput> {
        let output = self.run_git(cwd, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(VcsError::Command(format!(
                "git {}: {}",
                args.first().copied().unwrap_or(""),
                output.error_text()
            )))
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing beyond the capability trait
    // -----------------------------------------------------------------------

    pub async fn rev_parse(&self, cwd: &Path, rev: &str) -> Result<String> {
        let output = self.git_ok(cwd, &["rev-parse", rev]).await?;
        Ok(output.stdout.trim().to_string())
    }

    pub async fn commit_exists(&self, cwd: &Path, commit: &str) -> Result<bool> {
        let output = self
            .run_git(cwd, &["cat-file", "-e", &format!("{commit}^{{commit}}")])
            .await?;
        Ok(output.success())
    }

    pub async fn checkout(&self, cwd: &Path, rev: &str) -> Result<()> {
        self.git_ok(cwd, &["checkout", rev]).await?;
        Ok(())
    }

    pub async fn checkout_new_branch(&self, cwd: &Path, branch: &str) -> Result<()> {
        self.git_ok(cwd, &["checkout", "-b", branch]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, cwd: &Path, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.git_ok(cwd, &["branch", flag, branch]).await?;
        Ok(())
    }

    pub async fn rename_branch(&self, cwd: &Path, from: &str, to: &str) -> Result<()> {
        self.git_ok(cwd, &["branch", "-m", from, to]).await?;
        Ok(())
    }

    pub async fn cherry_pick_abort(&self, cwd: &Path) -> Result<()> {
        self.git_ok(cwd, &["cherry-pick", "--abort"]).await?;
        Ok(())
    }

    /// Finish a cherry-pick after its conflicts were staged. The editor is
    /// suppressed so the picked commit's message is reused as-is.
    pub async fn cherry_pick_continue(&self, cwd: &Path) -> Result<()> {
        self.git_ok(cwd, &["-c", "core.editor=true", "cherry-pick", "--continue"])
            .await?;
        Ok(())
    }

    /// Files left in the unmerged state after a failed merge or cherry-pick.
    pub async fn conflicted_files(&self, cwd: &Path) -> Result<Vec<String>> {
        let output = self
            .git_ok(cwd, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(lines(&output.stdout))
    }

    /// Resolve one conflicted file by taking one side and re-staging it.
    pub async fn take_side(&self, cwd: &Path, file: &str, ours: bool) -> Result<()> {
        let side = if ours { "--ours" } else { "--theirs" };
        self.git_ok(cwd, &["checkout", side, "--", file]).await?;
        self.git_ok(cwd, &["add", "--", file]).await?;
        Ok(())
    }

    /// Make `commit` reachable from `repo` when it was created in a working
    /// copy that is not the repository itself. Worktrees share the object
    /// database, so the fetch is skipped when the commit is already present.
    pub async fn fetch_commit(&self, repo: &Path, workdir: &Path, commit: &str) -> Result<()> {
        if self.commit_exists(repo, commit).await? {
            return Ok(());
        }
        let workdir = workdir.to_string_lossy().to_string();
        self.git_ok(repo, &["fetch", &workdir, commit]).await?;
        Ok(())
    }

    pub async fn reset_index(&self, cwd: &Path) -> Result<()> {
        self.git_ok(cwd, &["reset"]).await?;
        Ok(())
    }

    /// Hard-reset a working copy to a ref. Used between retries when the
    /// reset-on-retry policy is enabled.
    pub async fn reset_hard(&self, cwd: &Path, rev: &str) -> Result<()> {
        self.git_ok(cwd, &["reset", "--hard", rev]).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VcsBackend impl
// ---------------------------------------------------------------------------

#[async_trait]
impl VcsBackend for GitBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn is_available(&self) -> bool {
        let req = CmdRequest::new("git", std::env::temp_dir())
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
        let path_str = path.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec!["worktree", "add"];
        if let Some(branch) = branch {
            args.extend(["-b", branch]);
        }
        args.push(&path_str);
        args.push(base_ref);

        let output = self.run_git(repo, &args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(VcsError::WorktreeCreate(output.error_text().to_string()))
        }
    }

    async fn remove_worktree(&self, repo: &Path, path: &Path, force: bool) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.git_ok(repo, &args).await?;
        Ok(())
    }

    async fn status(&self, cwd: &Path) -> Result<Vec<String>> {
        let output = self.git_ok(cwd, &["status", "--porcelain"]).await?;
        Ok(output
            .stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].trim().to_string())
            .collect())
    }

    async fn add(&self, cwd: &Path, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            self.git_ok(cwd, &["add", "-A"]).await?;
        } else {
            let mut args: Vec<&str> = vec!["add", "--"];
            args.extend(paths.iter().map(String::as_str));
            self.git_ok(cwd, &args).await?;
        }
        Ok(())
    }

    async fn staged_files(&self, cwd: &Path) -> Result<Vec<String>> {
        let output = self
            .git_ok(cwd, &["diff", "--cached", "--name-only"])
            .await?;
        Ok(lines(&output.stdout))
    }

    async fn commit(&self, cwd: &Path, message: &str) -> Result<String> {
        let output = self.run_git(cwd, &["commit", "-m", message]).await?;
        if !output.success() {
            return Err(VcsError::CommitFailed(output.error_text().to_string()));
        }
        self.rev_parse(cwd, "HEAD").await
    }

    async fn branch_exists(&self, cwd: &Path, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{name}");
        let output = self
            .run_git(cwd, &["rev-parse", "--verify", "--quiet", &refname])
            .await?;
        Ok(output.success())
    }

    /// Plain git has no stack metadata: the branch is created at the commit
    /// and the parent relationship is not recorded.
    async fn create_branch_from_commit(
        &self,
        cwd: &Path,
        branch: &str,
        commit: &str,
        _parent: &str,
    ) -> Result<()> {
        self.git_ok(cwd, &["branch", branch, commit]).await?;
        Ok(())
    }

    async fn cherry_pick(&self, cwd: &Path, commit: &str) -> Result<()> {
        self.git_ok(cwd, &["cherry-pick", commit]).await?;
        Ok(())
    }

    async fn restack(&self, _cwd: &Path) -> Result<()> {
        // Nothing to repair without stack metadata.
        Ok(())
    }

    async fn get_stack_info(&self, _cwd: &Path) -> Result<Vec<StackBranch>> {
        Ok(Vec::new())
    }

    async fn submit_stack(&self, _cwd: &Path, _options: &SubmitOptions) -> Result<Vec<String>> {
        Err(VcsError::Command(
            "plain git cannot submit a stack; use git-spice, graphite, or sapling".into(),
        ))
    }
}

fn lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
