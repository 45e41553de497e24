//! git-spice backend. Plain-git pieces are delegated to [`GitBackend`];
//! stack-aware operations go through the `gs` CLI, which records each
//! branch's parent in its own metadata.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{Result, StackBranch, SubmitOptions, VcsBackend, VcsError};
use crate::git::GitBackend;
use crate::process::{CmdOutput, CmdRequest, CommandRunner};

pub struct GitSpiceBackend {
    git: Arc<GitBackend>,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl GitSpiceBackend {
    pub fn new(git: Arc<GitBackend>, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            git,
            runner,
            timeout,
        }
    }

    async fn run_gs(&self, cwd: &Path, args: &[&str]) -> Result<CmdOutput> {
        let req = CmdRequest::new("gs", cwd).args(args.iter().copied()).timeout(self.timeout);
        let output = self.runner.run(&req).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(VcsError::Command(format!(
                "gs {}: {}",
                args.first().copied().unwrap_or(""),
                output.error_text()
            )))
        }
    }
}

#[async_trait]
impl VcsBackend for GitSpiceBackend {
    fn name(&self) -> &'static str {
        "git-spice"
    }

    async fn is_available(&self) -> bool {
        let req = CmdRequest::new("gs", std::env::temp_dir())
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

    /// Check out the parent, create the spice-tracked branch above it, and
    /// carry the commit over. The parent relationship lands in spice
    /// metadata, which is what `restack` later repairs against.
    async fn create_branch_from_commit(
        &self,
        cwd: &Path,
        branch: &str,
        commit: &str,
        parent: &str,
    ) -> Result<()> {
        self.git.checkout(cwd, parent).await?;
        self.run_gs(cwd, &["branch", "create", branch]).await?;
        self.git.cherry_pick(cwd, commit).await?;
        Ok(())
    }

    async fn cherry_pick(&self, cwd: &Path, commit: &str) -> Result<()> {
        self.git.cherry_pick(cwd, commit).await
    }

    async fn restack(&self, cwd: &Path) -> Result<()> {
        self.run_gs(cwd, &["stack", "restack"]).await?;
        Ok(())
    }

    async fn get_stack_info(&self, cwd: &Path) -> Result<Vec<StackBranch>> {
        let output = self.run_gs(cwd, &["log", "short"]).await?;
        Ok(parse_stack_log(&output.stdout))
    }

    async fn submit_stack(&self, cwd: &Path, options: &SubmitOptions) -> Result<Vec<String>> {
        let mut args = vec!["stack", "submit"];
        if options.fill {
            args.push("--fill");
        }
        if options.draft {
            args.push("--draft");
        }
        let output = self.run_gs(cwd, &args).await?;
        Ok(extract_urls(&output.stdout))
    }
}

/// Parse a top-down stack listing into branches with their parents.
///
/// `gs log short` prints the topmost branch first; each line's last
/// whitespace-separated token is the branch name. The branch below a line is
/// its parent; the bottom entry is the trunk with no parent.
pub(crate) fn parse_stack_log(stdout: &str) -> Vec<StackBranch> {
    let names: Vec<String> = stdout
        .lines()
        .filter_map(|line| {
            line.split_whitespace()
                .last()
                .filter(|tok| tok.chars().any(|c| c.is_alphanumeric()))
                .map(str::to_string)
        })
        .collect();

    names
        .iter()
        .enumerate()
        .map(|(i, name)| StackBranch {
            branch: name.clone(),
            parent: names.get(i + 1).cloned(),
        })
        .collect()
}

pub(crate) fn extract_urls(stdout: &str) -> Vec<String> {
    stdout
        .split_whitespace()
        .filter(|tok| tok.starts_with("http://") || tok.starts_with("https://"))
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockRunner;

    fn spice(responses: Vec<crate::testutil::CannedResponse>) -> (Arc<MockRunner>, GitSpiceBackend) {
        let runner = Arc::new(MockRunner::new(responses));
        let git = Arc::new(GitBackend::new(runner.clone(), Duration::from_secs(5)));
        let backend = GitSpiceBackend::new(git, runner.clone(), Duration::from_secs(5));
        (runner, backend)
    }

    #[tokio::test]
    async fn create_branch_checks_out_parent_first() {
        let (runner, backend) = spice(vec![]);
        backend
            .create_branch_from_commit(Path::new("/repo"), "task/t2", "abc123", "task/t1")
            .await
            .unwrap();
        let commands = runner.commands();
        assert_eq!(commands[0], "git checkout task/t1");
        assert_eq!(commands[1], "gs branch create task/t2");
        assert_eq!(commands[2], "git cherry-pick abc123");
    }

    #[tokio::test]
    async fn restack_uses_stack_restack() {
        let (runner, backend) = spice(vec![]);
        backend.restack(Path::new("/repo")).await.unwrap();
        assert_eq!(runner.commands()[0], "gs stack restack");
    }

    #[tokio::test]
    async fn submit_passes_flags_and_extracts_urls() {
        let (runner, backend) = spice(vec![MockRunner::ok(
            "Created https://github.com/acme/repo/pull/7\n",
        )]);
        let urls = backend
            .submit_stack(
                Path::new("/repo"),
                &SubmitOptions {
                    draft: true,
                    fill: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(urls, vec!["https://github.com/acme/repo/pull/7".to_string()]);
        assert_eq!(runner.commands()[0], "gs stack submit --fill --draft");
    }

    #[test]
    fn parses_stack_log_top_down() {
        let log = "  ┏━□ task/t3\n  ┣━◉ task/t2\n  ┗━□ main\n";
        let stack = parse_stack_log(log);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[0].branch, "task/t3");
        assert_eq!(stack[0].parent.as_deref(), Some("task/t2"));
        assert_eq!(stack[2].branch, "main");
        assert_eq!(stack[2].parent, None);
    }

    #[tokio::test]
    async fn gs_failure_surfaces_as_command_error() {
        let (_, backend) = spice(vec![MockRunner::fail("gs: not a spice repo")]);
        let err = backend.restack(Path::new("/repo")).await.unwrap_err();
        assert!(matches!(err, VcsError::Command(_)));
    }
}
