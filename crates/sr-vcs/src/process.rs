//! The single subprocess utility every external invocation flows through.
//!
//! Backends and the agent runner hand a [`CmdRequest`] to a
//! [`CommandRunner`]; timeouts live here so every tool call gets the same
//! treatment. The trait exists so tests can substitute canned responses for
//! real processes.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },
}

pub type Result<T> = std::result::Result<T, ProcessError>;

// ---------------------------------------------------------------------------
// Request / output
// ---------------------------------------------------------------------------

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CmdRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl CmdRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            timeout: Duration::from_secs(60),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Render as a shell-ish line for logs and error messages.
    pub fn display_line(&self) -> String {
        let mut line = self.command.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if non-empty, otherwise stdout: whichever carries the error.
    pub fn error_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

/// Abstraction over subprocess execution so it can be mocked in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, req: &CmdRequest) -> Result<CmdOutput>;
}

/// Real runner backed by `tokio::process::Command`.
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, req: &CmdRequest) -> Result<CmdOutput> {
        debug!(cwd = %req.cwd.display(), "running: {}", req.display_line());

        let mut cmd = tokio::process::Command::new(&req.command);
        cmd.args(&req.args)
            .current_dir(&req.cwd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &req.env {
            cmd.env(key, value);
        }

        let output = tokio::time::timeout(req.timeout, cmd.output())
            .await
            .map_err(|_| ProcessError::Timeout {
                command: req.display_line(),
                timeout_secs: req.timeout.as_secs(),
            })?
            .map_err(|source| ProcessError::Spawn {
                command: req.display_line(),
                source,
            })?;

        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_accumulates_args() {
        let req = CmdRequest::new("git", "/tmp")
            .arg("status")
            .args(["--porcelain", "-z"]);
        assert_eq!(req.display_line(), "git status --porcelain -z");
    }

    #[test]
    fn error_text_prefers_stderr() {
        let out = CmdOutput {
            stdout: "noise".into(),
            stderr: "fatal: bad ref".into(),
            exit_code: 128,
        };
        assert!(!out.success());
        assert_eq!(out.error_text(), "fatal: bad ref");

        let out = CmdOutput {
            stdout: "useful".into(),
            stderr: "   ".into(),
            exit_code: 1,
        };
        assert_eq!(out.error_text(), "useful");
    }

    #[tokio::test]
    async fn runs_a_real_command() {
        let runner = TokioCommandRunner;
        let req = CmdRequest::new("sh", std::env::temp_dir()).args(["-c", "echo hello"]);
        let out = runner.run(&req).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let runner = TokioCommandRunner;
        let req = CmdRequest::new("sh", std::env::temp_dir()).args(["-c", "exit 3"]);
        let out = runner.run(&req).await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn timeout_raises() {
        let runner = TokioCommandRunner;
        let req = CmdRequest::new("sh", std::env::temp_dir())
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(50));
        let err = runner.run(&req).await.unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let runner = TokioCommandRunner;
        let req = CmdRequest::new("definitely-not-a-binary-xyz", std::env::temp_dir());
        let err = runner.run(&req).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
