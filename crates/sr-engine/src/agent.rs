//! The agent contract: the opaque asynchronous operation that modifies files
//! on disk. The engine assembles the prompt, tells the agent where to work
//! and what it must not touch, and interprets the outcome; everything else
//! about the agent is external.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sr_core::config::AgentConfig;
use sr_core::types::Task;
use sr_vcs::process::{CmdRequest, CommandRunner};

use crate::cancel::CancelSignal;

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub status: AgentStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Completed,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: String,
    pub name: String,
    pub prompt: String,
    /// Files the task may modify.
    pub files: Vec<String>,
    /// Files the agent is told up-front not to touch.
    pub forbidden_files: Vec<String>,
    pub workdir: PathBuf,
    pub agent_type: String,
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn execute_task(&self, req: &AgentRequest, cancel: &CancelSignal) -> AgentOutcome;
}

// ---------------------------------------------------------------------------
// Prompt assembly
// ---------------------------------------------------------------------------

/// Build the agent prompt from the task description, acceptance criteria,
/// complexity hint, and the allowed/forbidden file lists.
pub fn build_prompt(task: &Task, allowed: &[String], forbidden: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("Task: {}\n", task.name));
    prompt.push_str(&format!("Estimated complexity: {}\n\n", task.complexity));
    prompt.push_str(&task.description);
    prompt.push('\n');

    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {}\n", criterion));
        }
    }

    if !allowed.is_empty() {
        prompt.push_str("\nYou may modify only these files:\n");
        for file in allowed {
            prompt.push_str(&format!("- {}\n", file));
        }
    }

    if !forbidden.is_empty() {
        prompt.push_str("\nDo NOT touch these files (they belong to other tasks):\n");
        for file in forbidden {
            prompt.push_str(&format!("- {}\n", file));
        }
    }

    prompt
}

// ---------------------------------------------------------------------------
// SubprocessAgent
// ---------------------------------------------------------------------------

/// Agent driven through a CLI subprocess (e.g. `claude -p <prompt>`), run in
/// the task's working copy.
///
/// Cancellation is cooperative: a cancelled run refuses to start new
/// invocations, but an in-flight invocation is awaited rather than killed.
pub struct SubprocessAgent {
    runner: Arc<dyn CommandRunner>,
    config: AgentConfig,
}

impl SubprocessAgent {
    pub fn new(runner: Arc<dyn CommandRunner>, config: AgentConfig) -> Self {
        Self { runner, config }
    }
}

#[async_trait]
impl Agent for SubprocessAgent {
    async fn execute_task(&self, req: &AgentRequest, cancel: &CancelSignal) -> AgentOutcome {
        if cancel.is_cancelled() {
            return AgentOutcome::failed("cancelled before agent start");
        }

        debug!(
            task_id = %req.task_id,
            agent = %self.config.command,
            workdir = %req.workdir.display(),
            "invoking agent"
        );

        let cmd = CmdRequest::new(&self.config.command, &req.workdir)
            .args(self.config.args.iter().cloned())
            .arg(&req.prompt)
            .timeout(Duration::from_secs(self.config.timeout_secs));

        match self.runner.run(&cmd).await {
            Ok(output) if output.success() => AgentOutcome::completed(output.stdout),
            Ok(output) => AgentOutcome::failed(format!(
                "agent exited with code {}: {}",
                output.exit_code,
                output.error_text()
            )),
            Err(e) => AgentOutcome::failed(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sr_core::types::Complexity;
    use sr_vcs::process::CmdOutput;
    use std::sync::Mutex;

    struct MockRunner {
        responses: Mutex<Vec<CmdOutput>>,
        requests: Mutex<Vec<CmdRequest>>,
    }

    impl MockRunner {
        fn success(stdout: &str) -> Self {
            Self {
                responses: Mutex::new(vec![CmdOutput {
                    stdout: stdout.into(),
                    stderr: String::new(),
                    exit_code: 0,
                }]),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failure(stderr: &str, code: i32) -> Self {
            Self {
                responses: Mutex::new(vec![CmdOutput {
                    stdout: String::new(),
                    stderr: stderr.into(),
                    exit_code: code,
                }]),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, req: &CmdRequest) -> sr_vcs::process::Result<CmdOutput> {
            self.requests.lock().unwrap().push(req.clone());
            Ok(self.responses.lock().unwrap().remove(0))
        }
    }

    fn request() -> AgentRequest {
        AgentRequest {
            task_id: "t1".into(),
            name: "Task one".into(),
            prompt: "do the thing".into(),
            files: vec!["a.rs".into()],
            forbidden_files: vec![],
            workdir: PathBuf::from("/work"),
            agent_type: "claude".into(),
        }
    }

    #[test]
    fn prompt_contains_all_sections() {
        let mut task = Task::new("t1", "Wire the API", Complexity::M)
            .with_description("Expose the new endpoint.");
        task.acceptance_criteria = vec!["endpoint returns 200".into()];

        let prompt = build_prompt(
            &task,
            &["src/api.rs".into()],
            &["src/db.rs".into()],
        );

        assert!(prompt.contains("Wire the API"));
        assert!(prompt.contains("Estimated complexity: M"));
        assert!(prompt.contains("Expose the new endpoint."));
        assert!(prompt.contains("endpoint returns 200"));
        assert!(prompt.contains("You may modify only these files"));
        assert!(prompt.contains("src/api.rs"));
        assert!(prompt.contains("Do NOT touch"));
        assert!(prompt.contains("src/db.rs"));
    }

    #[test]
    fn prompt_omits_empty_sections() {
        let task = Task::new("t1", "Small fix", Complexity::Xs).with_description("Fix it.");
        let prompt = build_prompt(&task, &[], &[]);
        assert!(!prompt.contains("Acceptance criteria"));
        assert!(!prompt.contains("Do NOT touch"));
    }

    #[tokio::test]
    async fn subprocess_agent_reports_success() {
        let runner = Arc::new(MockRunner::success("done\n"));
        let agent = SubprocessAgent::new(runner.clone(), AgentConfig::default());
        let outcome = agent.execute_task(&request(), &CancelSignal::new()).await;

        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.output.as_deref(), Some("done\n"));

        let requests = runner.requests.lock().unwrap();
        assert_eq!(requests[0].command, "claude");
        assert_eq!(requests[0].cwd, PathBuf::from("/work"));
        assert!(requests[0].args.contains(&"do the thing".to_string()));
    }

    #[tokio::test]
    async fn subprocess_agent_reports_failure_with_exit_code() {
        let runner = Arc::new(MockRunner::failure("model overloaded", 2));
        let agent = SubprocessAgent::new(runner, AgentConfig::default());
        let outcome = agent.execute_task(&request(), &CancelSignal::new()).await;

        assert_eq!(outcome.status, AgentStatus::Failed);
        let error = outcome.error.unwrap();
        assert!(error.contains("code 2"));
        assert!(error.contains("model overloaded"));
    }

    #[tokio::test]
    async fn cancelled_signal_blocks_new_invocations() {
        let runner = Arc::new(MockRunner::success("unused"));
        let agent = SubprocessAgent::new(runner.clone(), AgentConfig::default());
        let cancel = CancelSignal::new();
        cancel.cancel();

        let outcome = agent.execute_task(&request(), &cancel).await;
        assert_eq!(outcome.status, AgentStatus::Failed);
        assert!(runner.requests.lock().unwrap().is_empty());
    }
}
