//! Shared test doubles for this crate's unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::process::{CmdOutput, CmdRequest, CommandRunner, ProcessError};

pub(crate) type CannedResponse = Result<CmdOutput, String>;

/// Canned-response runner recording every request it sees. Once the canned
/// list is exhausted it answers success with empty output.
pub(crate) struct MockRunner {
    responses: Mutex<Vec<CannedResponse>>,
    pub commands: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new(responses: Vec<CannedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn ok(stdout: &str) -> CannedResponse {
        Ok(CmdOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    pub fn fail(stderr: &str) -> CannedResponse {
        Ok(CmdOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: 1,
        })
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, req: &CmdRequest) -> crate::process::Result<CmdOutput> {
        self.commands.lock().unwrap().push(req.display_line());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Ok(CmdOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            });
        }
        match responses.remove(0) {
            Ok(out) => Ok(out),
            Err(msg) => Err(ProcessError::Spawn {
                command: req.display_line(),
                source: std::io::Error::other(msg),
            }),
        }
    }
}
