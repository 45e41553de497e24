//! Engine configuration loaded from `<repo>/.stackrun/config.toml`, falling
//! back to defaults when the file does not exist.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::ValidationMode;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {cause}")]
    Io { path: PathBuf, cause: String },
    #[error("failed to parse config file {path}: {cause}")]
    Parse { path: PathBuf, cause: String },
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub vcs: VcsConfig,
    #[serde(default)]
    pub stack: StackConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl EngineConfig {
    /// Load from `<repo>/.stackrun/config.toml`; defaults when absent.
    pub fn load(repo_root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = repo_root.as_ref().join(".stackrun").join("config.toml");
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.clone(),
            cause: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path,
            cause: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Per-task retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub continue_on_error: bool,
    /// When set, a retried task's worktree is reset to its base ref before
    /// the retry instead of inheriting the prior attempt's partial changes.
    #[serde(default)]
    pub reset_worktree_on_retry: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            continue_on_error: false,
            reset_worktree_on_retry: false,
        }
    }
}

fn default_max_retries() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    /// Directory (relative to the repo root) holding task worktrees.
    #[serde(default = "default_shadow_path")]
    pub shadow_path: String,
    /// Final branch prefix; temporary branches use `tmp-<prefix>/`.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// When false, worktrees of failed tasks are preserved for post-mortem.
    #[serde(default = "default_true")]
    pub cleanup_on_failure: bool,
    /// Per-operation timeout for backend subprocess calls.
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout_secs: u64,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            shadow_path: default_shadow_path(),
            branch_prefix: default_branch_prefix(),
            cleanup_on_failure: true,
            subprocess_timeout_secs: default_subprocess_timeout(),
        }
    }
}

fn default_shadow_path() -> String {
    ".stackrun/shadows".into()
}
fn default_branch_prefix() -> String {
    "task".into()
}
fn default_true() -> bool {
    true
}
fn default_subprocess_timeout() -> u64 {
    60
}

/// Conflict handling during the stack builder's cherry-pick fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Take `--ours` then `--theirs` per file and re-stage.
    Auto,
    /// Log the conflicting files and leave resolution to the operator.
    Manual,
    /// Treat any conflict as a stack-build failure.
    Fail,
}

impl Default for ConflictResolution {
    fn default() -> Self {
        ConflictResolution::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Attempts for stack-aware branch creation before the cherry-pick
    /// fallback kicks in.
    #[serde(default = "default_branch_attempts")]
    pub max_branch_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    #[serde(default = "default_backoff_ms")]
    pub backoff_base_ms: u64,
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_branch_attempts: default_branch_attempts(),
            backoff_base_ms: default_backoff_ms(),
            conflict_resolution: ConflictResolution::default(),
        }
    }
}

fn default_branch_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(default)]
    pub validation_mode: ValidationMode,
    #[serde(default)]
    pub allow_new_files: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            validation_mode: ValidationMode::default(),
            allow_new_files: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent CLI executable.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Extra arguments prepended before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
            timeout_secs: default_agent_timeout(),
        }
    }
}

fn default_agent_command() -> String {
    "claude".into()
}
fn default_agent_timeout() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
