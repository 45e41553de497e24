//! Incremental stack builder.
//!
//! Consumes per-task completions and grows a branch stack in dependency
//! order. Tasks arriving before their dependencies are queued, not rejected;
//! each successful addition drains the queue as far as possible. Branch
//! creation retries transient failures with exponential backoff and falls
//! back to a manual cherry-pick when the backend keeps failing.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sr_core::config::{ConflictResolution, StackConfig};
use sr_core::events::{EngineEvent, EventBus};
use sr_core::types::{Task, WorktreeContext};

use crate::backend::{Result, VcsBackend};
use crate::git::GitBackend;
use crate::worktree::sanitize_name;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A task whose stack branch could not be created. The task itself keeps its
/// commit; only its branch is absent from the stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStack {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct QueuedTask {
    task: Task,
    commit: String,
    workdir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// StackBuilder
// ---------------------------------------------------------------------------

/// Single-writer state machine growing the branch stack. The owning strategy
/// serializes calls to [`add_task`](StackBuilder::add_task), which also keeps
/// main-repo index operations serialized.
pub struct StackBuilder {
    backend: Arc<dyn VcsBackend>,
    git: Arc<GitBackend>,
    repo_root: PathBuf,
    branch_prefix: String,
    config: StackConfig,
    events: EventBus,
    base_ref: String,
    tip: String,
    /// task id -> the branch that carries it.
    stacked: HashMap<String, String>,
    /// Task ids in stacking order, parallel to `branch_order`.
    stacked_ids: Vec<String>,
    branch_order: Vec<String>,
    /// Dependencies considered settled for queue purposes: stacked tasks,
    /// commit-less tasks, and tasks whose stacking failed.
    settled: HashSet<String>,
    pending: Vec<QueuedTask>,
    failed: Vec<FailedStack>,
}

impl StackBuilder {
    pub fn new(
        backend: Arc<dyn VcsBackend>,
        git: Arc<GitBackend>,
        repo_root: impl Into<PathBuf>,
        branch_prefix: impl Into<String>,
        config: StackConfig,
        events: EventBus,
    ) -> Self {
        Self {
            backend,
            git,
            repo_root: repo_root.into(),
            branch_prefix: branch_prefix.into(),
            config,
            events,
            base_ref: String::new(),
            tip: String::new(),
            stacked: HashMap::new(),
            stacked_ids: Vec::new(),
            branch_order: Vec::new(),
            settled: HashSet::new(),
            pending: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Reset the builder onto a base reference. The base is the initial tip.
    pub fn initialize(&mut self, base_ref: impl Into<String>) {
        self.base_ref = base_ref.into();
        self.tip = self.base_ref.clone();
        self.stacked.clear();
        self.stacked_ids.clear();
        self.branch_order.clear();
        self.settled.clear();
        self.pending.clear();
        self.failed.clear();
    }

    pub fn tip(&self) -> &str {
        &self.tip
    }

    pub fn is_stacked(&self, task_id: &str) -> bool {
        self.stacked.contains_key(task_id)
    }

    pub fn branch_for(&self, task_id: &str) -> Option<&str> {
        self.stacked.get(task_id).map(String::as_str)
    }

    /// The most recently stacked branch among the given task ids, or the
    /// base reference when none of them is stacked yet. This is the fork
    /// point for a task whose ancestors are the given set.
    pub fn latest_branch_of(&self, ids: &HashSet<String>) -> &str {
        self.stacked_ids
            .iter()
            .rev()
            .find(|id| ids.contains(*id))
            .and_then(|id| self.stacked.get(id))
            .map(String::as_str)
            .unwrap_or(&self.base_ref)
    }

    /// Branches in stack order, bottom first.
    pub fn branches(&self) -> &[String] {
        &self.branch_order
    }

    pub fn failed_tasks(&self) -> &[FailedStack] {
        &self.failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Incorporate one task completion.
    ///
    /// Commit-less tasks are silently skipped. A task whose dependencies are
    /// not yet all settled is queued and processed automatically once a later
    /// addition settles them.
    pub async fn add_task(
        &mut self,
        task: &Task,
        commit: Option<&str>,
        wctx: Option<&WorktreeContext>,
    ) -> Result<()> {
        let Some(commit) = commit else {
            debug!(task_id = %task.id, "no commit to stack, skipping");
            self.settled.insert(task.id.clone());
            self.drain_pending().await?;
            return Ok(());
        };

        let queued = QueuedTask {
            task: task.clone(),
            commit: commit.to_string(),
            workdir: wctx.map(|w| w.path.clone()),
        };

        if !self.deps_settled(&queued.task) {
            debug!(task_id = %task.id, "dependencies not yet stacked, queuing");
            self.pending.push(queued);
            return Ok(());
        }

        self.process(queued).await?;
        self.drain_pending().await
    }

    fn deps_settled(&self, task: &Task) -> bool {
        task.requires.iter().all(|dep| self.settled.contains(dep))
    }

    async fn drain_pending(&mut self) -> Result<()> {
        loop {
            let Some(pos) = self
                .pending
                .iter()
                .position(|q| self.deps_settled(&q.task))
            else {
                return Ok(());
            };
            let queued = self.pending.remove(pos);
            self.process(queued).await?;
        }
    }

    async fn process(&mut self, queued: QueuedTask) -> Result<()> {
        let task_id = queued.task.id.clone();
        let branch = format!("{}/{}", self.branch_prefix, sanitize_name(&task_id));

        // Parent must carry the task's own dependencies, not whatever branch
        // happened to be stacked last. Siblings in a diamond both descend
        // from the shared dependency's branch, never from each other.
        let requires: HashSet<String> = queued.task.requires.iter().cloned().collect();
        let parent = self.latest_branch_of(&requires).to_string();

        // A commit made in a separate working copy must be reachable from
        // the primary repository before any branch can carry it.
        if let Some(workdir) = &queued.workdir {
            if workdir != &self.repo_root {
                self.git
                    .fetch_commit(&self.repo_root, workdir, &queued.commit)
                    .await?;
            }
        }

        let created = self
            .create_branch_with_retry(&branch, &queued.commit, &parent)
            .await;

        match created {
            Ok(()) => self.record_success(&task_id, branch, &parent),
            Err(e) => {
                warn!(
                    task_id = %task_id,
                    error = %e,
                    "stack-aware branch creation failed, falling back to cherry-pick"
                );
                if self
                    .cherry_pick_fallback(&task_id, &branch, &queued.commit, &parent)
                    .await?
                {
                    self.record_success(&task_id, branch, &parent);
                } else {
                    self.settled.insert(task_id.clone());
                    self.failed.push(FailedStack {
                        task_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    fn record_success(&mut self, task_id: &str, branch: String, parent: &str) {
        info!(task_id = %task_id, branch = %branch, parent = %parent, "branch stacked");
        self.events
            .publish(EngineEvent::branch_created(task_id, branch.clone(), parent));
        self.stacked.insert(task_id.to_string(), branch.clone());
        self.stacked_ids.push(task_id.to_string());
        self.settled.insert(task_id.to_string());
        self.branch_order.push(branch.clone());
        self.tip = branch;
    }

    async fn create_branch_with_retry(
        &self,
        branch: &str,
        commit: &str,
        parent: &str,
    ) -> Result<()> {
        let attempts = self.config.max_branch_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self
                .backend
                .create_branch_from_commit(&self.repo_root, branch, commit, parent)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.config.backoff_base_ms << (attempt - 1);
                    warn!(
                        branch = %branch,
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "transient branch creation failure, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.expect("retry loop exited without error"))
    }

    /// Manual fallback: check out the parent, create the branch, cherry-pick
    /// the commit. Returns `false` when an unresolved conflict forced a clean
    /// abort (the branch is deleted again).
    async fn cherry_pick_fallback(
        &self,
        task_id: &str,
        branch: &str,
        commit: &str,
        parent: &str,
    ) -> Result<bool> {
        self.git.checkout(&self.repo_root, parent).await?;
        self.git.checkout_new_branch(&self.repo_root, branch).await?;

        if self.git.cherry_pick(&self.repo_root, commit).await.is_ok() {
            return Ok(true);
        }

        let files = self
            .git
            .conflicted_files(&self.repo_root)
            .await
            .unwrap_or_default();

        if !files.is_empty() {
            self.events.publish(EngineEvent::ConflictDetected {
                task_id: task_id.to_string(),
                files: files.clone(),
                timestamp: chrono::Utc::now(),
            });

            if self.resolve_conflicts(task_id, &files).await {
                self.git.cherry_pick_continue(&self.repo_root).await?;
                return Ok(true);
            }
        } else {
            warn!(task_id = %task_id, "cherry-pick failed without conflicted files");
        }

        // Unwind: abort the pick, step off the branch, delete it.
        if let Err(e) = self.git.cherry_pick_abort(&self.repo_root).await {
            warn!(error = %e, "cherry-pick abort failed");
        }
        if let Err(e) = self.git.checkout(&self.repo_root, parent).await {
            warn!(error = %e, "checkout of parent after abort failed");
        }
        if let Err(e) = self.git.delete_branch(&self.repo_root, branch, true).await {
            warn!(branch = %branch, error = %e, "branch deletion after abort failed");
        }

        Ok(false)
    }

    async fn resolve_conflicts(&self, task_id: &str, files: &[String]) -> bool {
        match self.config.conflict_resolution {
            ConflictResolution::Auto => {
                for file in files {
                    let ours = self.git.take_side(&self.repo_root, file, true).await;
                    if ours.is_ok() {
                        continue;
                    }
                    if self.git.take_side(&self.repo_root, file, false).await.is_err() {
                        warn!(task_id = %task_id, file = %file, "auto-resolution failed on both sides");
                        return false;
                    }
                }
                self.events.publish(EngineEvent::ConflictResolved {
                    task_id: task_id.to_string(),
                    resolution: "auto".to_string(),
                    timestamp: chrono::Utc::now(),
                });
                true
            }
            ConflictResolution::Manual => {
                warn!(
                    task_id = %task_id,
                    files = ?files,
                    "cherry-pick conflict requires manual resolution"
                );
                false
            }
            ConflictResolution::Fail => {
                warn!(task_id = %task_id, files = ?files, "cherry-pick conflict, policy is fail");
                false
            }
        }
    }

}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{StackBranch, SubmitOptions, VcsError};
    use crate::testutil::MockRunner;
    use async_trait::async_trait;
    use sr_core::types::Complexity;
    use std::path::Path;
    use std::sync::Mutex;

    /// Scripted backend: records branch creations and fails on request.
    struct MockBackend {
        /// (branch, commit, parent) per create call.
        creations: Mutex<Vec<(String, String, String)>>,
        /// Errors returned before creations start succeeding.
        failures: Mutex<Vec<VcsError>>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                creations: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            }
        }

        fn failing_with(failures: Vec<VcsError>) -> Self {
            Self {
                creations: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
            }
        }

        fn creations(&self) -> Vec<(String, String, String)> {
            self.creations.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VcsBackend for MockBackend {
        fn name(&self) -> &'static str {
            "mock"
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn create_worktree(
            &self,
            _repo: &Path,
            _path: &Path,
            _base_ref: &str,
            _branch: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
        async fn remove_worktree(&self, _repo: &Path, _path: &Path, _force: bool) -> Result<()> {
            Ok(())
        }
        async fn status(&self, _cwd: &Path) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn add(&self, _cwd: &Path, _paths: &[String]) -> Result<()> {
            Ok(())
        }
        async fn staged_files(&self, _cwd: &Path) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn commit(&self, _cwd: &Path, _message: &str) -> Result<String> {
            Ok("mock".into())
        }
        async fn branch_exists(&self, _cwd: &Path, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn create_branch_from_commit(
            &self,
            _cwd: &Path,
            branch: &str,
            commit: &str,
            parent: &str,
        ) -> Result<()> {
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
            self.creations.lock().unwrap().push((
                branch.to_string(),
                commit.to_string(),
                parent.to_string(),
            ));
            Ok(())
        }
        async fn cherry_pick(&self, _cwd: &Path, _commit: &str) -> Result<()> {
            Ok(())
        }
        async fn restack(&self, _cwd: &Path) -> Result<()> {
            Ok(())
        }
        async fn get_stack_info(&self, _cwd: &Path) -> Result<Vec<StackBranch>> {
            Ok(Vec::new())
        }
        async fn submit_stack(&self, _cwd: &Path, _options: &SubmitOptions) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn task(id: &str, requires: &[&str]) -> Task {
        Task::new(id, id.to_uppercase(), Complexity::S)
            .with_requires(requires.iter().map(|s| s.to_string()).collect())
    }

    fn builder(backend: Arc<MockBackend>) -> StackBuilder {
        let runner = Arc::new(MockRunner::new(vec![]));
        let git = Arc::new(GitBackend::new(runner, Duration::from_secs(5)));
        let config = StackConfig {
            max_branch_attempts: 3,
            backoff_base_ms: 1,
            conflict_resolution: ConflictResolution::Auto,
        };
        let mut b = StackBuilder::new(
            backend,
            git,
            "/repo",
            "task",
            config,
            EventBus::new(),
        );
        b.initialize("main");
        b
    }

    #[tokio::test]
    async fn in_order_tasks_stack_immediately() {
        let backend = Arc::new(MockBackend::new());
        let mut b = builder(backend.clone());

        b.add_task(&task("t1", &[]), Some("c1"), None).await.unwrap();
        b.add_task(&task("t2", &["t1"]), Some("c2"), None).await.unwrap();

        assert!(b.is_stacked("t1"));
        assert!(b.is_stacked("t2"));
        assert_eq!(b.tip(), "task/t2");
        assert_eq!(b.branches(), &["task/t1".to_string(), "task/t2".to_string()]);

        let creations = backend.creations();
        assert_eq!(creations[0], ("task/t1".into(), "c1".into(), "main".into()));
        assert_eq!(creations[1], ("task/t2".into(), "c2".into(), "task/t1".into()));
    }

    #[tokio::test]
    async fn out_of_order_tasks_queue_then_drain() {
        // S10 shape: T3 (requires T2), then T2 (requires T1), then T1.
        let backend = Arc::new(MockBackend::new());
        let mut b = builder(backend.clone());

        b.add_task(&task("t3", &["t2"]), Some("c3"), None).await.unwrap();
        assert!(!b.is_stacked("t3"));
        assert_eq!(b.pending_count(), 1);

        b.add_task(&task("t2", &["t1"]), Some("c2"), None).await.unwrap();
        assert_eq!(b.pending_count(), 2);

        b.add_task(&task("t1", &[]), Some("c1"), None).await.unwrap();
        assert!(b.is_stacked("t1"));
        assert!(b.is_stacked("t2"));
        assert!(b.is_stacked("t3"));
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.tip(), "task/t3");

        // Branches were created in dependency order regardless of arrival.
        let creations = backend.creations();
        let branches: Vec<&str> = creations.iter().map(|(b, _, _)| b.as_str()).collect();
        assert_eq!(branches, vec!["task/t1", "task/t2", "task/t3"]);
    }

    #[tokio::test]
    async fn diamond_siblings_share_their_dependency_as_parent() {
        let backend = Arc::new(MockBackend::new());
        let mut b = builder(backend.clone());

        b.add_task(&task("a", &[]), Some("c1"), None).await.unwrap();
        b.add_task(&task("b", &["a"]), Some("c2"), None).await.unwrap();
        b.add_task(&task("c", &["a"]), Some("c3"), None).await.unwrap();
        b.add_task(&task("d", &["b", "c"]), Some("c4"), None).await.unwrap();

        let creations = backend.creations();
        let parent_of = |branch: &str| -> &str {
            creations
                .iter()
                .find(|(b, _, _)| b == branch)
                .map(|(_, _, parent)| parent.as_str())
                .unwrap_or_else(|| panic!("no creation recorded for {branch}"))
        };

        assert_eq!(parent_of("task/a"), "main");
        assert_eq!(parent_of("task/b"), "task/a");
        // c only requires a; b being stacked in between must not leak in.
        assert_eq!(parent_of("task/c"), "task/a");
        // d requires both siblings; its parent is the later-stacked one.
        assert_eq!(parent_of("task/d"), "task/c");
    }

    #[tokio::test]
    async fn commitless_task_is_skipped_but_settles_dependents() {
        let backend = Arc::new(MockBackend::new());
        let mut b = builder(backend.clone());

        b.add_task(&task("t2", &["t1"]), Some("c2"), None).await.unwrap();
        b.add_task(&task("t1", &[]), None, None).await.unwrap();

        assert!(!b.is_stacked("t1"));
        assert!(b.is_stacked("t2"));
        // t2 stacked directly on the base since t1 contributed nothing.
        assert_eq!(backend.creations()[0].2, "main");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = Arc::new(MockBackend::failing_with(vec![
            VcsError::Command("fatal: index.lock exists".into()),
            VcsError::Command("resource temporarily unavailable".into()),
        ]));
        let mut b = builder(backend.clone());

        b.add_task(&task("t1", &[]), Some("c1"), None).await.unwrap();
        assert!(b.is_stacked("t1"));
        assert!(b.failed_tasks().is_empty());
        assert_eq!(backend.creations().len(), 1);
    }

    #[tokio::test]
    async fn nonretryable_failure_falls_back_to_cherry_pick() {
        let backend = Arc::new(MockBackend::failing_with(vec![VcsError::Command(
            "fatal: unknown subcommand".into(),
        )]));
        let mut b = builder(backend.clone());

        // The fallback runs against the always-succeeding mock git runner,
        // so the cherry-pick path succeeds and the task still stacks.
        b.add_task(&task("t1", &[]), Some("c1"), None).await.unwrap();
        assert!(b.is_stacked("t1"));
        assert_eq!(b.tip(), "task/t1");
        assert!(b.failed_tasks().is_empty());
    }

    #[tokio::test]
    async fn initialize_resets_state() {
        let backend = Arc::new(MockBackend::new());
        let mut b = builder(backend);
        b.add_task(&task("t1", &[]), Some("c1"), None).await.unwrap();
        assert!(b.is_stacked("t1"));

        b.initialize("develop");
        assert!(!b.is_stacked("t1"));
        assert_eq!(b.tip(), "develop");
        assert!(b.branches().is_empty());
    }
}
