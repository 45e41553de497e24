//! Per-task state machine and transition history — the single authoritative
//! state store for a run.
//!
//! Every mutation flows through validated transition methods. Illegal
//! transitions are no-ops with a logged warning so that concurrent completion
//! and halt attempts can never crash the engine. Dependency cascades
//! (promotion to `ready`, blocking of dependents) happen here and nowhere
//! else.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sr_core::graph::TaskGraph;
use sr_core::types::{StateTransition, Task, TaskState};

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub blocked: usize,
    /// Total `failed -> queued` transitions recorded across all tasks.
    pub retries: usize,
}

// ---------------------------------------------------------------------------
// TransitionManager
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TaskRecord {
    state: TaskState,
    history: Vec<StateTransition>,
}

pub struct TransitionManager {
    records: HashMap<String, TaskRecord>,
    /// Input order, for deterministic iteration.
    order: Vec<String>,
    graph: TaskGraph,
    max_retries: u32,
}

impl TransitionManager {
    pub fn new(tasks: &[Task], max_retries: u32) -> Self {
        let mut manager = Self {
            records: HashMap::new(),
            order: Vec::new(),
            graph: TaskGraph::build(tasks),
            max_retries,
        };
        manager.initialize(tasks);
        manager
    }

    /// Reset every task to `pending`, then promote tasks with no requires to
    /// `ready`.
    pub fn initialize(&mut self, tasks: &[Task]) {
        self.graph = TaskGraph::build(tasks);
        self.order = self.graph.tasks().iter().map(|t| t.id.clone()).collect();
        self.records = self
            .order
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    TaskRecord {
                        state: TaskState::Pending,
                        history: Vec::new(),
                    },
                )
            })
            .collect();

        let ready_ids: Vec<String> = self
            .graph
            .tasks()
            .iter()
            .filter(|task| task.requires.is_empty())
            .map(|task| task.id.clone())
            .collect();
        for id in ready_ids {
            self.transition(&id, TaskState::Ready, Some("no dependencies"));
        }
    }

    pub fn task_ids(&self) -> &[String] {
        &self.order
    }

    pub fn state(&self, id: &str) -> Option<TaskState> {
        self.records.get(id).map(|r| r.state)
    }

    pub fn history(&self, id: &str) -> &[StateTransition] {
        self.records.get(id).map(|r| r.history.as_slice()).unwrap_or(&[])
    }

    /// Tasks currently in `ready`, in input order; the scheduler consumes
    /// this as the next layer.
    pub fn executable_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.state(id) == Some(TaskState::Ready))
            .cloned()
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.records.values().all(|r| r.state.is_terminal())
    }

    /// Number of recorded `failed -> queued` transitions for a task.
    pub fn retry_count(&self, id: &str) -> u32 {
        self.history(id)
            .iter()
            .filter(|t| t.from == TaskState::Failed && t.to == TaskState::Queued)
            .count() as u32
    }

    pub fn can_retry(&self, id: &str) -> bool {
        self.retry_count(id) < self.max_retries
    }

    pub fn statistics(&self) -> TaskStatistics {
        let mut stats = TaskStatistics {
            total: self.records.len(),
            ..TaskStatistics::default()
        };
        for record in self.records.values() {
            match record.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Ready => stats.ready += 1,
                TaskState::Queued => stats.queued += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Skipped => stats.skipped += 1,
                TaskState::Blocked => stats.blocked += 1,
            }
        }
        stats.retries = self
            .order
            .iter()
            .map(|id| self.retry_count(id) as usize)
            .sum();
        stats
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Explicit transition with source-state validation. Returns `false`
    /// (and logs a warning) for unknown tasks and illegal transitions.
    pub fn transition(&mut self, id: &str, to: TaskState, reason: Option<&str>) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            warn!(task_id = %id, "transition requested for unknown task");
            return false;
        };
        let from = record.state;
        if !from.can_transition_to(&to) {
            warn!(task_id = %id, from = %from, to = %to, "illegal transition ignored");
            return false;
        }

        record.state = to;
        record
            .history
            .push(StateTransition::new(from, to, reason.map(str::to_string)));
        debug!(task_id = %id, from = %from, to = %to, "task transition");
        true
    }

    /// Dispatch a task: `ready -> queued -> running`, or `queued -> running`
    /// for a task re-queued by a retry.
    pub fn start_task(&mut self, id: &str) -> bool {
        match self.state(id) {
            Some(TaskState::Ready) => {
                self.transition(id, TaskState::Queued, None)
                    && self.transition(id, TaskState::Running, None)
            }
            Some(TaskState::Queued) => self.transition(id, TaskState::Running, Some("retry")),
            other => {
                warn!(task_id = %id, state = ?other, "start requested in non-startable state");
                false
            }
        }
    }

    /// Complete a task and promote every task whose requires are now fully
    /// satisfied.
    pub fn complete_task(&mut self, id: &str) -> bool {
        if !self.transition(id, TaskState::Completed, None) {
            return false;
        }
        self.promote_ready();
        true
    }

    /// Fail a task. Dependents are blocked only once the retry budget is
    /// exhausted; a task that will be retried has not failed terminally.
    pub fn fail_task(&mut self, id: &str, reason: &str) -> bool {
        if !self.transition(id, TaskState::Failed, Some(reason)) {
            return false;
        }
        if !self.can_retry(id) {
            self.block_dependents(id, reason);
        }
        true
    }

    /// Skip a task from any non-terminal state; transitive dependents are
    /// blocked.
    pub fn skip_task(&mut self, id: &str, reason: &str) -> bool {
        if !self.transition(id, TaskState::Skipped, Some(reason)) {
            return false;
        }
        self.block_dependents(id, reason);
        true
    }

    /// Re-queue a failed task while retries remain.
    pub fn retry_task(&mut self, id: &str) -> bool {
        if self.state(id) != Some(TaskState::Failed) {
            warn!(task_id = %id, "retry requested for non-failed task");
            return false;
        }
        if !self.can_retry(id) {
            debug!(task_id = %id, "retry budget exhausted");
            return false;
        }
        self.transition(id, TaskState::Queued, Some("retry"))
    }

    // -----------------------------------------------------------------------
    // Cascades
    // -----------------------------------------------------------------------

    fn promote_ready(&mut self) {
        let promotable: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.state(id) == Some(TaskState::Pending))
            .filter(|id| self.requires_satisfied(id))
            .cloned()
            .collect();
        for id in promotable {
            self.transition(&id, TaskState::Ready, Some("dependencies satisfied"));
        }
    }

    fn requires_satisfied(&self, id: &str) -> bool {
        let Some(idx) = self.graph.index_of(id) else {
            return false;
        };
        self.graph
            .requires_of(idx)
            .iter()
            .all(|&dep| self.state(&self.graph.task(dep).id) == Some(TaskState::Completed))
    }

    fn block_dependents(&mut self, id: &str, reason: &str) {
        let Some(idx) = self.graph.index_of(id) else {
            return;
        };
        let reason = format!("dependency '{}' failed: {}", id, reason);
        for dep_idx in self.graph.descendants(idx) {
            let dep_id = self.graph.task(dep_idx).id.clone();
            match self.state(&dep_id) {
                Some(TaskState::Pending) | Some(TaskState::Ready) => {
                    self.transition(&dep_id, TaskState::Blocked, Some(&reason));
                }
                // Queued/running dependents cannot exist (their requires
                // never completed); terminal and blocked states stay put.
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
