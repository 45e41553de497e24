//! File-modification scope validation.
//!
//! A task may touch its own declared files plus the declared files of every
//! task it transitively requires (the refinement pattern). Everything else is
//! forbidden. The validator runs at commit time over the set of files
//! actually staged in the task's workspace; it never reads file content.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::graph::TaskGraph;
use crate::types::{Task, ValidationMode};

// ---------------------------------------------------------------------------
// Violation types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    /// The file is declared by a task outside this task's ancestor chain.
    BelongsToOtherTask,
    /// The file is declared by no task and new files are not allowed.
    NotInSpec,
    /// The task reported success but produced zero modifications.
    NoChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeViolation {
    pub reason: ViolationReason,
    /// The offending file; absent for `no_changes`.
    pub file: Option<String>,
    /// The conflicting owner task for `belongs_to_other_task`.
    pub owner: Option<String>,
}

impl ScopeViolation {
    pub fn describe(&self) -> String {
        match self.reason {
            ViolationReason::BelongsToOtherTask => format!(
                "file '{}' belongs to task '{}'",
                self.file.as_deref().unwrap_or("?"),
                self.owner.as_deref().unwrap_or("?"),
            ),
            ViolationReason::NotInSpec => format!(
                "file '{}' is not declared by any task",
                self.file.as_deref().unwrap_or("?"),
            ),
            ViolationReason::NoChanges => "no changes to commit".to_string(),
        }
    }
}

/// Result of checking one task's actual modifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeReport {
    pub task_id: String,
    pub valid: bool,
    pub violations: Vec<ScopeViolation>,
}

// ---------------------------------------------------------------------------
// ScopeValidator
// ---------------------------------------------------------------------------

/// Per-run scope checker, initialized once with the plan's tasks.
///
/// In permissive mode violations are downgraded to warnings and the commit
/// proceeds. The exception is `no_changes`, which always fails: a success
/// report with an empty diff is a hallucination signal.
#[derive(Debug, Clone)]
pub struct ScopeValidator {
    graph: TaskGraph,
    /// file -> indices of tasks declaring it.
    owners: HashMap<String, Vec<usize>>,
    mode: ValidationMode,
    allow_new_files: bool,
}

impl ScopeValidator {
    pub fn new(tasks: &[Task], mode: ValidationMode, allow_new_files: bool) -> Self {
        let graph = TaskGraph::build(tasks);
        let mut owners: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, task) in graph.tasks().iter().enumerate() {
            for file in &task.files {
                owners.entry(file.clone()).or_default().push(i);
            }
        }
        Self {
            graph,
            owners,
            mode,
            allow_new_files,
        }
    }

    /// The files a task may modify: its own declaration plus every
    /// transitive requires-ancestor's.
    pub fn allowed_files(&self, task_id: &str) -> BTreeSet<String> {
        let mut allowed = BTreeSet::new();
        let Some(idx) = self.graph.index_of(task_id) else {
            return allowed;
        };
        allowed.extend(self.graph.task(idx).files.iter().cloned());
        for ancestor in self.graph.ancestors(idx) {
            allowed.extend(self.graph.task(ancestor).files.iter().cloned());
        }
        allowed
    }

    /// Declared files of every task outside the allowed set. Passed to the
    /// agent up-front so it is told what it must not touch.
    pub fn forbidden_files(&self, task_id: &str) -> Vec<String> {
        let allowed = self.allowed_files(task_id);
        let mut forbidden: BTreeSet<String> = BTreeSet::new();
        for task in self.graph.tasks() {
            for file in &task.files {
                if !allowed.contains(file) {
                    forbidden.insert(file.clone());
                }
            }
        }
        forbidden.into_iter().collect()
    }

    /// Check the set of files a task actually changed.
    pub fn check(&self, task_id: &str, changed: &[String]) -> ScopeReport {
        let mut violations = Vec::new();

        if changed.is_empty() {
            violations.push(ScopeViolation {
                reason: ViolationReason::NoChanges,
                file: None,
                owner: None,
            });
            return ScopeReport {
                task_id: task_id.to_string(),
                valid: false,
                violations,
            };
        }

        let allowed = self.allowed_files(task_id);
        let ancestor_set = self.ancestor_ids(task_id);

        for file in changed {
            if allowed.contains(file) {
                continue;
            }
            match self.owners.get(file) {
                Some(owner_indices) => {
                    // First declaring task outside the ancestor chain.
                    let owner = owner_indices
                        .iter()
                        .map(|&i| self.graph.task(i).id.clone())
                        .find(|id| id != task_id && !ancestor_set.contains(id.as_str()));
                    violations.push(ScopeViolation {
                        reason: ViolationReason::BelongsToOtherTask,
                        file: Some(file.clone()),
                        owner,
                    });
                }
                None => {
                    if !self.allow_new_files {
                        violations.push(ScopeViolation {
                            reason: ViolationReason::NotInSpec,
                            file: Some(file.clone()),
                            owner: None,
                        });
                    }
                }
            }
        }

        let valid = match self.mode {
            ValidationMode::Strict => violations.is_empty(),
            ValidationMode::Permissive => {
                for violation in &violations {
                    warn!(task_id = %task_id, "scope violation (permissive): {}", violation.describe());
                }
                true
            }
        };

        ScopeReport {
            task_id: task_id.to_string(),
            valid,
            violations,
        }
    }

    fn ancestor_ids(&self, task_id: &str) -> BTreeSet<&str> {
        let mut ids = BTreeSet::new();
        if let Some(idx) = self.graph.index_of(task_id) {
            for ancestor in self.graph.ancestors(idx) {
                ids.insert(self.graph.task(ancestor).id.as_str());
            }
        }
        ids
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
