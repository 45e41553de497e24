//! Pre-execution plan validation: id uniqueness, dependency existence,
//! acyclicity, file-conflict detection, and structural sanity.
//!
//! The validator runs once, before the scheduler starts, and the engine
//! refuses to execute a plan whose report is not `valid`.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::graph::TaskGraph;
use crate::types::Plan;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// A dependency reference that names no task in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingDependency {
    pub task_id: String,
    pub missing: String,
}

/// The outcome of validating one plan. Re-validating the same plan produces
/// an identical report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    /// Shared files between tasks with no requires-relationship.
    pub conflicts: Vec<String>,
    /// Human-readable cycle paths, e.g. `a -> b -> a`.
    pub circular_dependencies: Vec<String>,
    pub missing_dependencies: Vec<MissingDependency>,
}

// ---------------------------------------------------------------------------
// PlanValidator
// ---------------------------------------------------------------------------

/// Stateless pre-run checker for plans.
#[derive(Debug, Clone)]
pub struct PlanValidator {
    /// Promote structural warnings (short descriptions, empty plan) to errors.
    pub strict: bool,
    /// Treat parallel file conflicts as validity failures.
    pub fail_on_conflicts: bool,
    /// Minimum description length before a structural warning fires.
    pub min_description_len: usize,
}

impl Default for PlanValidator {
    fn default() -> Self {
        Self {
            strict: false,
            fail_on_conflicts: true,
            min_description_len: 10,
        }
    }
}

impl PlanValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Run every check and compose the report.
    ///
    /// Checks are independent: a duplicate id does not suppress cycle or
    /// conflict detection on the remaining tasks.
    pub fn validate(&self, plan: &Plan) -> ValidationReport {
        let mut report = ValidationReport::default();

        self.check_unique_ids(plan, &mut report);
        self.check_missing_dependencies(plan, &mut report);

        let graph = TaskGraph::build(&plan.tasks);
        report.circular_dependencies = graph.find_cycles();
        report.conflicts = self.find_file_conflicts(&graph);

        self.check_structure(plan, &mut report);

        report.valid = report.errors.is_empty()
            && report.circular_dependencies.is_empty()
            && report.missing_dependencies.is_empty()
            && (!self.fail_on_conflicts || report.conflicts.is_empty());

        report
    }

    fn check_unique_ids(&self, plan: &Plan, report: &mut ValidationReport) {
        let mut seen = HashSet::new();
        for task in &plan.tasks {
            if !seen.insert(task.id.as_str()) {
                report
                    .errors
                    .push(format!("duplicate task id: {}", task.id));
            }
        }
    }

    fn check_missing_dependencies(&self, plan: &Plan, report: &mut ValidationReport) {
        let ids: HashSet<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
        for task in &plan.tasks {
            for dep in &task.requires {
                if !ids.contains(dep.as_str()) {
                    report.missing_dependencies.push(MissingDependency {
                        task_id: task.id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }
    }

    /// Tasks with no transitive requires-relationship may run in parallel;
    /// any file both declare is a conflict. Related tasks may legitimately
    /// share files (the refinement pattern) and are not reported.
    fn find_file_conflicts(&self, graph: &TaskGraph) -> Vec<String> {
        let mut conflicts = Vec::new();
        let mut by_file: HashMap<&str, Vec<usize>> = HashMap::new();

        for (i, task) in graph.tasks().iter().enumerate() {
            for file in &task.files {
                by_file.entry(file.as_str()).or_default().push(i);
            }
        }

        let mut files: Vec<&&str> = by_file.keys().collect();
        files.sort();

        for file in files {
            let holders = &by_file[*file];
            for (a_pos, &a) in holders.iter().enumerate() {
                for &b in &holders[a_pos + 1..] {
                    if !graph.related(a, b) {
                        conflicts.push(format!(
                            "file '{}' is declared by parallel tasks '{}' and '{}'",
                            file,
                            graph.task(a).id,
                            graph.task(b).id
                        ));
                    }
                }
            }
        }

        conflicts
    }

    /// Structural sanity: informational warnings unless `strict`.
    fn check_structure(&self, plan: &Plan, report: &mut ValidationReport) {
        let mut findings = Vec::new();

        if plan.tasks.is_empty() {
            findings.push("plan contains no tasks".to_string());
        }
        for task in &plan.tasks {
            if task.description.len() < self.min_description_len {
                findings.push(format!(
                    "task '{}' has a description shorter than {} characters",
                    task.id, self.min_description_len
                ));
            }
        }

        if self.strict {
            report.errors.extend(findings);
        } else {
            for finding in findings {
                warn!(plan = %plan.name, "{}", finding);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
