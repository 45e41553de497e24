//! The requires-graph: an arena-style view over a plan's tasks providing
//! cycle detection, topological ordering, and ancestry queries.
//!
//! Tasks are held in a flat vector with id -> index maps, so the graph never
//! owns cycles even when the underlying plan declares them.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::Task;

// ---------------------------------------------------------------------------
// TaskGraph
// ---------------------------------------------------------------------------

/// Immutable dependency graph over a set of tasks.
///
/// Construction is infallible: duplicate ids keep the first occurrence and
/// unknown dependency edges are dropped. The plan validator reports both
/// conditions separately, so the graph stays usable for cycle and conflict
/// analysis even on malformed plans.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    /// Edges task -> tasks it requires.
    requires: Vec<Vec<usize>>,
    /// Reverse edges: task -> tasks that require it.
    dependents: Vec<Vec<usize>>,
}

impl TaskGraph {
    pub fn build(tasks: &[Task]) -> Self {
        let mut kept: Vec<Task> = Vec::with_capacity(tasks.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(tasks.len());

        for task in tasks {
            if index.contains_key(&task.id) {
                continue;
            }
            index.insert(task.id.clone(), kept.len());
            kept.push(task.clone());
        }

        let mut requires = vec![Vec::new(); kept.len()];
        let mut dependents = vec![Vec::new(); kept.len()];

        for (i, task) in kept.iter().enumerate() {
            for dep in &task.requires {
                // Unknown ids are dropped here; a self-edge is kept so cycle
                // detection reports the one-node cycle.
                if let Some(&j) = index.get(dep) {
                    requires[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        Self {
            tasks: kept,
            index,
            requires,
            dependents,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, idx: usize) -> &Task {
        &self.tasks[idx]
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn requires_of(&self, idx: usize) -> &[usize] {
        &self.requires[idx]
    }

    // -----------------------------------------------------------------------
    // Cycle detection
    // -----------------------------------------------------------------------

    /// Find every dependency cycle, each rendered as a human-readable path
    /// like `a -> b -> a`.
    ///
    /// Depth-first traversal with white/gray/black color marks; a back edge
    /// into a gray node closes a cycle.
    pub fn find_cycles(&self) -> Vec<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let n = self.tasks.len();
        let mut color = vec![Color::White; n];
        let mut cycles = Vec::new();

        // Iterative DFS carrying the gray path for cycle rendering.
        for start in 0..n {
            if color[start] != Color::White {
                continue;
            }
            let mut path: Vec<usize> = Vec::new();
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

            while let Some(&(node, edge)) = stack.last() {
                if edge == 0 {
                    color[node] = Color::Gray;
                    path.push(node);
                }
                if edge < self.requires[node].len() {
                    let next = self.requires[node][edge];
                    if let Some(frame) = stack.last_mut() {
                        frame.1 += 1;
                    }
                    match color[next] {
                        Color::White => stack.push((next, 0)),
                        Color::Gray => {
                            let pos = path.iter().position(|&p| p == next).unwrap_or(0);
                            let mut ids: Vec<&str> =
                                path[pos..].iter().map(|&p| self.tasks[p].id.as_str()).collect();
                            ids.push(self.tasks[next].id.as_str());
                            cycles.push(ids.join(" -> "));
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    path.pop();
                    stack.pop();
                }
            }
        }

        cycles
    }

    pub fn has_cycles(&self) -> bool {
        !self.find_cycles().is_empty()
    }

    // -----------------------------------------------------------------------
    // Topological order
    // -----------------------------------------------------------------------

    /// Topological order over the requires-graph, ties broken by ascending
    /// complexity then task id, so simpler tasks land lower in a stack and
    /// the order is deterministic.
    ///
    /// Returns `None` when the graph contains a cycle.
    pub fn topological_order(&self) -> Option<Vec<usize>> {
        let n = self.tasks.len();
        let mut in_degree: Vec<usize> = self.requires.iter().map(|r| r.len()).collect();
        let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while !ready.is_empty() {
            // Smallest (complexity, id) first.
            let (pos, _) = ready
                .iter()
                .enumerate()
                .min_by_key(|(_, &i)| (self.tasks[i].complexity, self.tasks[i].id.as_str()))?;
            let node = ready.swap_remove(pos);
            order.push(node);

            for &dep in &self.dependents[node] {
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    ready.push(dep);
                }
            }
        }

        if order.len() == n {
            Some(order)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Ancestry
    // -----------------------------------------------------------------------

    /// Every task reachable through requires-edges from `idx` (exclusive).
    pub fn ancestors(&self, idx: usize) -> HashSet<usize> {
        self.reach(idx, &self.requires)
    }

    /// Every task that transitively requires `idx` (exclusive).
    pub fn descendants(&self, idx: usize) -> HashSet<usize> {
        self.reach(idx, &self.dependents)
    }

    /// True when a requires-relationship (in either direction) connects the
    /// two tasks.
    pub fn related(&self, a: usize, b: usize) -> bool {
        self.ancestors(a).contains(&b) || self.ancestors(b).contains(&a)
    }

    fn reach(&self, start: usize, edges: &[Vec<usize>]) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from_iter(edges[start].iter().copied());
        while let Some(node) = queue.pop_front() {
            if seen.insert(node) {
                queue.extend(edges[node].iter().copied());
            }
        }
        seen
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
