//! Dependency analysis and wave planning.
//!
//! Tasks declare which other tasks they depend on. The resolver turns a
//! flat task list into an execution plan of waves: every task in wave N
//! depends only on tasks in waves < N, so all tasks within a wave can
//! run concurrently.

use crate::error::{Error, Result};
use crate::task::{Task, TaskId};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One layer of the execution plan. Tasks within a wave have no
/// dependency edges between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    pub index: usize,
    /// Task ids in input order.
    pub task_ids: Vec<TaskId>,
}

/// The full wave decomposition of a task set.
///
/// The plan is a pure function of the input tasks: resolving the same
/// list twice yields identical waves, including ordering within waves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub waves: Vec<Wave>,
    pub total_tasks: usize,
    /// Size of the largest wave, the most sessions the plan could ever
    /// want at once.
    pub estimated_parallelism: usize,
}

impl ExecutionPlan {
    /// Which wave a task landed in.
    pub fn wave_of(&self, id: &TaskId) -> Option<usize> {
        self.waves
            .iter()
            .find(|w| w.task_ids.contains(id))
            .map(|w| w.index)
    }

    pub fn is_empty(&self) -> bool {
        self.total_tasks == 0
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.waves.iter().flat_map(|w| w.task_ids.iter())
    }
}

/// Dependency graph resolver.
///
/// Holds the tasks and the petgraph DiGraph built from their declared
/// dependencies, with an id-to-node index for lookups. Edges run from
/// dependency to dependent.
pub struct Resolver {
    graph: DiGraph<TaskId, ()>,
    node_index: HashMap<TaskId, NodeIndex>,
}

impl Resolver {
    /// Build the graph from a task list.
    ///
    /// Fails if a task names a dependency that is not in the list, or
    /// if two tasks share an id.
    pub fn new(tasks: &[Task]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut node_index = HashMap::new();

        for task in tasks {
            if node_index.contains_key(&task.id) {
                return Err(Error::Validation(format!(
                    "Duplicate task id: {}",
                    task.id
                )));
            }
            let idx = graph.add_node(task.id.clone());
            node_index.insert(task.id.clone(), idx);
        }

        for task in tasks {
            let to = node_index[&task.id];
            for dep in &task.depends_on {
                let from = *node_index.get(dep).ok_or_else(|| Error::MissingDependency {
                    task: task.id.to_string(),
                    missing: dep.to_string(),
                })?;
                // Parallel edges from repeated deps are harmless but
                // skew in-degrees, so deduplicate.
                if graph.find_edge(from, to).is_none() {
                    graph.add_edge(from, to, ());
                }
            }
        }

        Ok(Self { graph, node_index })
    }

    /// Peel the graph into waves (Kahn's algorithm, all zero in-degree
    /// nodes at once per round).
    ///
    /// Node indices follow insertion order, so iterating them keeps the
    /// caller's input order within each wave. Resolution is read-only;
    /// the same resolver can plan repeatedly.
    pub fn plan(&self) -> Result<ExecutionPlan> {
        let total = self.graph.node_count();
        let mut indegree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph
                        .neighbors_directed(n, petgraph::Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut waves = Vec::new();
        let mut placed = 0usize;
        let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();

        while !remaining.is_empty() {
            let (ready, rest): (Vec<_>, Vec<_>) =
                remaining.into_iter().partition(|n| indegree[n] == 0);

            if ready.is_empty() {
                // Everything left sits on or behind a cycle.
                return Err(Error::DependencyCycle {
                    cycle: self.extract_cycle(&rest),
                });
            }

            for &n in &ready {
                for succ in self
                    .graph
                    .neighbors_directed(n, petgraph::Direction::Outgoing)
                {
                    *indegree.get_mut(&succ).unwrap() -= 1;
                }
            }

            placed += ready.len();
            waves.push(Wave {
                index: waves.len(),
                task_ids: ready
                    .iter()
                    .map(|&n| self.graph[n].clone())
                    .collect(),
            });
            remaining = rest;
        }

        debug_assert_eq!(placed, total);
        let estimated_parallelism = waves.iter().map(|w| w.task_ids.len()).max().unwrap_or(0);

        Ok(ExecutionPlan {
            waves,
            total_tasks: total,
            estimated_parallelism,
        })
    }

    /// Direct dependents of a task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        match self.node_index.get(id) {
            Some(&n) => self
                .graph
                .neighbors_directed(n, petgraph::Direction::Outgoing)
                .map(|s| self.graph[s].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task downstream of `id`, directly or transitively. Used to
    /// skip the whole subtree under a failed task.
    pub fn transitive_dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.node_index.get(id) else {
            return Vec::new();
        };
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![start];
        let mut out = Vec::new();
        while let Some(n) = stack.pop() {
            for succ in self
                .graph
                .neighbors_directed(n, petgraph::Direction::Outgoing)
            {
                if seen.insert(succ) {
                    out.push(self.graph[succ].clone());
                    stack.push(succ);
                }
            }
        }
        out
    }

    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        match self.node_index.get(id) {
            Some(&n) => self
                .graph
                .neighbors_directed(n, petgraph::Direction::Incoming)
                .map(|s| self.graph[s].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Walk forward from the first stuck node until a node repeats, then
    /// report the loop from its first occurrence.
    fn extract_cycle(&self, stuck: &[NodeIndex]) -> Vec<String> {
        let Some(&start) = stuck.first() else {
            return Vec::new();
        };
        let stuck_set: std::collections::HashSet<_> = stuck.iter().copied().collect();
        let mut path = vec![start];
        let mut seen: HashMap<NodeIndex, usize> = HashMap::new();
        seen.insert(start, 0);
        let mut current = start;

        loop {
            let next = self
                .graph
                .neighbors_directed(current, petgraph::Direction::Incoming)
                .find(|n| stuck_set.contains(n));
            let Some(next) = next else {
                // A stuck node always has a stuck predecessor; bail with
                // what we have rather than loop forever.
                break path.iter().map(|n| self.graph[*n].to_string()).collect();
            };
            if let Some(&pos) = seen.get(&next) {
                // Found the loop. The walk followed incoming edges, so
                // reverse to report it in dependency order.
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .rev()
                    .map(|n| self.graph[*n].to_string())
                    .collect();
                cycle.push(cycle[0].clone());
                break cycle;
            }
            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
