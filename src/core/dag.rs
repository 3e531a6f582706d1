//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! The DAG is built once per submission from the submitted task nodes.
//! Construction validates the whole submission: duplicate ids, references
//! to ids outside the registry (hallucinated dependencies), and cycles
//! all reject the submission before anything executes. The same pass
//! computes the parallelizable execution levels and each task's chain
//! depth (longest path from a root).

use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::task::{TaskId, TaskNode};
use crate::error::{Error, FailureKind, Result};

/// The validated task dependency graph for one submission.
pub struct TaskDag {
    /// The underlying directed graph; edges point dependency → dependent.
    graph: DiGraph<TaskId, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Submitted nodes keyed by id.
    nodes: HashMap<TaskId, TaskNode>,
    /// Execution levels, in order. Within a level no task depends on
    /// another; across levels every edge goes strictly forward.
    levels: Vec<Vec<TaskId>>,
    /// Longest path from a root, per task. Equal to the level index.
    depths: HashMap<TaskId, u32>,
}

impl TaskDag {
    /// Build and validate the DAG from a submission.
    pub fn build(submitted: Vec<TaskNode>) -> Result<Self> {
        // The dependency registry is exactly the set of submitted ids.
        let mut nodes: HashMap<TaskId, TaskNode> = HashMap::new();
        let mut order: Vec<TaskId> = Vec::with_capacity(submitted.len());
        for node in submitted {
            if nodes.contains_key(&node.id) {
                return Err(Error::Submission {
                    kind: FailureKind::DuplicateTask,
                    message: format!("task {} submitted twice", node.id),
                });
            }
            order.push(node.id.clone());
            nodes.insert(node.id.clone(), node);
        }

        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();
        for id in &order {
            let index = graph.add_node(id.clone());
            task_index.insert(id.clone(), index);
        }

        for id in &order {
            let node = &nodes[id];
            for dep in &node.dependencies {
                let dep_index = task_index.get(dep).ok_or_else(|| Error::Submission {
                    kind: FailureKind::HallucinatedDependency,
                    message: format!(
                        "task {} depends on {}, which is not in the submission",
                        node.id, dep
                    ),
                })?;
                graph.add_edge(*dep_index, task_index[id], ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(Error::Submission {
                kind: FailureKind::CircularDependency,
                message: "submission contains a dependency cycle".to_string(),
            });
        }

        let (levels, depths) = Self::compute_levels(&graph, &task_index, &order);

        Ok(Self {
            graph,
            task_index,
            nodes,
            levels,
            depths,
        })
    }

    /// Kahn-style leveling: repeatedly remove every node with no
    /// unsatisfied predecessor. Insertion order is kept within a level
    /// so serial tasks run deterministically.
    fn compute_levels(
        graph: &DiGraph<TaskId, ()>,
        task_index: &HashMap<TaskId, NodeIndex>,
        order: &[TaskId],
    ) -> (Vec<Vec<TaskId>>, HashMap<TaskId, u32>) {
        let mut remaining: HashMap<TaskId, usize> = order
            .iter()
            .map(|id| {
                let index = task_index[id];
                let in_degree = graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count();
                (id.clone(), in_degree)
            })
            .collect();

        let mut levels = Vec::new();
        let mut depths = HashMap::new();
        let mut placed: HashSet<TaskId> = HashSet::new();

        while placed.len() < order.len() {
            let level: Vec<TaskId> = order
                .iter()
                .filter(|id| !placed.contains(*id) && remaining[*id] == 0)
                .cloned()
                .collect();
            debug_assert!(!level.is_empty(), "acyclic graph always has a free node");

            let depth = levels.len() as u32;
            for id in &level {
                placed.insert(id.clone());
                depths.insert(id.clone(), depth);
                for dependent in graph.neighbors_directed(task_index[id], Direction::Outgoing) {
                    let dep_id = &graph[dependent];
                    if let Some(count) = remaining.get_mut(dep_id) {
                        *count -= 1;
                    }
                }
            }
            levels.push(level);
        }

        (levels, depths)
    }

    /// The execution levels, in order.
    pub fn levels(&self) -> &[Vec<TaskId>] {
        &self.levels
    }

    /// Longest path from a root to this task.
    pub fn depth(&self, id: &TaskId) -> u32 {
        self.depths.get(id).copied().unwrap_or(0)
    }

    /// The submitted node for a task id.
    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Upstream task ids of a task.
    pub fn dependencies(&self, id: &TaskId) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// All task ids that transitively depend on `id`.
    pub fn descendants(&self, id: &TaskId) -> HashSet<TaskId> {
        let mut result = HashSet::new();
        let Some(&start) = self.task_index.get(id) else {
            return result;
        };
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                let next_id = self.graph[next].clone();
                if result.insert(next_id) {
                    stack.push(next);
                }
            }
        }
        result
    }

    /// Task ids in submission order.
    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.levels.iter().flatten()
    }

    /// Number of tasks.
    pub fn task_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the submission contains a task.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains_key(id)
    }
}

impl std::fmt::Debug for TaskDag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDag")
            .field("tasks", &self.task_count())
            .field("levels", &self.levels.len())
            .finish()
    }
}
