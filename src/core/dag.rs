//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! This module provides the [`TaskGraph`] structure that represents task
//! dependencies as a directed acyclic graph and computes the layered
//! topological order the executor walks. All tasks within one layer are
//! independent of each other and may run concurrently.

use crate::core::task::{Task, TaskNode, TaskStatus};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: usize,
    pub pending: usize,
}

/// The task dependency graph.
///
/// Nodes are [`TaskNode`]s and an edge `a -> b` means "b depends on a", so
/// outgoing neighbours of a node are its dependents. The in-degree map holds
/// the number of distinct dependencies of each node.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<TaskNode, ()>,
    /// Index mapping from task id to NodeIndex for fast lookups.
    task_index: HashMap<String, NodeIndex>,
    /// Number of distinct dependencies per node.
    in_degree: HashMap<NodeIndex, usize>,
    /// Layered topological order, computed once at build time.
    layers: Vec<Vec<NodeIndex>>,
}

impl TaskGraph {
    /// Build and validate a graph from an ordered task list.
    ///
    /// # Errors
    /// Returns [`Error::GraphValidation`] if:
    /// - Two tasks share an id
    /// - A task depends on an id that is not declared
    /// - The dependencies contain a cycle (including a self-dependency)
    pub fn build(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(tasks.len(), 0);
        let mut task_index = HashMap::with_capacity(tasks.len());
        let mut in_degree = HashMap::with_capacity(tasks.len());

        for task in tasks {
            if task_index.contains_key(&task.id) {
                return Err(Error::validation(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
            let id = task.id.clone();
            let index = graph.add_node(TaskNode::new(task));
            task_index.insert(id, index);
            in_degree.insert(index, 0);
        }

        // Resolve every dependency before touching the edge set so a missing
        // reference fails the build without any partial state.
        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task = &graph[index].task;
            for dep_id in &task.depends_on {
                let dep_index = task_index.get(dep_id).ok_or_else(|| {
                    Error::validation(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep_id
                    ))
                })?;
                edges.push((*dep_index, index));
            }
        }

        for (from, to) in edges {
            // Repeated dependencies collapse into a single edge.
            if graph.find_edge(from, to).is_none() {
                graph.add_edge(from, to, ());
                if let Some(degree) = in_degree.get_mut(&to) {
                    *degree += 1;
                }
            }
        }

        let mut dag = Self {
            graph,
            task_index,
            in_degree,
            layers: Vec::new(),
        };
        dag.layers = dag.compute_layers()?;
        Ok(dag)
    }

    /// Kahn's algorithm, layer by layer.
    ///
    /// Each layer holds every node whose remaining in-degree dropped to zero
    /// while processing the previous layer. Nodes inside a layer are kept in
    /// declaration order.
    fn compute_layers(&self) -> Result<Vec<Vec<NodeIndex>>> {
        let mut remaining = self.in_degree.clone();
        let mut queue: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|index| remaining.get(index) == Some(&0))
            .collect();

        let mut layers = Vec::new();
        let mut visited = 0;

        while !queue.is_empty() {
            let layer = std::mem::take(&mut queue);
            for &index in &layer {
                visited += 1;
                for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
                    if let Some(degree) = remaining.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push(dependent);
                        }
                    }
                }
            }
            queue.sort();
            layers.push(layer);
        }

        if visited != self.graph.node_count() {
            let mut stuck: Vec<&str> = self
                .graph
                .node_indices()
                .filter(|index| remaining.get(index).copied().unwrap_or(0) > 0)
                .map(|index| self.graph[index].id())
                .collect();
            stuck.sort_unstable();
            return Err(Error::validation(format!(
                "dependency cycle prevents full ordering ({} of {} tasks ordered; blocked: {})",
                visited,
                self.graph.node_count(),
                stuck.join(", ")
            )));
        }

        Ok(layers)
    }

    /// Recompute the layered order as task ids.
    ///
    /// Always yields the same layer membership as the order computed at
    /// build time.
    pub fn topological_layers(&self) -> Result<Vec<Vec<String>>> {
        Ok(self
            .compute_layers()?
            .iter()
            .map(|layer| self.ids(layer))
            .collect())
    }

    /// The authoritative execution order computed at build time.
    pub fn layers(&self) -> Vec<Vec<String>> {
        self.layers.iter().map(|layer| self.ids(layer)).collect()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Index of the layer a task was placed in.
    pub fn layer_of(&self, id: &str) -> Option<usize> {
        let index = self.task_index.get(id)?;
        self.layers.iter().position(|layer| layer.contains(index))
    }

    fn ids(&self, layer: &[NodeIndex]) -> Vec<String> {
        layer
            .iter()
            .map(|&index| self.graph[index].id().to_string())
            .collect()
    }

    pub(crate) fn layer_indices(&self, layer: usize) -> &[NodeIndex] {
        self.layers.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn node_at(&self, index: NodeIndex) -> &TaskNode {
        &self.graph[index]
    }

    pub(crate) fn node_at_mut(&mut self, index: NodeIndex) -> &mut TaskNode {
        &mut self.graph[index]
    }

    /// Mutable access to exactly the given nodes, all at once.
    ///
    /// Each returned reference is handed to the unit of concurrency that runs
    /// that node, so no two units ever share a node.
    pub(crate) fn nodes_mut(&mut self, indices: &[NodeIndex]) -> Vec<&mut TaskNode> {
        let wanted: HashSet<usize> = indices.iter().map(|index| index.index()).collect();
        self.graph
            .node_weights_mut()
            .enumerate()
            .filter(|(position, _)| wanted.contains(position))
            .map(|(_, node)| node)
            .collect()
    }

    /// Statuses of the direct dependencies of a node.
    pub(crate) fn dependency_statuses(&self, index: NodeIndex) -> Vec<(&str, TaskStatus)> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|dep| (self.graph[dep].id(), self.graph[dep].status))
            .collect()
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.task_index.get(id).map(|&index| &self.graph[index])
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of distinct dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &str) -> bool {
        self.task_index.contains_key(id)
    }

    /// Number of distinct dependencies declared by a task.
    pub fn in_degree(&self, id: &str) -> Option<usize> {
        let index = self.task_index.get(id)?;
        self.in_degree.get(index).copied()
    }

    /// Ids of the tasks the given task depends on.
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Ids of the tasks that depend on the given task.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&str> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<&str> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|neighbor| self.graph[neighbor].id())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Pending tasks whose dependencies have all completed.
    pub fn ready_tasks(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&index| self.graph[index].status == TaskStatus::Pending)
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| self.graph[dep].status == TaskStatus::Completed)
            })
            .map(|index| self.graph[index].id())
            .collect()
    }

    /// True once every node reached a terminal status.
    pub fn is_completed(&self) -> bool {
        self.nodes().all(|node| node.status.is_terminal())
    }

    pub fn statistics(&self) -> WorkflowStats {
        let mut stats = WorkflowStats {
            total: self.task_count(),
            ..WorkflowStats::default()
        };
        for node in self.nodes() {
            match node.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Skipped => stats.skipped += 1,
            }
        }
        stats
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.edge_count())
            .field("layers", &self.layer_count())
            .finish()
    }
}
