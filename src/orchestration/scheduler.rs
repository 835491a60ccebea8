//! Layered workflow execution.
//!
//! The `WorkflowExecutor` drives a [`TaskGraph`] one topological layer at a
//! time. Every task of a layer runs concurrently; the next layer is only
//! dispatched once every task of the current one reached a terminal status.
//! A failing task never aborts its siblings: the error is stored on its node
//! and the run carries on.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{Task, TaskGraph, TaskNode, TaskStatus, WorkflowStats};
use crate::error::Result;
use crate::orchestration::outcome::ExecutionOutcome;
use crate::orchestration::pool::ProcessPool;
use crate::{slog, slog_debug, slog_warn};

/// Capability that actually performs a task.
///
/// The scheduler knows nothing about tools or processes; it only hands the
/// task to an implementation of this trait and records what comes back.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one task. The returned payload is stored on the task's node.
    ///
    /// Implementations that spawn processes should pass `cancel` down to
    /// the runner so an aborted workflow cleans up its process trees.
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<Value>;

    /// Whether the task should run at all. Returning false marks it Skipped.
    fn should_run(&self, _task: &Task) -> bool {
        true
    }
}

/// Adapts an async closure into a [`TaskExecutor`].
///
/// ```ignore
/// let executor = FnExecutor::new(|task: Task| async move {
///     Ok(serde_json::json!({ "tool": task.tool }))
/// });
/// ```
pub struct FnExecutor<F> {
    func: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn execute(&self, task: &Task, _cancel: &CancellationToken) -> Result<Value> {
        (self.func)(task.clone()).await
    }
}

/// What happens to the dependents of a task that did not complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Mark every task with a Failed or Skipped dependency as Skipped,
    /// without running it. Applies transitively.
    #[default]
    SkipDependents,
    /// Attempt every task regardless of upstream results.
    RunDependents,
}

/// Events emitted while a workflow runs.
///
/// These allow external components (progress output, tests) to follow the
/// run without polling the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A layer is about to be dispatched.
    LayerStarted { layer: usize, tasks: Vec<String> },
    TaskStarted { task_id: String, tool: String },
    TaskCompleted { task_id: String, duration: Duration },
    TaskFailed { task_id: String, error: String },
    TaskSkipped { task_id: String, reason: String },
    /// Emitted once, after the last layer (or after cancellation).
    WorkflowComplete { stats: WorkflowStats, cancelled: bool },
}

/// Runs a task graph layer by layer.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use scanflow::core::{Task, TaskGraph};
/// use scanflow::orchestration::{FnExecutor, WorkflowExecutor};
///
/// let graph = TaskGraph::build(vec![Task::new("a", "echo")])?;
/// let executor = FnExecutor::new(|_task| async { Ok(serde_json::json!({})) });
/// let mut run = WorkflowExecutor::new(graph, Arc::new(executor));
/// let outcome = run.execute().await;
/// assert!(outcome.is_success());
/// ```
pub struct WorkflowExecutor {
    name: String,
    graph: TaskGraph,
    executor: Arc<dyn TaskExecutor>,
    pool: Option<ProcessPool>,
    policy: FailurePolicy,
    events: Option<mpsc::Sender<SchedulerEvent>>,
}

impl WorkflowExecutor {
    pub fn new(graph: TaskGraph, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            name: "workflow".to_string(),
            graph,
            executor,
            pool: None,
            policy: FailurePolicy::default(),
            events: None,
        }
    }

    /// Name recorded in the outcome.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Hold one pool permit for the duration of every task.
    pub fn with_pool(mut self, pool: ProcessPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn into_graph(self) -> TaskGraph {
        self.graph
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Run every layer to completion.
    pub async fn execute(&mut self) -> ExecutionOutcome {
        self.execute_with_cancel(&CancellationToken::new()).await
    }

    /// Run every layer, stopping early when `cancel` fires.
    ///
    /// After cancellation no further task is dispatched. Tasks that were
    /// running end Failed (their runner killed the process tree), tasks never
    /// dispatched stay Pending, and the outcome is flagged as cancelled.
    pub async fn execute_with_cancel(&mut self, cancel: &CancellationToken) -> ExecutionOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        let layer_count = self.graph.layer_count();
        slog!(
            "WorkflowExecutor[{}]: {} tasks in {} layers",
            self.name,
            self.graph.task_count(),
            layer_count
        );

        let mut cancelled = false;
        for layer in 0..layer_count {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.run_layer(layer, cancel).await;
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
        }

        let stats = self.graph.statistics();
        if cancelled {
            slog_warn!(
                "WorkflowExecutor[{}]: cancelled, {} tasks never dispatched",
                self.name,
                stats.pending
            );
        }
        emit(
            self.events.as_ref(),
            SchedulerEvent::WorkflowComplete { stats, cancelled },
        )
        .await;

        ExecutionOutcome::from_graph(
            &self.name,
            &self.graph,
            started_at,
            clock.elapsed(),
            cancelled,
        )
    }

    async fn run_layer(&mut self, layer: usize, cancel: &CancellationToken) {
        let indices = self.graph.layer_indices(layer).to_vec();
        let ids: Vec<String> = indices
            .iter()
            .map(|&index| self.graph.node_at(index).id().to_string())
            .collect();
        slog!("Layer {}: dispatching {:?}", layer, ids);
        emit(
            self.events.as_ref(),
            SchedulerEvent::LayerStarted { layer, tasks: ids },
        )
        .await;

        // Skip decisions only look at earlier layers, which are all terminal.
        let mut runnable = Vec::with_capacity(indices.len());
        let mut skipped = Vec::new();
        for index in indices {
            match self.skip_reason(index) {
                Some(reason) => skipped.push((index, reason)),
                None => runnable.push(index),
            }
        }

        for (index, reason) in skipped {
            let node = self.graph.node_at_mut(index);
            slog_debug!("Skipping {}: {}", node.id(), reason);
            let task_id = node.id().to_string();
            node.skip(reason.clone());
            emit(
                self.events.as_ref(),
                SchedulerEvent::TaskSkipped { task_id, reason },
            )
            .await;
        }

        let executor = Arc::clone(&self.executor);
        let pool = self.pool.clone();
        let events = self.events.clone();
        let runs = self
            .graph
            .nodes_mut(&runnable)
            .into_iter()
            .map(|node| run_node(node, executor.as_ref(), pool.as_ref(), events.as_ref(), cancel));
        join_all(runs).await;
    }

    fn skip_reason(&self, index: NodeIndex) -> Option<String> {
        if self.policy == FailurePolicy::SkipDependents {
            let blocked = self
                .graph
                .dependency_statuses(index)
                .into_iter()
                .find(|(_, status)| matches!(status, TaskStatus::Failed | TaskStatus::Skipped));
            if let Some((dep, status)) = blocked {
                return Some(format!("dependency '{}' {}", dep, status));
            }
        }

        if !self.executor.should_run(&self.graph.node_at(index).task) {
            return Some("declined by executor".to_string());
        }
        None
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("name", &self.name)
            .field("graph", &self.graph)
            .field("pool", &self.pool)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Run one node to a terminal status. Only this future touches the node.
async fn run_node(
    node: &mut TaskNode,
    executor: &dyn TaskExecutor,
    pool: Option<&ProcessPool>,
    events: Option<&mpsc::Sender<SchedulerEvent>>,
    cancel: &CancellationToken,
) {
    let _permit = match pool {
        Some(pool) => tokio::select! {
            permit = pool.acquire() => match permit {
                Ok(permit) => Some(permit),
                Err(e) => {
                    node.start();
                    let error = e.to_string();
                    node.fail(e);
                    emit(events, SchedulerEvent::TaskFailed { task_id: node.id().to_string(), error }).await;
                    return;
                }
            },
            // Never dispatched: the node stays Pending.
            _ = cancel.cancelled() => return,
        },
        None => None,
    };
    if cancel.is_cancelled() {
        return;
    }

    node.start();
    let task_id = node.id().to_string();
    emit(
        events,
        SchedulerEvent::TaskStarted {
            task_id: task_id.clone(),
            tool: node.task.tool.clone(),
        },
    )
    .await;

    match executor.execute(&node.task, cancel).await {
        Ok(payload) => {
            node.complete(payload);
            let duration = node.duration().unwrap_or_default();
            slog_debug!("Task {} completed in {:?}", task_id, duration);
            emit(events, SchedulerEvent::TaskCompleted { task_id, duration }).await;
        }
        Err(e) => {
            slog_warn!("Task {} failed: {}", task_id, e);
            let error = e.to_string();
            node.fail(e);
            emit(events, SchedulerEvent::TaskFailed { task_id, error }).await;
        }
    }
}

async fn emit(events: Option<&mpsc::Sender<SchedulerEvent>>, event: SchedulerEvent) {
    if let Some(tx) = events {
        // A dropped receiver only means nobody is listening.
        let _ = tx.send(event).await;
    }
}
