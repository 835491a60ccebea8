//! Task data model for the execution DAG.
//!
//! A [`Task`] is the immutable, declarative description of one tool
//! invocation. A [`TaskNode`] wraps it with the mutable execution state the
//! executor tracks during one workflow run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Error;

/// Opaque, tool-specific options attached to a task.
pub type TaskOptions = BTreeMap<String, Value>;

/// A single declared task in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the workflow.
    pub id: String,
    /// Tool identifier used to find the adapter that runs this task.
    pub tool: String,
    /// Ids of tasks that must finish before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Scan target (IP, domain or URL).
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub options: TaskOptions,
    /// Condition expression, carried through untouched.
    #[serde(default)]
    pub condition: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            depends_on: Vec::new(),
            target: None,
            options: TaskOptions::new(),
            condition: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Execution status of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Intentionally not run (declined condition or failed dependency).
    Skipped,
}

impl TaskStatus {
    /// Completed, Failed and Skipped never transition further within a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Mutable execution wrapper around a [`Task`].
///
/// Created when the graph is built and mutated only by the executor unit
/// that runs this particular task.
#[derive(Debug)]
pub struct TaskNode {
    pub task: Task,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Success payload returned by the task executor.
    pub result: Option<Value>,
    pub error: Option<Error>,
    pub skip_reason: Option<String>,
}

impl TaskNode {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            skip_reason: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: Error) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Skipped;
        self.skip_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    /// Wall-clock time between start and completion, if both happened.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}
