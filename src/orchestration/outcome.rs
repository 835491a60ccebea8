//! Aggregate result of one workflow run.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{TaskGraph, TaskStatus};
pub use crate::core::WorkflowStats;
use crate::error::Result;

/// Per-task line of an [`ExecutionOutcome`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: String,
    pub tool: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

/// Everything a caller needs to know about a finished run.
///
/// Built once, after every layer has drained, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub run_id: Uuid,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
    pub stats: WorkflowStats,
    /// Payload of every completed task, by task id.
    pub results: BTreeMap<String, Value>,
    /// Merged `assets` lists of all payloads.
    pub assets: Vec<Value>,
    /// Merged `vulnerabilities` lists of all payloads.
    pub vulnerabilities: Vec<Value>,
    /// One entry per task, in declaration order.
    pub tasks: Vec<TaskReport>,
    pub cancelled: bool,
}

impl ExecutionOutcome {
    /// Collect the outcome from a drained graph.
    ///
    /// Only completed tasks contribute payloads. `assets` and
    /// `vulnerabilities` are merged only when a payload is a mapping whose
    /// entry under that key is a list; anything else is left out.
    pub fn from_graph(
        workflow: &str,
        graph: &TaskGraph,
        started_at: DateTime<Utc>,
        duration: Duration,
        cancelled: bool,
    ) -> Self {
        let mut results = BTreeMap::new();
        let mut assets = Vec::new();
        let mut vulnerabilities = Vec::new();
        let mut tasks = Vec::with_capacity(graph.task_count());

        for node in graph.nodes() {
            if node.status == TaskStatus::Completed {
                if let Some(payload) = &node.result {
                    if let Some(map) = payload.as_object() {
                        if let Some(Value::Array(items)) = map.get("assets") {
                            assets.extend(items.iter().cloned());
                        }
                        if let Some(Value::Array(items)) = map.get("vulnerabilities") {
                            vulnerabilities.extend(items.iter().cloned());
                        }
                    }
                    results.insert(node.id().to_string(), payload.clone());
                }
            }

            tasks.push(TaskReport {
                id: node.id().to_string(),
                tool: node.task.tool.clone(),
                status: node.status,
                duration: node.duration(),
                error: node.error.as_ref().map(ToString::to_string),
                skip_reason: node.skip_reason.clone(),
            });
        }

        Self {
            run_id: Uuid::new_v4(),
            workflow: workflow.to_string(),
            started_at,
            completed_at: Utc::now(),
            duration,
            stats: graph.statistics(),
            results,
            assets,
            vulnerabilities,
            tasks,
            cancelled,
        }
    }

    /// No failed tasks and not cancelled.
    pub fn is_success(&self) -> bool {
        self.stats.failed == 0 && !self.cancelled
    }

    pub fn task(&self, id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|report| report.id == id)
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks
            .iter()
            .filter(|report| report.status == TaskStatus::Failed)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
