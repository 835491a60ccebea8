//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Predefined task sets (fan-out, diamond, independent)
//! - A scripted task executor that tracks peak concurrency
//! - Engines with the command adapter registered

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use scanflow::core::Task;
use scanflow::orchestration::{CommandAdapter, SchedulerEvent, TaskExecutor};
use scanflow::{Engine, EngineConfig, Error, Result};

/// Create a task with the given dependencies.
pub fn task(id: &str, tool: &str, deps: &[&str]) -> Task {
    Task::new(id, tool).depends_on(deps.iter().copied())
}

/// `a -> {b, c}`
pub fn fan_out_tasks() -> Vec<Task> {
    vec![
        task("a", "x", &[]),
        task("b", "y", &["a"]),
        task("c", "z", &["a"]),
    ]
}

/// `a -> {b, c} -> d`
pub fn diamond_tasks() -> Vec<Task> {
    vec![
        task("a", "x", &[]),
        task("b", "x", &["a"]),
        task("c", "x", &["a"]),
        task("d", "x", &["b", "c"]),
    ]
}

/// `n` tasks with no dependencies.
pub fn independent_tasks(n: usize) -> Vec<Task> {
    (0..n).map(|i| task(&format!("t{}", i), "x", &[])).collect()
}

/// A task for the command adapter running `program args...`.
pub fn command_task(id: &str, program: &str, args: &[&str]) -> Task {
    Task::new(id, "command")
        .with_option("program", program)
        .with_option("args", json!(args))
}

/// Engine with the built-in command adapter registered.
pub fn command_engine(config: EngineConfig) -> Engine {
    let mut engine = Engine::new(config).expect("valid config");
    engine
        .register_adapter(Arc::new(CommandAdapter::new()))
        .expect("register command adapter");
    engine
}

/// Task executor double.
///
/// Fails the configured ids, succeeds everything else with `{"id": ...}`
/// plus any configured payload, records every call, and tracks how many
/// executions overlap.
pub struct ScriptedExecutor {
    failing: Vec<String>,
    payloads: Vec<(String, Value)>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            failing: Vec::new(),
            payloads: Vec::new(),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, ids: &[&str]) -> Self {
        self.failing = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn with_payload(mut self, id: &str, payload: Value) -> Self {
        self.payloads.push((id.to_string(), payload));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Ids in the order they were executed.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of executions that were in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task, _cancel: &CancellationToken) -> Result<Value> {
        self.calls.lock().unwrap().push(task.id.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&task.id) {
            return Err(Error::Execution {
                tool: task.tool.clone(),
                command: vec![task.tool.clone()],
                exit_code: 2,
                stderr: format!("{} failed", task.id),
            });
        }
        let payload = self
            .payloads
            .iter()
            .find(|(id, _)| id == &task.id)
            .map(|(_, payload)| payload.clone())
            .unwrap_or_else(|| json!({ "id": task.id }));
        Ok(payload)
    }
}

/// Drain every event already sent on the channel.
pub fn drain_events(rx: &mut mpsc::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Write an executable shell script into `dir` and return its path.
#[cfg(unix)]
pub fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}
