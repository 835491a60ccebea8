//! End-to-end workflow integration tests.
//!
//! These verify layering, layered execution and both failure policies
//! through the public API, using a scripted executor for determinism and
//! the command adapter for runs that spawn real processes.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use scanflow::core::{TaskGraph, TaskStatus, Workflow};
use scanflow::orchestration::{
    CommandAdapter, ExecutionOutcome, FailurePolicy, RegistryExecutor, SchedulerEvent,
    ToolRegistry, WorkflowExecutor, WorkflowStats,
};
use scanflow::{EngineConfig, Error};

use crate::fixtures::{
    command_engine, command_task, diamond_tasks, drain_events, fan_out_tasks, task,
    ScriptedExecutor,
};

fn layer_sets(graph: &TaskGraph) -> Vec<BTreeSet<String>> {
    graph
        .layers()
        .into_iter()
        .map(|layer| layer.into_iter().collect())
        .collect()
}

/// Test: Fan-out layering
/// Given a -> {b, c}
/// Then the layers are [a], [b, c]
#[test]
fn test_fan_out_layers() {
    let graph = TaskGraph::build(fan_out_tasks()).unwrap();
    let layers = layer_sets(&graph);
    assert_eq!(layers.len(), 2);
    assert_eq!(layers[0], BTreeSet::from(["a".to_string()]));
    assert_eq!(
        layers[1],
        BTreeSet::from(["b".to_string(), "c".to_string()])
    );
}

/// Test: Happy path
/// Given a diamond workflow
/// When it runs
/// Then every task completes and dependencies always run first
#[tokio::test]
async fn test_diamond_runs_in_dependency_order() {
    let executor = Arc::new(ScriptedExecutor::new());
    let graph = TaskGraph::build(diamond_tasks()).unwrap();
    let outcome = WorkflowExecutor::new(graph, executor.clone())
        .execute()
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.stats.completed, 4);
    let calls = executor.calls();
    assert_eq!(calls.first().map(String::as_str), Some("a"));
    assert_eq!(calls.last().map(String::as_str), Some("d"));
}

/// Test: Failure with the default policy
/// Given a -> {b, c} where a fails
/// Then b and c are skipped and never executed
#[tokio::test]
async fn test_root_failure_skips_dependents() {
    let executor = Arc::new(ScriptedExecutor::new().failing(&["a"]));
    let graph = TaskGraph::build(fan_out_tasks()).unwrap();
    let mut run = WorkflowExecutor::new(graph, executor.clone());
    let outcome = run.execute().await;

    assert_eq!(executor.calls(), vec!["a".to_string()]);
    assert_eq!(outcome.stats.failed, 1);
    assert_eq!(outcome.stats.skipped, 2);
    assert_eq!(outcome.task("b").unwrap().status, TaskStatus::Skipped);
    assert_eq!(outcome.task("c").unwrap().status, TaskStatus::Skipped);
    assert_eq!(
        outcome.task("a").unwrap().error.as_deref(),
        Some("Tool 'x' failed with exit code 2: a failed")
    );
    assert!(!outcome.is_success());
}

/// Test: Failure with the attempt-everything policy
/// Given a -> {b, c} where a fails
/// Then b and c are still attempted
#[tokio::test]
async fn test_root_failure_still_attempts_dependents() {
    let executor = Arc::new(ScriptedExecutor::new().failing(&["a"]));
    let graph = TaskGraph::build(fan_out_tasks()).unwrap();
    let outcome = WorkflowExecutor::new(graph, executor.clone())
        .with_policy(FailurePolicy::RunDependents)
        .execute()
        .await;

    let attempted: BTreeSet<String> = executor.calls().into_iter().collect();
    assert_eq!(attempted.len(), 3);
    assert_eq!(outcome.stats.failed, 1);
    assert_eq!(outcome.stats.completed, 2);
    assert_eq!(outcome.stats.skipped, 0);
}

/// Test: Empty workflow
/// Then the outcome has all counts zero and succeeds
#[test]
fn test_empty_workflow_round_trip() {
    let graph = TaskGraph::build(Vec::new()).unwrap();
    assert_eq!(graph.layer_count(), 0);

    let executor = Arc::new(ScriptedExecutor::new());
    let outcome: ExecutionOutcome =
        tokio_test::block_on(WorkflowExecutor::new(graph, executor).execute());

    assert!(outcome.is_success());
    assert_eq!(outcome.stats, WorkflowStats::default());
    assert!(outcome.results.is_empty());
    assert!(outcome.tasks.is_empty());
}

/// Test: Invalid graphs never start
/// Given a cycle or a missing dependency
/// Then building the graph fails with a validation error
#[test]
fn test_invalid_graphs_rejected() {
    let cycle = vec![task("a", "x", &["c"]), task("b", "x", &["a"]), task("c", "x", &["b"])];
    let err = TaskGraph::build(cycle).unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("cycle"));

    let missing = vec![task("a", "x", &["ghost"])];
    assert!(matches!(
        TaskGraph::build(missing),
        Err(Error::GraphValidation { .. })
    ));

    let self_loop = vec![task("a", "x", &["a"])];
    assert!(TaskGraph::build(self_loop).is_err());
}

/// Test: Payload aggregation
/// Then assets and vulnerabilities from completed tasks are merged
#[tokio::test]
async fn test_outcome_merges_payloads() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .failing(&["c"])
            .with_payload("a", json!({ "assets": [{ "host": "10.0.0.1" }] }))
            .with_payload(
                "b",
                json!({ "assets": [{ "host": "10.0.0.2" }], "vulnerabilities": [{ "id": "V-1" }] }),
            )
            .with_payload("c", json!({ "assets": [{ "host": "never" }] })),
    );
    let graph = TaskGraph::build(fan_out_tasks()).unwrap();
    let outcome = WorkflowExecutor::new(graph, executor).execute().await;

    assert_eq!(outcome.assets.len(), 2);
    assert_eq!(outcome.vulnerabilities, vec![json!({ "id": "V-1" })]);
    assert!(!outcome.results.contains_key("c"));
}

/// Test: Progress events
/// Then layers are announced in order and the run ends with WorkflowComplete
#[tokio::test]
async fn test_events_announce_layers_in_order() {
    let (tx, mut rx) = mpsc::channel(100);
    let graph = TaskGraph::build(diamond_tasks()).unwrap();
    WorkflowExecutor::new(graph, Arc::new(ScriptedExecutor::new()))
        .with_events(tx)
        .execute()
        .await;

    let events = drain_events(&mut rx);
    let layers: Vec<usize> = events
        .iter()
        .filter_map(|event| match event {
            SchedulerEvent::LayerStarted { layer, .. } => Some(*layer),
            _ => None,
        })
        .collect();
    assert_eq!(layers, vec![0, 1, 2]);

    let completed = events
        .iter()
        .filter(|event| matches!(event, SchedulerEvent::TaskCompleted { .. }))
        .count();
    assert_eq!(completed, 4);
    assert!(matches!(
        events.last(),
        Some(SchedulerEvent::WorkflowComplete {
            cancelled: false,
            ..
        })
    ));
}

/// Test: Workflow file through the engine
/// Given a TOML workflow of echo commands
/// When the engine runs it
/// Then stdout of every task is in the outcome
#[cfg(unix)]
#[tokio::test]
async fn test_engine_runs_toml_workflow() {
    let workflow = Workflow::from_toml_str(
        r#"
name = "echoes"

[[tasks]]
id = "first"
tool = "command"
target = "alpha"
options = { program = "echo", args = ["{target}"] }

[[tasks]]
id = "second"
tool = "command"
depends_on = ["first"]
options = { program = "echo", args = ["beta"] }
"#,
    )
    .unwrap();

    let engine = command_engine(EngineConfig::default());
    let outcome = engine.run(&workflow).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.results["first"]["stdout"], "alpha");
    assert_eq!(outcome.results["second"]["stdout"], "beta");
    let json = outcome.to_json_pretty().unwrap();
    assert!(json.contains("\"workflow\": \"echoes\""));
}

/// Test: Real process failure isolation
/// Given two independent tasks where one exits non-zero
/// Then the other still completes
#[cfg(unix)]
#[tokio::test]
async fn test_engine_isolates_failed_process() {
    let workflow = Workflow::new(
        "mixed",
        vec![
            command_task("bad", "false", &[]),
            command_task("good", "echo", &["fine"]),
            command_task("rejected", "echo", &["a;b"]),
        ],
    );

    let engine = command_engine(EngineConfig::default());
    let outcome = engine.run(&workflow).await.unwrap();

    assert_eq!(outcome.stats.completed, 1);
    assert_eq!(outcome.stats.failed, 2);
    assert_eq!(outcome.task("good").unwrap().status, TaskStatus::Completed);
    let rejected = outcome.task("rejected").unwrap();
    assert!(rejected
        .error
        .as_deref()
        .unwrap()
        .starts_with("Command rejected"));
}

/// Test: Timed-out process through the scheduler
/// Given a sleep 30 task and a 1s task timeout
/// Then the task is Failed with a Timeout error and its dependent is skipped
#[cfg(unix)]
#[tokio::test]
async fn test_timed_out_task_is_failed_with_timeout() {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CommandAdapter::new())).unwrap();
    let config = EngineConfig {
        task_timeout_secs: 1,
        kill_grace_millis: 200,
        ..EngineConfig::default()
    };
    let executor = RegistryExecutor::new(Arc::new(registry)).with_config(&config);
    let graph = TaskGraph::build(vec![
        command_task("slow", "sleep", &["30"]),
        command_task("after", "echo", &["never"]).depends_on(["slow"]),
    ])
    .unwrap();

    let started = std::time::Instant::now();
    let mut run = WorkflowExecutor::new(graph, Arc::new(executor));
    let outcome = run.execute().await;

    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert!(!outcome.is_success());
    let slow = run.graph().node("slow").unwrap();
    assert_eq!(slow.status, TaskStatus::Failed);
    match &slow.error {
        Some(Error::Timeout { partial, .. }) => assert!(partial.timed_out),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert_eq!(outcome.task("after").unwrap().status, TaskStatus::Skipped);
}

/// Test: Timed-out process through the engine
#[cfg(unix)]
#[tokio::test]
async fn test_engine_reports_timeout_as_failure() {
    let workflow = Workflow::new("stuck", vec![command_task("slow", "sleep", &["30"])]);
    let engine = command_engine(EngineConfig {
        task_timeout_secs: 1,
        kill_grace_millis: 200,
        ..EngineConfig::default()
    });

    let outcome = engine.run(&workflow).await.unwrap();

    assert!(!outcome.is_success());
    assert_eq!(outcome.stats.failed, 1);
    let slow = outcome.task("slow").unwrap();
    assert_eq!(slow.status, TaskStatus::Failed);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
}
