//! The engine instance.
//!
//! An [`Engine`] owns everything a run needs: the configuration, the tool
//! registry and the process pool shared by all runs started from it. It is
//! constructed explicitly by the caller, so several independent engines can
//! live in one process (tests do exactly that).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::{TaskGraph, Workflow};
use crate::error::{Error, Result};
use crate::orchestration::{
    ExecutionOutcome, ProcessPool, RegistryExecutor, SchedulerEvent, ToolAdapter, ToolRegistry,
    WorkflowExecutor,
};
use crate::process::ProcessRunner;
use crate::{slog, slog_debug, slog_error};

pub struct Engine {
    config: EngineConfig,
    registry: Arc<ToolRegistry>,
    pool: ProcessPool,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = ProcessPool::new(config.max_concurrent);
        slog_debug!(
            "Engine::new max_concurrent={} policy={:?}",
            config.max_concurrent,
            config.failure_policy
        );
        Ok(Self {
            config,
            registry: Arc::new(ToolRegistry::new()),
            pool,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn register_adapter(&mut self, adapter: Arc<dyn ToolAdapter>) -> Result<()> {
        Arc::make_mut(&mut self.registry).register(adapter)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    /// A runner for direct use, configured with the engine defaults.
    pub fn runner(&self, tool: &str) -> ProcessRunner {
        ProcessRunner::new(tool)
            .with_timeout(self.config.default_timeout())
            .with_kill_grace(self.config.kill_grace())
    }

    /// Build and validate the execution graph of a workflow.
    ///
    /// Fails before anything runs when the graph is invalid or a task names
    /// a tool that has no registered adapter.
    pub fn build_graph(&self, workflow: &Workflow) -> Result<TaskGraph> {
        if let Some(task) = workflow
            .tasks
            .iter()
            .find(|task| !self.registry.contains(&task.tool))
        {
            return Err(Error::ToolNotFound(task.tool.clone()));
        }
        TaskGraph::build(workflow.tasks.clone())
    }

    pub async fn run(&self, workflow: &Workflow) -> Result<ExecutionOutcome> {
        self.execute(workflow, &CancellationToken::new(), None).await
    }

    /// Run a workflow that stops when either `cancel` or [`shutdown`](Self::shutdown) fires.
    pub async fn run_with_cancel(
        &self,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        self.execute(workflow, cancel, None).await
    }

    /// Run a workflow and report progress on `events`.
    pub async fn run_with_events(
        &self,
        workflow: &Workflow,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> Result<ExecutionOutcome> {
        self.execute(workflow, &CancellationToken::new(), Some(events))
            .await
    }

    /// Full form of [`run`](Self::run): cancellable, with optional progress events.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        cancel: &CancellationToken,
        events: Option<mpsc::Sender<SchedulerEvent>>,
    ) -> Result<ExecutionOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled {
                tool: workflow.name.clone(),
            });
        }

        let graph = self.build_graph(workflow).map_err(|e| {
            slog_error!("Workflow '{}' rejected: {}", workflow.name, e);
            e
        })?;
        slog!(
            "Running workflow '{}' ({} tasks, {} layers)",
            workflow.name,
            graph.task_count(),
            graph.layer_count()
        );

        let executor = RegistryExecutor::new(Arc::clone(&self.registry)).with_config(&self.config);
        let mut run = WorkflowExecutor::new(graph, Arc::new(executor))
            .with_name(workflow.name.clone())
            .with_pool(self.pool.clone())
            .with_policy(self.config.failure_policy);
        if let Some(events) = events {
            run = run.with_events(events);
        }

        let run_token = self.shutdown.child_token();
        let forward = {
            let run_token = run_token.clone();
            let cancel = cancel.clone();
            async move {
                cancel.cancelled().await;
                run_token.cancel();
            }
        };

        let execution = run.execute_with_cancel(&run_token);
        tokio::pin!(execution);
        let outcome = tokio::select! {
            outcome = &mut execution => outcome,
            _ = forward => execution.await,
        };

        slog!(
            "Workflow '{}' finished in {:?}: {} completed, {} failed, {} skipped{}",
            outcome.workflow,
            outcome.duration,
            outcome.stats.completed,
            outcome.stats.failed,
            outcome.stats.skipped,
            if outcome.cancelled { " (cancelled)" } else { "" }
        );
        Ok(outcome)
    }

    /// Cancel every run started from this engine and refuse new ones.
    pub fn shutdown(&self) {
        slog!("Engine shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
