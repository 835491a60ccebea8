//! Process pool for bounding concurrent tool executions.
//!
//! The `ProcessPool` wraps a counting semaphore shared across the whole
//! engine. Every process execution holds one permit for its full lifetime;
//! the permit is released when it is dropped, so every exit path (success,
//! failure, timeout, cancellation, panic) gives it back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::process::{ProcessResult, ProcessRunner};
use crate::slog_trace;

/// Default number of concurrent processes.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// One unit of work for [`ProcessPool::run_batch`].
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub runner: ProcessRunner,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
}

impl BatchItem {
    pub fn new(runner: ProcessRunner, command: Vec<String>) -> Self {
        Self {
            runner,
            command,
            cwd: None,
            env: None,
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }
}

/// Counting permit pool shared by every execution in one engine.
///
/// Cloning is cheap and clones share the same permits.
///
/// # Example
///
/// ```ignore
/// use scanflow::orchestration::ProcessPool;
/// use scanflow::process::ProcessRunner;
///
/// let pool = ProcessPool::new(2);
/// let runner = ProcessRunner::new("echo");
/// let result = pool.submit(&runner, &["echo", "hi"], None, None).await?;
/// ```
#[derive(Debug, Clone)]
pub struct ProcessPool {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ProcessPool {
    /// Create a pool allowing `max_concurrent` simultaneous processes.
    ///
    /// A capacity of zero would block every caller forever, so it is
    /// raised to one.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] once the pool has been closed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled {
                tool: "process pool".to_string(),
            })?;
        slog_trace!(
            "ProcessPool: permit acquired ({} of {} free)",
            self.semaphore.available_permits(),
            self.max_concurrent
        );
        Ok(permit)
    }

    /// Run one command while holding a permit.
    pub async fn submit<S: AsRef<str>>(
        &self,
        runner: &ProcessRunner,
        command: &[S],
        cwd: Option<&Path>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<ProcessResult> {
        let _permit = self.acquire().await?;
        runner.run(command, cwd, env).await
    }

    /// Run every item under the shared permits.
    ///
    /// The returned vector is in input order, whatever order the
    /// processes finish in. One failure does not affect the others.
    pub async fn run_batch(&self, items: Vec<BatchItem>) -> Vec<Result<ProcessResult>> {
        let futures = items.iter().map(|item| {
            self.submit(
                &item.runner,
                &item.command,
                item.cwd.as_deref(),
                item.env.as_ref(),
            )
        });
        join_all(futures).await
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop handing out permits. Waiting and future acquirers fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

impl Default for ProcessPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}
