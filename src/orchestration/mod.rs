//! Orchestration layer: bounded process pool, layered workflow execution,
//! run outcomes and the tool adapter registry.

pub mod outcome;
pub mod pool;
pub mod registry;
pub mod scheduler;

pub use outcome::{ExecutionOutcome, TaskReport, WorkflowStats};
pub use pool::{BatchItem, ProcessPool, DEFAULT_MAX_CONCURRENT};
pub use registry::{CommandAdapter, RegistryExecutor, ToolAdapter, ToolInfo, ToolRegistry};
pub use scheduler::{FailurePolicy, FnExecutor, SchedulerEvent, TaskExecutor, WorkflowExecutor};
