//! Workflow execution engine for security tooling.
//!
//! A workflow is a set of tasks with dependencies. The engine orders them
//! into topological layers, runs each layer concurrently under a bounded
//! process pool, and supervises every external tool process so that a
//! timeout or cancellation never leaves a process tree behind.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod process;

pub use config::{EngineConfig, ToolSettings};
pub use crate::core::{Task, TaskGraph, TaskNode, TaskStatus, Workflow};
pub use engine::Engine;
pub use error::{Error, Result};
pub use orchestration::{ExecutionOutcome, FailurePolicy, ProcessPool, ToolAdapter};
pub use process::{ProcessResult, ProcessRunner};
