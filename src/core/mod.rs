//! Core domain models: tasks, workflow definitions and the execution DAG.

pub mod dag;
pub mod task;
pub mod workflow;

pub use dag::{TaskGraph, WorkflowStats};
pub use task::{Task, TaskNode, TaskOptions, TaskStatus};
pub use workflow::Workflow;
