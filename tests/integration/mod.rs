//! Integration test suite for scanflow.
//!
//! These tests drive whole workflows through the public API and check
//! that graph layering, layered execution, the process pool and the
//! process runner work together.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full workflow execution and failure policies
//! - `concurrency`: Process pool bounds under concurrent load
//! - `process_cleanup`: Timeout and cancellation leave no processes behind
//!
//! # CI Compatibility
//!
//! Tests that spawn processes only use coreutils (`echo`, `sleep`, `sh`)
//! and are compiled on unix only. Process-tree inspection uses `/proc` and
//! is limited to Linux.

mod fixtures;

mod process_cleanup;
mod workflow_e2e;
