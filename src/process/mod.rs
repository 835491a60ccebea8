//! External process execution: validation, streaming, timeouts and
//! process-tree cleanup.

pub mod kill;
pub mod runner;

pub use kill::terminate_tree;
pub use runner::{
    validate_command, OutputCallback, ProcessResult, ProcessRunner, DEFAULT_KILL_GRACE,
    DEFAULT_TIMEOUT_SECS,
};
