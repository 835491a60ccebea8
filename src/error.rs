use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessResult;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workflow validation failed: {reason}")]
    GraphValidation { reason: String },

    #[error("Command rejected: {0}")]
    CommandValidation(String),

    #[error("Tool '{tool}' timed out after {timeout:?}")]
    Timeout {
        tool: String,
        timeout: Duration,
        /// Output collected before the process tree was killed.
        partial: Box<ProcessResult>,
    },

    #[error("Tool '{tool}' failed with exit code {exit_code}: {stderr}")]
    Execution {
        tool: String,
        command: Vec<String>,
        exit_code: i32,
        stderr: String,
    },

    #[error("Tool '{tool}' was cancelled")]
    Cancelled { tool: String },

    #[error("No adapter registered for tool: {0}")]
    ToolNotFound(String),

    #[error("Required binaries not found: {}", .0.join(", "))]
    DependencyMissing(Vec<String>),

    #[error("Cannot parse {format} output of '{tool}': {reason}")]
    OutputParse {
        tool: String,
        format: String,
        reason: String,
    },

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Shorthand for a graph validation failure.
    pub fn validation(reason: impl Into<String>) -> Self {
        Error::GraphValidation {
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::GraphValidation { .. } | Error::CommandValidation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
