//! Declarative workflow definitions.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::task::Task;
use crate::{slog_debug, Result};

/// A named, ordered list of tasks.
///
/// ```toml
/// name = "recon"
///
/// [[tasks]]
/// id = "discover"
/// tool = "nmap"
/// target = "10.0.0.0/24"
///
/// [[tasks]]
/// id = "vulns"
/// tool = "nuclei"
/// depends_on = ["discover"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tasks,
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        slog_debug!("Workflow::from_file path={}", path.display());
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Fill in `target` for every task that does not declare one.
    pub fn with_default_target(mut self, target: &str) -> Self {
        for task in &mut self.tasks {
            if task.target.is_none() {
                task.target = Some(target.to_string());
            }
        }
        self
    }
}
