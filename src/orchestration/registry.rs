//! Tool adapters and the registry that maps tool names to them.
//!
//! An adapter knows how to turn a task into an argument vector and how to
//! turn the tool's raw output into a structured payload. Adapters are
//! registered explicitly and looked up by exact tool name.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, ToolSettings};
use crate::core::{Task, TaskOptions};
use crate::error::{Error, Result};
use crate::orchestration::scheduler::TaskExecutor;
use crate::process::{ProcessRunner, DEFAULT_KILL_GRACE, DEFAULT_TIMEOUT_SECS};
use crate::{slog_debug, slog_warn};

/// Knows how to drive one external tool.
pub trait ToolAdapter: Send + Sync {
    /// Registry key, matched exactly against `Task::tool`.
    fn name(&self) -> &str;

    /// Free-form grouping such as "recon", "scanner" or "fuzzer".
    fn category(&self) -> &str;

    /// Binaries of which at least one must be on PATH.
    fn required_binaries(&self) -> Vec<String>;

    fn build_command(&self, target: Option<&str>, options: &TaskOptions) -> Result<Vec<String>>;

    fn parse_output(&self, raw: &str, format: &str) -> Result<Value>;

    fn output_format(&self) -> &str {
        "text"
    }

    fn description(&self) -> String {
        format!("{} adapter", self.name())
    }
}

/// Metadata about a registered adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub category: String,
    pub description: String,
    pub required_binaries: Vec<String>,
    pub output_format: String,
}

/// Explicitly populated map from tool name to adapter.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    adapters: BTreeMap<String, Arc<dyn ToolAdapter>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter. Names must be unique.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) -> Result<()> {
        let name = adapter.name().to_string();
        if self.adapters.contains_key(&name) {
            return Err(Error::Config(format!(
                "Tool adapter already registered: {}",
                name
            )));
        }
        slog_debug!("ToolRegistry: registered {} ({})", name, adapter.category());
        self.adapters.insert(name, adapter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ToolAdapter>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered tool names, sorted, optionally limited to one category.
    pub fn list(&self, category: Option<&str>) -> Vec<&str> {
        self.adapters
            .values()
            .filter(|adapter| category.map_or(true, |c| adapter.category() == c))
            .map(|adapter| adapter.name())
            .collect()
    }

    pub fn tool_info(&self, name: &str) -> Option<ToolInfo> {
        self.adapters.get(name).map(|adapter| ToolInfo {
            name: adapter.name().to_string(),
            category: adapter.category().to_string(),
            description: adapter.description(),
            required_binaries: adapter.required_binaries(),
            output_format: adapter.output_format().to_string(),
        })
    }

    /// Availability of every registered tool.
    ///
    /// A tool is available when any one of its required binaries resolves
    /// on PATH. Tools that need no binary are always available.
    pub fn validate_dependencies(&self) -> BTreeMap<String, bool> {
        self.adapters
            .iter()
            .map(|(name, adapter)| {
                let binaries = adapter.required_binaries();
                let available =
                    binaries.is_empty() || binaries.iter().any(|bin| which::which(bin).is_ok());
                (name.clone(), available)
            })
            .collect()
    }

    /// Like [`validate_dependencies`](Self::validate_dependencies), but fails
    /// when any tool is unavailable.
    pub fn require_all(&self) -> Result<BTreeMap<String, bool>> {
        let availability = self.validate_dependencies();
        let missing: Vec<String> = availability
            .iter()
            .filter(|(_, available)| !**available)
            .map(|(name, _)| name.clone())
            .collect();
        if !missing.is_empty() {
            slog_warn!("Missing tool binaries: {:?}", missing);
            return Err(Error::DependencyMissing(missing));
        }
        Ok(availability)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list(None))
            .finish()
    }
}

/// [`TaskExecutor`] that resolves each task through a [`ToolRegistry`].
///
/// For every task: look up the adapter, build the command, run it with the
/// tool's timeout, then parse stdout into the task payload.
pub struct RegistryExecutor {
    registry: Arc<ToolRegistry>,
    tools: BTreeMap<String, ToolSettings>,
    timeout: Duration,
    kill_grace: Duration,
}

impl RegistryExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            tools: BTreeMap::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Take timeouts and per-tool settings from the engine config.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.tools = config.tools.clone();
        self.timeout = config.task_timeout();
        self.kill_grace = config.kill_grace();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn timeout_for(&self, tool: &str) -> Duration {
        self.tools
            .get(tool)
            .and_then(|settings| settings.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.timeout)
    }
}

#[async_trait]
impl TaskExecutor for RegistryExecutor {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<Value> {
        let adapter = self.registry.get(&task.tool)?;
        let mut command = adapter.build_command(task.target.as_deref(), &task.options)?;
        if let Some(binary) = self.tools.get(&task.tool).and_then(|s| s.binary.as_ref()) {
            if let Some(program) = command.first_mut() {
                *program = binary.clone();
            }
        }

        let runner = ProcessRunner::new(adapter.name())
            .with_timeout(self.timeout_for(&task.tool))
            .with_kill_grace(self.kill_grace);
        let result = runner.run_with_cancel(&command, None, None, cancel).await?;
        adapter.parse_output(&result.stdout, adapter.output_format())
    }

    fn should_run(&self, task: &Task) -> bool {
        self.tools
            .get(&task.tool)
            .map_or(true, |settings| settings.enabled)
    }
}

/// Generic adapter that runs an argv taken from the task options.
///
/// ```toml
/// [[tasks]]
/// id = "ping"
/// tool = "command"
/// target = "10.0.0.1"
/// options = { program = "ping", args = ["-c", "1", "{target}"] }
/// ```
///
/// An argument equal to `{target}` is replaced by the task target.
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    name: String,
    format: String,
}

impl CommandAdapter {
    pub const PLACEHOLDER: &'static str = "{target}";

    pub fn new() -> Self {
        Self::named("command")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: "text".to_string(),
        }
    }

    /// Parse stdout as `"text"` (default) or `"json"`.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }
}

impl Default for CommandAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolAdapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        "utility"
    }

    fn required_binaries(&self) -> Vec<String> {
        Vec::new()
    }

    fn build_command(&self, target: Option<&str>, options: &TaskOptions) -> Result<Vec<String>> {
        let program = options
            .get("program")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::CommandValidation(format!("{} needs a string 'program' option", self.name))
            })?;

        let mut command = vec![program.to_string()];
        let args = match options.get("args") {
            None => Vec::new(),
            Some(Value::Array(args)) => args.clone(),
            Some(other) => {
                return Err(Error::CommandValidation(format!(
                    "'args' must be a list, got {}",
                    other
                )))
            }
        };

        for arg in args {
            let arg = match arg {
                Value::String(s) => s,
                other => other.to_string(),
            };
            if arg == Self::PLACEHOLDER {
                let target = target.ok_or_else(|| {
                    Error::CommandValidation(format!("{} requires a target", self.name))
                })?;
                command.push(target.to_string());
            } else {
                command.push(arg);
            }
        }
        Ok(command)
    }

    fn parse_output(&self, raw: &str, format: &str) -> Result<Value> {
        match format {
            "text" => Ok(json!({
                "stdout": raw,
                "lines": raw.lines().count(),
            })),
            "json" => serde_json::from_str(raw).map_err(|e| Error::OutputParse {
                tool: self.name.clone(),
                format: format.to_string(),
                reason: e.to_string(),
            }),
            other => Err(Error::OutputParse {
                tool: self.name.clone(),
                format: other.to_string(),
                reason: "unsupported format".to_string(),
            }),
        }
    }

    fn output_format(&self) -> &str {
        &self.format
    }

    fn description(&self) -> String {
        "Runs the argv given in the task options".to_string()
    }
}
