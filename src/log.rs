//! Leveled logging for the scanflow engine.
//!
//! Log levels:
//! - ERROR: A workflow could not run at all (invalid graph, bad config)
//! - WARN: A task failed, timed out, or had its process tree force-killed
//! - INFO: Workflow start/finish and layer dispatch
//! - DEBUG: Process spawn/exit, permit acquisition, registry lookups
//! - TRACE: Individual output lines from external tools
//!
//! Nothing is written until [`init`] is called, so library users and tests
//! stay silent. The level can be raised with `SCANFLOW_DEBUG=1` or set
//! explicitly with `SCANFLOW_LOG=<level>`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static SINK: OnceLock<Sink> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// Append to a file (truncated by [`init`]).
    File(PathBuf),
    Stderr,
}

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" | "critical" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Resolve the effective level from the configured one and the environment.
///
/// `SCANFLOW_LOG` wins over everything; `SCANFLOW_DEBUG=1` (or the `debug`
/// argument) raises the level to at least DEBUG.
pub fn effective_level(configured: LogLevel, debug: bool) -> LogLevel {
    if let Some(level) = std::env::var("SCANFLOW_LOG")
        .ok()
        .and_then(|v| v.parse::<LogLevel>().ok())
    {
        return level;
    }

    let env_debug = std::env::var("SCANFLOW_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    if debug || env_debug {
        configured.max(LogLevel::Debug)
    } else {
        configured
    }
}

/// Initialize logging with a sink and level.
///
/// Only the first call installs a sink; later calls just adjust the level.
pub fn init(sink: Sink, level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    if let Sink::File(path) = &sink {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        // Truncate file on startup
        let _ = std::fs::write(path, "");
    }
    SINK.set(sink).ok();
}

/// Default log file location: `~/.scanflow/scanflow.log`.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".scanflow").join("scanflow.log"))
}

/// Set the minimum log level for output.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current log level.
pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Log a message at the specified level.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }

    let Some(sink) = SINK.get() else {
        return;
    };

    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
    let line = format!("[{}] [{}] {}", timestamp, level.as_str(), msg);
    match sink {
        Sink::File(path) => {
            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(file, "{}", line);
            }
        }
        Sink::Stderr => eprintln!("{}", line),
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! slog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! slog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! slog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log macro for DEBUG level.
#[macro_export]
macro_rules! slog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// Log macro for TRACE level.
#[macro_export]
macro_rules! slog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
