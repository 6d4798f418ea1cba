//! Error hierarchy for cmdorc.
//!
//! Mirrors `cmdorc.exceptions` from the Python original: one base type
//! callers can match on or catch generically, with a variant per
//! distinguished error kind.

use thiserror::Error;

/// Errors the core of cmdorc can surface.
///
/// Per-run failures (nonzero exit, process timeout) are never represented
/// here — those live in `RunResult::error` instead. This enum is only for
/// errors that propagate synchronously back to a caller.
#[derive(Error, Debug)]
pub enum CmdorcError {
    /// Raised at `CommandConfig`/`RunnerConfig` construction time.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// An operation referenced a command name that isn't registered.
    #[error("command '{0}' not found")]
    CommandNotFound(String),

    /// `ConcurrencyPolicy` disallowed the run under `on_retrigger = ignore`.
    #[error("command '{0}' is already running and on_retrigger is 'ignore'")]
    ConcurrencyLimit(String),

    /// A new run was requested inside the command's debounce window.
    #[error(
        "command '{command}' is debounced (elapsed: {elapsed_ms:.1}ms, required: {required_ms}ms)"
    )]
    Debounce {
        command: String,
        elapsed_ms: f64,
        required_ms: u64,
    },

    /// A trigger cycle was detected for a command with `loop_detection = true`.
    #[error("trigger cycle detected: {}", cycle_display(.cycle_path, .event))]
    TriggerCycle {
        event: String,
        cycle_path: Vec<String>,
    },

    /// Variable template resolution failed (missing var, cycle, or too deep).
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// The executor could not perform its job (e.g. couldn't spawn a process).
    #[error("executor error: {0}")]
    Executor(String),

    /// An operation was attempted after `CommandRuntime::shutdown` completed.
    #[error("orchestrator has been shut down")]
    OrchestratorShutdown,

    /// `RunHandle::wait` exceeded its timeout.
    #[error("timed out waiting for run to finish")]
    Timeout,
}

fn cycle_display(cycle_path: &[String], event: &str) -> String {
    let recent: Vec<&str> = cycle_path
        .iter()
        .rev()
        .take(8)
        .rev()
        .map(String::as_str)
        .collect();
    format!("{} -> {}", recent.join(" -> "), event)
}

/// Errors from resolving `{{ name }}` template variables.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("missing template variable '{0}'")]
    MissingVar(String),

    #[error("template variable '{0}' is self-referential or cyclic")]
    Cyclic(String),

    #[error("template expansion exceeded max nesting depth ({0})")]
    TooDeep(usize),
}

pub type Result<T> = std::result::Result<T, CmdorcError>;
