//! `RunResult`: the mutable record of a single command execution.
//!
//! Mirrors `cmdorc.run_result.RunResult` / `RunState`. Owned exclusively by
//! the `CommandRuntime` (and, between `start_run` and finalization, by the
//! executor); `RunHandle` is a read-only façade over the same data.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A `RunResult` shared between the runtime, its executor, and any
/// `RunHandle`s observing it. Guarded by a plain `std::sync::Mutex`
/// because critical sections here are short field reads/writes that never
/// hold the lock across an `.await` point.
pub type SharedRunResult = Arc<Mutex<RunResult>>;

/// Closed sum type for a run's lifecycle. Validate all transitions;
/// unexpected transitions log and no-op rather than panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RunState {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_finalized(self) -> bool {
        matches!(self, RunState::Success | RunState::Failed | RunState::Cancelled)
    }

    /// The `command_<state>` suffix used for lifecycle event names.
    pub fn event_suffix(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

/// Snapshot of the fully interpolated shell string, cwd, env, timeout and
/// vars used for one run. Built once per run, immediately before executor
/// dispatch.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub command: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub vars: HashMap<String, String>,
}

/// A single execution attempt of a command.
pub struct RunResult {
    pub run_id: Uuid,
    pub command_name: String,
    pub trigger_event: Option<String>,
    pub trigger_chain: Vec<String>,
    pub state: RunState,
    pub success: Option<bool>,
    pub output: String,
    pub error: Option<String>,
    pub comment: Option<String>,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    pub duration: Option<Duration>,
    pub resolved: ResolvedCommand,
    completion: broadcast::Sender<()>,
}

impl RunResult {
    pub fn new(
        command_name: String,
        trigger_event: Option<String>,
        trigger_chain: Vec<String>,
        resolved: ResolvedCommand,
    ) -> Self {
        let (completion, _) = broadcast::channel(1);
        RunResult {
            run_id: Uuid::new_v4(),
            command_name,
            trigger_event,
            trigger_chain,
            state: RunState::Pending,
            success: None,
            output: String::new(),
            error: None,
            comment: None,
            start_time: None,
            end_time: None,
            duration: None,
            resolved,
            completion,
        }
    }

    /// Subscribe to the single-shot completion broadcast. Must be called
    /// while holding whatever lock serializes access to this `RunResult`,
    /// so that "already finalized" and "about to finalize" can't race a
    /// waiter into missing the signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.completion.subscribe()
    }

    pub fn is_finalized(&self) -> bool {
        self.state.is_finalized()
    }

    /// PENDING -> RUNNING. Idempotent warning if called from any other state.
    pub fn mark_running(&mut self) {
        if self.state != RunState::Pending {
            tracing::warn!(
                run_id = %self.run_id,
                command = %self.command_name,
                state = ?self.state,
                "mark_running called from non-pending state"
            );
        }
        self.state = RunState::Running;
        self.start_time = Some(Local::now());
    }

    /// RUNNING -> SUCCESS.
    pub fn mark_success(&mut self) {
        if self.state.is_finalized() {
            tracing::warn!(run_id = %self.run_id, "mark_success called on already-finalized run");
            return;
        }
        self.state = RunState::Success;
        self.success = Some(true);
        self.finalize();
    }

    /// RUNNING -> FAILED.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.state.is_finalized() {
            tracing::warn!(run_id = %self.run_id, "mark_failed called on already-finalized run");
            return;
        }
        self.state = RunState::Failed;
        self.success = Some(false);
        self.error = Some(error.into());
        self.finalize();
    }

    /// PENDING or RUNNING -> CANCELLED. No-op if already finalized, so a
    /// race with SUCCESS/FAILED leaves the earlier terminal state standing.
    pub fn mark_cancelled(&mut self, reason: Option<String>) {
        if self.state.is_finalized() {
            tracing::debug!(run_id = %self.run_id, "mark_cancelled on already-finalized run: no-op");
            return;
        }
        self.state = RunState::Cancelled;
        self.success = None;
        self.comment = reason.clone();
        self.error = Some(reason.unwrap_or_else(|| "command was cancelled".to_string()));
        self.finalize();
    }

    fn finalize(&mut self) {
        let end = Local::now();
        self.end_time = Some(end);
        self.duration = self
            .start_time
            .map(|start| (end - start).to_std().unwrap_or(Duration::ZERO));
        // Single-shot: a send with no receivers is not an error, and the
        // channel only ever carries one value.
        let _ = self.completion.send(());
    }

    /// A serializable, owned snapshot of the observable fields — the
    /// equivalent of handing a caller a plain dict of the run's state.
    pub fn to_summary(&self) -> crate::handle::RunSnapshot {
        crate::handle::RunSnapshot::from(self)
    }

    pub fn duration_str(&self) -> String {
        match self.duration {
            None => "—".to_string(),
            Some(d) => {
                let secs = d.as_secs_f64();
                if secs < 1.0 {
                    format!("{}ms", d.as_millis())
                } else if secs < 60.0 {
                    format!("{:.1}s", secs)
                } else if secs < 3600.0 {
                    format!("{}m {}s", (secs / 60.0) as u64, (secs % 60.0) as u64)
                } else {
                    format!("{}h {}m", (secs / 3600.0) as u64, ((secs % 3600.0) / 60.0) as u64)
                }
            }
        }
    }
}

/// Derived status of a command, computed on query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandState {
    NeverRun,
    Running,
    Success,
    Failed,
    Cancelled,
}

pub struct CommandStatus {
    pub state: CommandState,
    pub active_count: usize,
    pub last_run: Option<CommandStatusRun>,
}

/// A read-only snapshot of the most recent finalized `RunResult`, decoupled
/// from the result's lifetime so `CommandStatus` can be returned by value.
#[derive(Debug, Clone)]
pub struct CommandStatusRun {
    pub run_id: Uuid,
    pub state: RunState,
    pub success: Option<bool>,
    pub duration_str: String,
}

impl From<&RunResult> for CommandStatusRun {
    fn from(r: &RunResult) -> Self {
        CommandStatusRun {
            run_id: r.run_id,
            state: r.state,
            success: r.success,
            duration_str: r.duration_str(),
        }
    }
}
