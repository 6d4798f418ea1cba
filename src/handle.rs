//! `RunHandle`: the public, read-only, awaitable view of a `RunResult`.

use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use crate::error::CmdorcError;
use crate::run_result::{RunState, SharedRunResult};

/// An owned, point-in-time copy of a `RunResult`'s observable fields.
/// Returned by `RunHandle::wait` and passed to callbacks, since callbacks
/// and waiters must not hold the run's lock.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub command_name: String,
    pub trigger_event: Option<String>,
    pub state: RunState,
    pub success: Option<bool>,
    pub output: String,
    pub error: Option<String>,
    pub comment: Option<String>,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    pub duration: Option<Duration>,
    pub duration_str: String,
}

impl From<&crate::run_result::RunResult> for RunSnapshot {
    fn from(r: &crate::run_result::RunResult) -> Self {
        RunSnapshot {
            run_id: r.run_id,
            command_name: r.command_name.clone(),
            trigger_event: r.trigger_event.clone(),
            state: r.state,
            success: r.success,
            output: r.output.clone(),
            error: r.error.clone(),
            comment: r.comment.clone(),
            start_time: r.start_time,
            end_time: r.end_time,
            duration: r.duration,
            duration_str: r.duration_str(),
        }
    }
}

/// Read-only façade over a `RunResult`. Property accessors are
/// non-suspending; `wait` is the one operation that may suspend.
#[derive(Clone)]
pub struct RunHandle {
    shared: SharedRunResult,
}

impl RunHandle {
    pub(crate) fn new(shared: SharedRunResult) -> Self {
        RunHandle { shared }
    }

    fn snapshot(&self) -> RunSnapshot {
        let guard = self.shared.lock().expect("run result lock poisoned");
        RunSnapshot::from(&*guard)
    }

    pub fn run_id(&self) -> Uuid {
        self.shared.lock().expect("run result lock poisoned").run_id
    }

    pub fn command_name(&self) -> String {
        self.shared
            .lock()
            .expect("run result lock poisoned")
            .command_name
            .clone()
    }

    pub fn state(&self) -> RunState {
        self.shared.lock().expect("run result lock poisoned").state
    }

    pub fn success(&self) -> Option<bool> {
        self.shared
            .lock()
            .expect("run result lock poisoned")
            .success
    }

    pub fn output(&self) -> String {
        self.shared
            .lock()
            .expect("run result lock poisoned")
            .output
            .clone()
    }

    pub fn error(&self) -> Option<String> {
        self.shared
            .lock()
            .expect("run result lock poisoned")
            .error
            .clone()
    }

    pub fn comment(&self) -> Option<String> {
        self.shared
            .lock()
            .expect("run result lock poisoned")
            .comment
            .clone()
    }

    pub fn start_time(&self) -> Option<DateTime<Local>> {
        self.shared
            .lock()
            .expect("run result lock poisoned")
            .start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Local>> {
        self.shared
            .lock()
            .expect("run result lock poisoned")
            .end_time
    }

    pub fn duration_str(&self) -> String {
        self.shared
            .lock()
            .expect("run result lock poisoned")
            .duration_str()
    }

    pub fn is_finalized(&self) -> bool {
        self.shared
            .lock()
            .expect("run result lock poisoned")
            .is_finalized()
    }

    /// Suspend until the underlying run finalizes, then return a snapshot.
    /// Returns immediately if the run is already finalized. On timeout,
    /// fails with `CmdorcError::Timeout` without mutating the run.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<RunSnapshot, CmdorcError> {
        let mut receiver = {
            let guard = self.shared.lock().expect("run result lock poisoned");
            if guard.is_finalized() {
                return Ok(RunSnapshot::from(&*guard));
            }
            guard.subscribe()
        };

        let recv_fut = receiver.recv();
        match timeout {
            Some(d) => match tokio::time::timeout(d, recv_fut).await {
                Ok(_) => Ok(self.snapshot()),
                Err(_) => Err(CmdorcError::Timeout),
            },
            None => {
                let _ = recv_fut.await;
                Ok(self.snapshot())
            }
        }
    }
}
