//! The executor capability contract and its local-subprocess implementation.
//!
//! Mirrors `cmdorc.executor.Executor` / `LocalExecutor`: start/cancel/cleanup
//! against a live `RunResult`, with the local implementation launching a
//! real child process via the platform shell. Process-group signal delivery
//! follows the same SIGTERM-then-SIGKILL approach as a typical supervisor
//! threads, ported to `tokio::process` and `nix::sys::signal`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::Mutex as AsyncMutex;

use crate::run_result::{ResolvedCommand, SharedRunResult};

/// How long to wait after a soft-terminate before escalating to a hard kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Launches, monitors, and cancels the child process underlying a run.
///
/// Implementations must never panic for expected failures (nonzero exit,
/// timeout); those are reflected in the `RunResult` as FAILED. Only
/// unexpected failures (e.g. the shell itself couldn't be spawned) surface
/// as `CmdorcError::Executor`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Launch `resolved` on behalf of `result`. Must call `result.mark_running()`
    /// once work has actually started, and `mark_success`/`mark_failed` on
    /// completion. Returns immediately; the run proceeds in the background.
    async fn start_run(&self, result: SharedRunResult, resolved: ResolvedCommand);

    /// Cooperatively cancel the run behind `result`, escalating to a forced
    /// kill after a bounded grace period. Guarantees finalization before
    /// returning. Idempotent: a no-op on an already-finalized run.
    async fn cancel_run(&self, result: SharedRunResult, comment: Option<String>);

    /// Cancel all still-active work and release resources. Callable at most
    /// once per executor instance.
    async fn cleanup(&self);
}

struct ActiveProcess {
    cancel_tx: tokio::sync::oneshot::Sender<Option<String>>,
}

/// The default executor: runs the resolved command through the platform
/// shell (`sh -c` on Unix, `cmd /C` on Windows), merging stdout+stderr.
pub struct LocalSubprocessExecutor {
    grace_period: Duration,
    active: Arc<AsyncMutex<HashMap<uuid::Uuid, ActiveProcess>>>,
}

impl LocalSubprocessExecutor {
    pub fn new() -> Self {
        LocalSubprocessExecutor::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        LocalSubprocessExecutor {
            grace_period,
            active: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    fn build_command(resolved: &ResolvedCommand) -> TokioCommand {
        let mut cmd;
        #[cfg(unix)]
        {
            cmd = TokioCommand::new("sh");
            cmd.arg("-c").arg(&resolved.command);
        }
        #[cfg(not(unix))]
        {
            cmd = TokioCommand::new("cmd");
            cmd.arg("/C").arg(&resolved.command);
        }
        cmd.current_dir(&resolved.cwd);
        cmd.env_clear();
        cmd.envs(&resolved.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        cmd
    }
}

impl Default for LocalSubprocessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for LocalSubprocessExecutor {
    async fn start_run(&self, result: SharedRunResult, resolved: ResolvedCommand) {
        let mut cmd = Self::build_command(&resolved);
        let run_id = result.lock().expect("run result lock poisoned").run_id;
        let command_name = result
            .lock()
            .expect("run result lock poisoned")
            .command_name
            .clone();

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(run_id = %run_id, command = %command_name, error = %e, "failed to spawn process");
                result
                    .lock()
                    .expect("run result lock poisoned")
                    .mark_failed(format!("failed to spawn process: {}", e));
                return;
            }
        };

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        self.active.lock().await.insert(run_id, ActiveProcess { cancel_tx });

        {
            let mut guard = result.lock().expect("run result lock poisoned");
            guard.mark_running();
        }

        let active = self.active.clone();
        let grace_period = self.grace_period;
        let timeout = resolved.timeout;

        tokio::spawn(async move {
            supervise(child, result, cancel_rx, timeout, grace_period).await;
            active.lock().await.remove(&run_id);
        });
    }

    async fn cancel_run(&self, result: SharedRunResult, comment: Option<String>) {
        let run_id = result.lock().expect("run result lock poisoned").run_id;
        let entry = self.active.lock().await.remove(&run_id);
        match entry {
            Some(active) => {
                let _ = active.cancel_tx.send(comment);
            }
            None => {
                // Already finalized, or never started: mark_cancelled is a
                // no-op on a finalized run, which is exactly what we want.
                result
                    .lock()
                    .expect("run result lock poisoned")
                    .mark_cancelled(comment);
            }
        }
    }

    async fn cleanup(&self) {
        let mut active = self.active.lock().await;
        for (_, proc) in active.drain() {
            let _ = proc.cancel_tx.send(Some("executor shutting down".to_string()));
        }
    }
}

async fn supervise(
    mut child: tokio::process::Child,
    result: SharedRunResult,
    mut cancel_rx: tokio::sync::oneshot::Receiver<Option<String>>,
    timeout: Option<Duration>,
    grace_period: Duration,
) {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let output = Arc::new(AsyncMutex::new(String::new()));

    let out_task = stdout.take().map(|s| tokio::spawn(drain(s, output.clone())));
    let err_task = stderr.take().map(|s| tokio::spawn(drain(s, output.clone())));

    let mut wait_fut = Box::pin(child.wait());

    enum Outcome {
        Exited(std::io::Result<std::process::ExitStatus>),
        Cancelled(Option<String>),
        TimedOut,
    }

    let outcome = match timeout {
        Some(d) => tokio::select! {
            status = &mut wait_fut => Outcome::Exited(status),
            reason = &mut cancel_rx => Outcome::Cancelled(reason.unwrap_or(None)),
            _ = tokio::time::sleep(d) => Outcome::TimedOut,
        },
        None => tokio::select! {
            status = &mut wait_fut => Outcome::Exited(status),
            reason = &mut cancel_rx => Outcome::Cancelled(reason.unwrap_or(None)),
        },
    };
    drop(wait_fut);

    match outcome {
        Outcome::Exited(status) => {
            if let Some(t) = out_task {
                let _ = t.await;
            }
            if let Some(t) = err_task {
                let _ = t.await;
            }
            let captured = output.lock().await.clone();
            let mut guard = result.lock().expect("run result lock poisoned");
            guard.output = captured;
            match status {
                Ok(s) if s.success() => guard.mark_success(),
                Ok(s) => guard.mark_failed(format!("exited with status {}", s)),
                Err(e) => guard.mark_failed(format!("failed to wait on process: {}", e)),
            }
        }
        Outcome::TimedOut => {
            terminate(&mut child, grace_period).await;
            if let Some(t) = out_task {
                let _ = t.await;
            }
            if let Some(t) = err_task {
                let _ = t.await;
            }
            let captured = output.lock().await.clone();
            let mut guard = result.lock().expect("run result lock poisoned");
            guard.output = captured;
            guard.mark_failed(format!("timeout after {:?}", timeout.unwrap_or_default()));
        }
        Outcome::Cancelled(reason) => {
            terminate(&mut child, grace_period).await;
            if let Some(t) = out_task {
                let _ = t.await;
            }
            if let Some(t) = err_task {
                let _ = t.await;
            }
            let captured = output.lock().await.clone();
            let mut guard = result.lock().expect("run result lock poisoned");
            guard.output = captured;
            guard.mark_cancelled(reason);
        }
    }
}

async fn drain(mut stream: impl tokio::io::AsyncRead + Unpin, sink: Arc<AsyncMutex<String>>) {
    let mut reader = BufReader::new(&mut stream);
    let mut buf = Vec::new();
    if reader.read_to_end(&mut buf).await.is_ok() {
        let text = String::from_utf8_lossy(&buf).into_owned();
        sink.lock().await.push_str(&text);
    }
}

/// Soft-terminate, wait up to `grace_period`, then hard-kill. Always awaits
/// exit so the process is reaped before the caller proceeds.
async fn terminate(child: &mut tokio::process::Child, grace_period: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pgid = nix::unistd::Pid::from_raw(pid as i32);
            let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    let graced = tokio::time::timeout(grace_period, child.wait()).await;
    if graced.is_err() {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let pgid = nix::unistd::Pid::from_raw(pid as i32);
                let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
        let _ = child.wait().await;
    }
}
