//! An in-memory `Executor` for tests, so exercising triggers, concurrency
//! policy, and cancellation doesn't depend on real subprocess timing.
//!
//! Exposed whenever this crate builds its own tests, and behind the
//! `testing` feature for external integration tests that want the same
//! double — the Rust analogue of the original's mention of "a mock (for
//! tests)" alongside the real executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::executor::Executor;
use crate::run_result::{ResolvedCommand, SharedRunResult};

/// Canned outcome for a `MockExecutor::start_run` call, keyed by command
/// name via `MockExecutor::set_outcome`.
#[derive(Clone)]
pub enum MockOutcome {
    Success,
    Failure(String),
    /// Never finalizes on its own; only `cancel_run` ends it. Useful for
    /// deterministically exercising cancellation and timeout paths without
    /// racing a real process's wall-clock.
    Hangs,
}

struct Pending {
    cancel_tx: tokio::sync::oneshot::Sender<Option<String>>,
}

/// Runs no real process: every `start_run` resolves according to the
/// outcome configured for that command name (`Success` if unconfigured),
/// after `delay` (or immediately once `resolved.timeout` is shorter).
pub struct MockExecutor {
    outcomes: HashMap<String, MockOutcome>,
    delay: Duration,
    pending: Arc<AsyncMutex<HashMap<Uuid, Pending>>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        MockExecutor {
            outcomes: HashMap::new(),
            delay: Duration::from_millis(10),
            pending: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    /// How long a run takes to settle once started, absent a shorter
    /// `timeout_secs` on the command itself. Default 10ms.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_outcome(mut self, command_name: impl Into<String>, outcome: MockOutcome) -> Self {
        self.outcomes.insert(command_name.into(), outcome);
        self
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn start_run(&self, result: SharedRunResult, resolved: ResolvedCommand) {
        let (run_id, name) = {
            let mut guard = result.lock().expect("run result lock poisoned");
            guard.mark_running();
            (guard.run_id, guard.command_name.clone())
        };

        let outcome = self.outcomes.get(&name).cloned().unwrap_or(MockOutcome::Success);

        // `Hangs` never settles on its own, so only an explicit command
        // timeout can end it; other outcomes settle after `self.delay`
        // unless a shorter command timeout preempts that.
        let natural_delay = if matches!(outcome, MockOutcome::Hangs) {
            None
        } else {
            Some(self.delay)
        };
        let wait = match (resolved.timeout, natural_delay) {
            (Some(t), Some(d)) => Some((t.min(d), t < d)),
            (Some(t), None) => Some((t, true)),
            (None, Some(d)) => Some((d, false)),
            (None, None) => None,
        };

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        self.pending.lock().await.insert(run_id, Pending { cancel_tx });
        let pending = self.pending.clone();

        tokio::spawn(async move {
            finish_run(result, outcome, wait, cancel_rx).await;
            pending.lock().await.remove(&run_id);
        });
    }

    async fn cancel_run(&self, result: SharedRunResult, comment: Option<String>) {
        let run_id = result.lock().expect("run result lock poisoned").run_id;
        match self.pending.lock().await.remove(&run_id) {
            Some(p) => {
                let _ = p.cancel_tx.send(comment);
            }
            None => {
                result.lock().expect("run result lock poisoned").mark_cancelled(comment);
            }
        }
    }

    async fn cleanup(&self) {
        let mut pending = self.pending.lock().await;
        for (_, p) in pending.drain() {
            let _ = p.cancel_tx.send(Some("executor shutting down".to_string()));
        }
    }
}

async fn finish_run(
    result: SharedRunResult,
    outcome: MockOutcome,
    wait: Option<(Duration, bool)>,
    mut cancel_rx: tokio::sync::oneshot::Receiver<Option<String>>,
) {
    let Some((settle_after, timed_out)) = wait else {
        // No natural delay and no command timeout: only cancellation ends it.
        let reason = cancel_rx.await.ok().flatten();
        result.lock().expect("run result lock poisoned").mark_cancelled(reason);
        return;
    };

    tokio::select! {
        _ = tokio::time::sleep(settle_after) => {
            let mut guard = result.lock().expect("run result lock poisoned");
            if timed_out {
                guard.mark_failed(format!("timeout after {:?}", settle_after));
            } else {
                match outcome {
                    MockOutcome::Success => guard.mark_success(),
                    MockOutcome::Failure(msg) => guard.mark_failed(msg),
                    MockOutcome::Hangs => unreachable!(),
                }
            }
        }
        reason = &mut cancel_rx => {
            result.lock().expect("run result lock poisoned").mark_cancelled(reason.ok().flatten());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandConfig, RunnerConfig};
    use crate::runtime::CommandRuntime;
    use std::sync::Arc;

    fn runner_with(cfg: Vec<CommandConfig>, executor: MockExecutor) -> CommandRuntime {
        CommandRuntime::with_executor(RunnerConfig::new(cfg).unwrap(), Arc::new(executor))
    }

    #[tokio::test]
    async fn mock_success_does_not_spawn_a_process() {
        let cmd = CommandConfig::builder("Quick", "this is not a real shell command")
            .trigger("go")
            .build()
            .unwrap();
        let rt = runner_with(vec![cmd], MockExecutor::new().with_delay(Duration::from_millis(5)));
        rt.run_command("Quick", None, None).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if !rt.get_history("Quick", None).await.unwrap().is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "mock run never finalized");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let history = rt.get_history("Quick", None).await.unwrap();
        assert_eq!(history[0].state, crate::run_result::RunState::Success);
    }

    #[tokio::test]
    async fn mock_failure_outcome_is_reported() {
        let cmd = CommandConfig::builder("Boom", "unused")
            .trigger("go")
            .build()
            .unwrap();
        let rt = runner_with(
            vec![cmd],
            MockExecutor::new()
                .with_delay(Duration::from_millis(5))
                .set_outcome("Boom", MockOutcome::Failure("synthetic failure".to_string())),
        );
        let handle = rt.run_command("Boom", None, None).await.unwrap();
        let snap = handle.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(snap.state, crate::run_result::RunState::Failed);
        assert_eq!(snap.error.as_deref(), Some("synthetic failure"));
    }

    #[tokio::test]
    async fn mock_hangs_until_cancelled() {
        let cmd = CommandConfig::builder("Stuck", "unused")
            .trigger("go")
            .build()
            .unwrap();
        let rt = runner_with(vec![cmd], MockExecutor::new().set_outcome("Stuck", MockOutcome::Hangs));
        let handle = rt.run_command("Stuck", None, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finalized());

        rt.cancel_run("Stuck", handle.run_id(), Some("test cancel".to_string()))
            .await
            .unwrap();
        let snap = handle.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(snap.state, crate::run_result::RunState::Cancelled);
    }

    #[tokio::test]
    async fn mock_respects_command_timeout() {
        let mut cmd = CommandConfig::builder("SlowButCapped", "unused")
            .trigger("go")
            .build()
            .unwrap();
        cmd.timeout = Some(Duration::from_millis(5));

        let rt = runner_with(vec![cmd], MockExecutor::new().set_outcome("SlowButCapped", MockOutcome::Hangs));
        let handle = rt.run_command("SlowButCapped", None, None).await.unwrap();
        let snap = handle.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(snap.state, crate::run_result::RunState::Failed);
        assert!(snap.error.as_ref().unwrap().contains("timeout"));
    }
}
