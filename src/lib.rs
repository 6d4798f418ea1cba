//! An event-driven workflow engine for orchestrating shell commands.
//!
//! Users declare named commands bound to a shell template and a list of
//! *trigger* strings. Firing a trigger dispatches every subscribed command;
//! a command's own lifecycle (started / success / failed / cancelled) emits
//! further triggers that chain into downstream commands. The engine enforces
//! per-command concurrency limits and retrigger policies, supports
//! cancellation and timeouts, keeps bounded history, and exposes a
//! handle/callback API for observing runs.
//!
//! See [`CommandRuntime`] for the orchestrator, [`CommandConfig`] for
//! declaring a command, and [`RunHandle`] for awaiting a run's outcome.

mod callback;
mod config;
mod config_load;
mod error;
mod executor;
mod handle;
mod policy;
mod run_result;
mod runtime;
mod template;
mod trigger;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use callback::{Callback, CallbackContext, CallbackId};
pub use config::{CommandConfig, CommandConfigBuilder, OnRetrigger, RunnerConfig};
pub use config_load::{load_config_file, load_config_str};
pub use error::{CmdorcError, Result, TemplateError};
pub use executor::{Executor, LocalSubprocessExecutor, DEFAULT_GRACE_PERIOD};
pub use handle::{RunHandle, RunSnapshot};
pub use run_result::{CommandState, CommandStatus, CommandStatusRun, ResolvedCommand, RunState};
pub use runtime::CommandRuntime;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn runtime(commands: Vec<CommandConfig>) -> CommandRuntime {
        CommandRuntime::new(RunnerConfig::new(commands).unwrap())
    }

    async fn drain(rt: &CommandRuntime, name: &str, expected: usize, timeout: Duration) -> Vec<RunSnapshot> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let history = rt.get_history(name, None).await.unwrap();
            if history.len() >= expected {
                return history;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {} history to reach {}", name, expected);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn single_echo_scenario() {
        let echo = CommandConfig::builder("Echo", "echo hello")
            .trigger("go")
            .build()
            .unwrap();
        let rt = runtime(vec![echo]);
        rt.trigger("go").await.unwrap();

        let history = drain(&rt, "Echo", 1, Duration::from_secs(5)).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, RunState::Success);
        assert!(history[0].output.contains("hello"));
    }

    #[tokio::test]
    async fn diamond_scenario_runs_each_command_once() {
        let build = CommandConfig::builder("Build", "echo build")
            .trigger("build")
            .build()
            .unwrap();
        let test = CommandConfig::builder("Test", "echo test")
            .trigger("command_success:Build")
            .build()
            .unwrap();
        let lint = CommandConfig::builder("Lint", "echo lint")
            .trigger("command_success:Build")
            .build()
            .unwrap();
        let report = CommandConfig::builder("Report", "echo report")
            .trigger("command_success:Test")
            .trigger("command_success:Lint")
            .build()
            .unwrap();

        let rt = runtime(vec![build, test, lint, report]);
        rt.trigger("build").await.unwrap();

        drain(&rt, "Build", 1, Duration::from_secs(5)).await;
        drain(&rt, "Test", 1, Duration::from_secs(5)).await;
        drain(&rt, "Lint", 1, Duration::from_secs(5)).await;
        let report_history = drain(&rt, "Report", 1, Duration::from_secs(5)).await;
        assert_eq!(report_history.len(), 1);
        assert!(matches!(
            report_history[0].trigger_event.as_deref(),
            Some("command_success:Test") | Some("command_success:Lint")
        ));
    }

    #[tokio::test]
    async fn cancel_and_restart_race() {
        let sleepy = CommandConfig::builder("Sleepy", "sleep 1")
            .trigger("start")
            .max_concurrent(1)
            .on_retrigger(OnRetrigger::CancelAndRestart)
            .keep_history(10)
            .build()
            .unwrap();
        let rt = runtime(vec![sleepy]);

        rt.trigger("start").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        rt.trigger("start").await.unwrap();

        let history = drain(&rt, "Sleepy", 2, Duration::from_secs(5)).await;
        assert_eq!(history.len(), 2);
        // newest-first: the replacement run finalizes later than the
        // incumbent it cancelled, so it sorts first.
        assert_eq!(history[0].state, RunState::Success);
        assert_eq!(history[1].state, RunState::Cancelled);
    }

    #[tokio::test]
    async fn ignore_retrigger_rejects_second_call() {
        let sleepy = CommandConfig::builder("Sleepy", "sleep 1")
            .trigger("start")
            .max_concurrent(1)
            .on_retrigger(OnRetrigger::Ignore)
            .build()
            .unwrap();
        let rt = runtime(vec![sleepy]);

        let first = rt.run_command("Sleepy", None, None).await;
        assert!(first.is_ok());
        let second = rt.run_command("Sleepy", None, None).await;
        assert!(matches!(second, Err(CmdorcError::ConcurrencyLimit(_))));

        let history = drain(&rt, "Sleepy", 1, Duration::from_secs(5)).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, RunState::Success);
    }

    #[tokio::test]
    async fn callbacks_observe_dispatched_events() {
        let echo = CommandConfig::builder("Echo", "echo hi").trigger("go").build().unwrap();
        let rt = runtime(vec![echo]);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        rt.on_event(
            "command_success:*",
            Arc::new(move |_snap, _ctx| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

        rt.trigger("go").await.unwrap();
        drain(&rt, "Echo", 1, Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let echo = CommandConfig::builder("Echo", "echo hi").trigger("go").build().unwrap();
        let rt = runtime(vec![echo]);
        rt.shutdown(Duration::from_secs(1), true).await;
        rt.shutdown(Duration::from_secs(1), true).await;

        let err = rt.trigger("go").await.unwrap_err();
        assert!(matches!(err, CmdorcError::OrchestratorShutdown));
    }
}
