//! `CommandRuntime`: the orchestrator façade.
//!
//! Owns configs, the callback registry, the trigger engine, the executor,
//! live runs and history. Mirrors `cmdorc.command_runner.CommandRunner`,
//! Runtime state lives behind one
//! `tokio::sync::Mutex`, satisfying "serialize access via a single mutex or
//! single-writer actor" without needing a separate actor task. Mutually
//! recursive dispatch (`start_run_internal` <-> `dispatch_event`) is
//! expressed with `#[async_recursion]`, bounded by `max_chain_length`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_recursion::async_recursion;
use chrono::Local;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::callback::{Callback, CallbackId, CallbackRegistry};
use crate::config::{CommandConfig, RunnerConfig};
use crate::error::{CmdorcError, Result};
use crate::executor::{Executor, LocalSubprocessExecutor};
use crate::handle::{RunHandle, RunSnapshot};
use crate::policy;
use crate::run_result::{CommandState, CommandStatus, CommandStatusRun, RunResult, RunState, SharedRunResult};
use crate::template::resolve_command;
use crate::trigger::TriggerEngine;

struct Inner {
    configs: HashMap<String, CommandConfig>,
    global_vars: HashMap<String, String>,
    base_dir: PathBuf,
    trigger_engine: TriggerEngine,
    callbacks: CallbackRegistry,
    active_runs: HashMap<String, Vec<SharedRunResult>>,
    history: HashMap<String, VecDeque<SharedRunResult>>,
    last_finalized_end: HashMap<String, chrono::DateTime<Local>>,
    shut_down: bool,
}

/// The orchestrator. Cheaply `Clone`-able; clones share the same underlying
/// state and executor.
#[derive(Clone)]
pub struct CommandRuntime {
    inner: Arc<AsyncMutex<Inner>>,
    executor: Arc<dyn Executor>,
}

impl CommandRuntime {
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_executor(config, Arc::new(LocalSubprocessExecutor::new()))
    }

    pub fn with_executor(config: RunnerConfig, executor: Arc<dyn Executor>) -> Self {
        let trigger_engine = TriggerEngine::new(&config.commands, config.max_chain_length);
        let mut configs = HashMap::new();
        let mut active_runs = HashMap::new();
        let mut history = HashMap::new();
        for cmd in config.commands {
            active_runs.insert(cmd.name.clone(), Vec::new());
            history.insert(cmd.name.clone(), VecDeque::new());
            configs.insert(cmd.name.clone(), cmd);
        }

        let inner = Inner {
            configs,
            global_vars: config.vars,
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            trigger_engine,
            callbacks: CallbackRegistry::new(),
            active_runs,
            history,
            last_finalized_end: HashMap::new(),
            shut_down: false,
        };

        CommandRuntime {
            inner: Arc::new(AsyncMutex::new(inner)),
            executor,
        }
    }

    pub async fn with_base_dir(self, base_dir: PathBuf) -> Self {
        self.inner.lock().await.base_dir = base_dir;
        self
    }

    pub async fn add_command(&self, cfg: CommandConfig) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            return Err(CmdorcError::OrchestratorShutdown);
        }
        if inner.configs.contains_key(&cfg.name) {
            return Err(CmdorcError::ConfigInvalid(format!(
                "duplicate command name '{}'",
                cfg.name
            )));
        }
        inner.trigger_engine.add_command(&cfg);
        inner.active_runs.insert(cfg.name.clone(), Vec::new());
        inner.history.insert(cfg.name.clone(), VecDeque::new());
        inner.configs.insert(cfg.name.clone(), cfg);
        Ok(())
    }

    pub async fn list_commands(&self) -> Vec<String> {
        self.inner.lock().await.configs.keys().cloned().collect()
    }

    /// Directly start a run of `name`, outside of any trigger dispatch
    /// (empty causal chain).
    pub async fn run_command(
        &self,
        name: &str,
        vars: Option<HashMap<String, String>>,
        trigger_event: Option<String>,
    ) -> Result<RunHandle> {
        self.start_run_internal(name, trigger_event, vec![], vars.unwrap_or_default())
            .await
    }

    /// Dispatch `event` through the trigger engine: cancels, starts, and
    /// callbacks fire. Does not itself return a handle.
    pub async fn trigger(&self, event: &str) -> Result<()> {
        if self.inner.lock().await.shut_down {
            return Err(CmdorcError::OrchestratorShutdown);
        }
        self.dispatch_event(event.to_string(), vec![], None, None).await;
        Ok(())
    }

    #[async_recursion]
    async fn start_run_internal(
        &self,
        name: &str,
        trigger_event: Option<String>,
        chain: Vec<String>,
        overrides: HashMap<String, String>,
    ) -> Result<RunHandle> {
        let (config, base_dir, global_vars) = {
            let inner = self.inner.lock().await;
            if inner.shut_down {
                return Err(CmdorcError::OrchestratorShutdown);
            }
            let config = inner
                .configs
                .get(name)
                .cloned()
                .ok_or_else(|| CmdorcError::CommandNotFound(name.to_string()))?;
            (config, inner.base_dir.clone(), inner.global_vars.clone())
        };

        if !config.debounce.is_zero() {
            let inner = self.inner.lock().await;
            if let Some(last_end) = inner.last_finalized_end.get(name) {
                let elapsed = Local::now()
                    .signed_duration_since(*last_end)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if elapsed < config.debounce {
                    return Err(CmdorcError::Debounce {
                        command: name.to_string(),
                        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                        required_ms: config.debounce.as_millis() as u64,
                    });
                }
            }
        }

        // Resolved outside the lock (template expansion does no I/O but
        // needn't hold the mutex); the decide-then-commit below happens
        // under one held guard so two concurrent callers for the same
        // command can't both read the same active-runs snapshot and both
        // pass the max_concurrent check.
        let resolved = resolve_command(&config, &global_vars, &overrides, &base_dir)?;
        let run_result = RunResult::new(name.to_string(), trigger_event.clone(), chain.clone(), resolved.clone());
        let shared: SharedRunResult = Arc::new(std::sync::Mutex::new(run_result));
        let handle = RunHandle::new(shared.clone());

        let runs_to_cancel = {
            let mut inner = self.inner.lock().await;
            let active = inner.active_runs.get(name).cloned().unwrap_or_default();
            let guards: Vec<_> = active
                .iter()
                .map(|a| a.lock().expect("run result lock poisoned"))
                .collect();
            let refs: Vec<&RunResult> = guards.iter().map(|g| &**g).collect();
            let decision = policy::decide(&config, &refs);
            let cancel_ids: Vec<Uuid> = decision.runs_to_cancel;
            drop(guards);
            if !decision.allow {
                return Err(CmdorcError::ConcurrencyLimit(name.to_string()));
            }
            let to_cancel: Vec<_> = active
                .into_iter()
                .filter(|a| cancel_ids.contains(&a.lock().expect("run result lock poisoned").run_id))
                .collect();
            inner
                .active_runs
                .entry(name.to_string())
                .or_default()
                .push(shared.clone());
            to_cancel
        };
        for run in &runs_to_cancel {
            self.executor
                .cancel_run(run.clone(), Some("superseded by retrigger".to_string()))
                .await;
        }

        self.dispatch_event(
            format!("command_started:{}", name),
            chain,
            Some(name.to_string()),
            None,
        )
        .await;

        self.executor.start_run(shared.clone(), resolved).await;
        self.spawn_completion_watcher(name.to_string(), shared);

        Ok(handle)
    }

    #[async_recursion]
    async fn dispatch_event(
        &self,
        event: String,
        chain: Vec<String>,
        source: Option<String>,
        snapshot: Option<RunSnapshot>,
    ) {
        let plan = {
            let inner = self.inner.lock().await;
            if inner.shut_down {
                return;
            }
            inner
                .trigger_engine
                .dispatch(&event, &chain, source.as_deref(), &inner.callbacks)
        };

        for cfg in &plan.commands_to_cancel {
            self.cancel_command(&cfg.name, Some(format!("cancelled by trigger '{}'", event)))
                .await;
        }

        for planned in plan.commands_to_start {
            if let Err(e) = self
                .start_run_internal(&planned.command.name, Some(event.clone()), planned.chain, HashMap::new())
                .await
            {
                tracing::warn!(command = %planned.command.name, error = %e, "auto-triggered start did not run");
            }
        }

        for (cb, ctx) in plan.callbacks {
            let snap = snapshot.clone();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                cb(snap, ctx);
            }));
            if outcome.is_err() {
                tracing::warn!(event = %event, "callback panicked during dispatch");
            }
        }
    }

    fn spawn_completion_watcher(&self, name: String, shared: SharedRunResult) {
        let runtime = self.clone();
        tokio::spawn(async move {
            wait_for_finalization(&shared).await;
            runtime.handle_completion(name, shared).await;
        });
    }

    async fn handle_completion(&self, name: String, shared: SharedRunResult) {
        let (state, chain) = {
            let guard = shared.lock().expect("run result lock poisoned");
            (guard.state, guard.trigger_chain.clone())
        };

        let removed = {
            let mut inner = self.inner.lock().await;
            let list = inner.active_runs.entry(name.clone()).or_default();
            let before = list.len();
            list.retain(|r| !Arc::ptr_eq(r, &shared));
            before != list.len()
        };
        if !removed {
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            let keep = inner.configs.get(&name).map(|c| c.keep_history).unwrap_or(0);
            if keep > 0 {
                let hist = inner.history.entry(name.clone()).or_default();
                hist.push_back(shared.clone());
                while hist.len() > keep {
                    hist.pop_front();
                }
            }
            inner.last_finalized_end.insert(name.clone(), Local::now());
        }

        let snapshot = RunSnapshot::from(&*shared.lock().expect("run result lock poisoned"));
        let state_event = format!("command_{}:{}", state.event_suffix(), name);
        self.dispatch_event(
            state_event,
            chain.clone(),
            Some(name.clone()),
            Some(snapshot.clone()),
        )
        .await;
        if matches!(state, RunState::Success | RunState::Failed) {
            self.dispatch_event(
                format!("command_finished:{}", name),
                chain,
                Some(name.clone()),
                Some(snapshot),
            )
            .await;
        }
    }

    pub async fn cancel_run(&self, command_name: &str, run_id: Uuid, comment: Option<String>) -> Result<()> {
        let run = {
            let inner = self.inner.lock().await;
            inner.active_runs.get(command_name).and_then(|list| {
                list.iter()
                    .find(|r| r.lock().expect("run result lock poisoned").run_id == run_id)
                    .cloned()
            })
        };
        match run {
            Some(r) => {
                self.executor.cancel_run(r, comment).await;
                Ok(())
            }
            None => Err(CmdorcError::CommandNotFound(command_name.to_string())),
        }
    }

    pub async fn cancel_command(&self, name: &str, comment: Option<String>) {
        let runs = {
            let inner = self.inner.lock().await;
            inner.active_runs.get(name).cloned().unwrap_or_default()
        };
        for run in runs {
            self.executor.cancel_run(run, comment.clone()).await;
        }
    }

    pub async fn cancel_all(&self, comment: Option<String>) {
        let names: Vec<String> = {
            let inner = self.inner.lock().await;
            inner.configs.keys().cloned().collect()
        };
        for name in names {
            self.cancel_command(&name, comment.clone()).await;
        }
    }

    /// Idempotent: a call after the first returns immediately.
    pub async fn shutdown(&self, timeout: Duration, cancel_running: bool) {
        {
            let mut inner = self.inner.lock().await;
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
        }

        if cancel_running {
            self.cancel_all(Some("orchestrator shutting down".to_string())).await;
        }
        self.executor.cleanup().await;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let any_active = {
                let inner = self.inner.lock().await;
                inner.active_runs.values().any(|v| !v.is_empty())
            };
            if !any_active || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn get_status(&self, name: &str) -> Result<CommandStatus> {
        let inner = self.inner.lock().await;
        if !inner.configs.contains_key(name) {
            return Err(CmdorcError::CommandNotFound(name.to_string()));
        }
        let active_count = inner.active_runs.get(name).map(|v| v.len()).unwrap_or(0);
        let last_run = inner
            .history
            .get(name)
            .and_then(|h| h.back())
            .map(|r| CommandStatusRun::from(&*r.lock().expect("run result lock poisoned")));

        let state = if active_count > 0 {
            CommandState::Running
        } else {
            match &last_run {
                Some(r) => match r.state {
                    RunState::Success => CommandState::Success,
                    RunState::Failed => CommandState::Failed,
                    RunState::Cancelled => CommandState::Cancelled,
                    _ => CommandState::NeverRun,
                },
                None => CommandState::NeverRun,
            }
        };

        Ok(CommandStatus {
            state,
            active_count,
            last_run,
        })
    }

    pub async fn get_history(&self, name: &str, limit: Option<usize>) -> Result<Vec<RunSnapshot>> {
        let inner = self.inner.lock().await;
        if !inner.configs.contains_key(name) {
            return Err(CmdorcError::CommandNotFound(name.to_string()));
        }
        let mut snaps: Vec<RunSnapshot> = inner
            .history
            .get(name)
            .map(|h| {
                h.iter()
                    .rev()
                    .map(|r| RunSnapshot::from(&*r.lock().expect("run result lock poisoned")))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(l) = limit {
            snaps.truncate(l);
        }
        Ok(snaps)
    }

    pub async fn get_active_handles(&self, name: Option<&str>) -> Vec<RunHandle> {
        let inner = self.inner.lock().await;
        match name {
            Some(n) => inner
                .active_runs
                .get(n)
                .map(|v| v.iter().map(|r| RunHandle::new(r.clone())).collect())
                .unwrap_or_default(),
            None => inner
                .active_runs
                .values()
                .flatten()
                .map(|r| RunHandle::new(r.clone()))
                .collect(),
        }
    }

    pub async fn get_all_active_handles(&self) -> Vec<RunHandle> {
        self.get_active_handles(None).await
    }

    /// A single result by `run_id`, or — if absent — the latest: the most
    /// recent active run if any, else the newest history entry, else none.
    pub async fn get_result(&self, name: &str, run_id: Option<Uuid>) -> Result<Option<RunSnapshot>> {
        let inner = self.inner.lock().await;
        if !inner.configs.contains_key(name) {
            return Err(CmdorcError::CommandNotFound(name.to_string()));
        }

        if let Some(id) = run_id {
            if let Some(r) = inner
                .active_runs
                .get(name)
                .and_then(|v| v.iter().find(|r| r.lock().expect("run result lock poisoned").run_id == id))
            {
                return Ok(Some(RunSnapshot::from(&*r.lock().expect("run result lock poisoned"))));
            }
            if let Some(r) = inner
                .history
                .get(name)
                .and_then(|v| v.iter().find(|r| r.lock().expect("run result lock poisoned").run_id == id))
            {
                return Ok(Some(RunSnapshot::from(&*r.lock().expect("run result lock poisoned"))));
            }
            return Ok(None);
        }

        if let Some(r) = inner.active_runs.get(name).and_then(|v| v.last()) {
            return Ok(Some(RunSnapshot::from(&*r.lock().expect("run result lock poisoned"))));
        }
        if let Some(r) = inner.history.get(name).and_then(|h| h.back()) {
            return Ok(Some(RunSnapshot::from(&*r.lock().expect("run result lock poisoned"))));
        }
        Ok(None)
    }

    pub async fn on_event(&self, pattern: &str, callback: Callback) -> CallbackId {
        self.inner.lock().await.callbacks.on_event(pattern, callback)
    }

    pub async fn off_event(&self, id: CallbackId) {
        self.inner.lock().await.callbacks.off_event(id);
    }

    /// Convenience that subscribes each provided callback to the matching
    /// lifecycle event for `name`.
    pub async fn set_lifecycle_callback(
        &self,
        name: &str,
        on_started: Option<Callback>,
        on_success: Option<Callback>,
        on_failed: Option<Callback>,
        on_cancelled: Option<Callback>,
    ) -> Vec<CallbackId> {
        let mut ids = Vec::new();
        if let Some(cb) = on_started {
            ids.push(self.on_event(&format!("command_started:{}", name), cb).await);
        }
        if let Some(cb) = on_success {
            ids.push(self.on_event(&format!("command_success:{}", name), cb).await);
        }
        if let Some(cb) = on_failed {
            ids.push(self.on_event(&format!("command_failed:{}", name), cb).await);
        }
        if let Some(cb) = on_cancelled {
            ids.push(self.on_event(&format!("command_cancelled:{}", name), cb).await);
        }
        ids
    }
}

async fn wait_for_finalization(shared: &SharedRunResult) {
    let mut rx = {
        let guard = shared.lock().expect("run result lock poisoned");
        if guard.is_finalized() {
            return;
        }
        guard.subscribe()
    };
    let _ = rx.recv().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandConfig;

    fn runner(cfg: Vec<CommandConfig>) -> CommandRuntime {
        CommandRuntime::new(RunnerConfig::new(cfg).unwrap())
    }

    #[tokio::test]
    async fn single_echo_succeeds() {
        let echo = CommandConfig::builder("Echo", "echo hello")
            .trigger("go")
            .build()
            .unwrap();
        let rt = runner(vec![echo]);
        rt.trigger("go").await.unwrap();

        let handle = wait_for_handle(&rt, "Echo").await;
        let snap = handle.wait(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(snap.state, RunState::Success);
        assert!(snap.output.contains("hello"));

        let history = rt.get_history("Echo", None).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn linear_chain_runs_b_after_a() {
        let a = CommandConfig::builder("A", "echo a").trigger("start").build().unwrap();
        let b = CommandConfig::builder("B", "echo b")
            .trigger("command_success:A")
            .build()
            .unwrap();
        let rt = runner(vec![a, b]);
        rt.trigger("start").await.unwrap();

        wait_until(&rt, "B", Duration::from_secs(5)).await;

        let b_history = rt.get_history("B", None).await.unwrap();
        assert_eq!(b_history.len(), 1);
        assert_eq!(b_history[0].trigger_event.as_deref(), Some("command_success:A"));
        assert!(b_history[0].state == RunState::Success);
    }

    #[tokio::test]
    async fn self_trigger_with_loop_detection_runs_once() {
        // keep_history is raised above the default of 1 so a regression
        // that re-executes Loop via its own command_success trigger shows
        // up as history.len() == 2 instead of being silently truncated.
        let looped = CommandConfig::builder("Loop", "echo once")
            .trigger("go")
            .trigger("command_success:Loop")
            .loop_detection(true)
            .keep_history(5)
            .build()
            .unwrap();
        let rt = runner(vec![looped]);
        rt.trigger("go").await.unwrap();

        wait_until(&rt, "Loop", Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let history = rt.get_history("Loop", None).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn debounce_rejects_immediate_rerun() {
        let fast = CommandConfig::builder("Fast", "echo hi")
            .debounce_ms(200)
            .build()
            .unwrap();
        let rt = runner(vec![fast]);

        rt.run_command("Fast", None, None).await.unwrap();
        wait_until(&rt, "Fast", Duration::from_secs(5)).await;

        let retry = rt.run_command("Fast", None, None).await;
        assert!(matches!(retry, Err(CmdorcError::Debounce { .. })));

        tokio::time::sleep(Duration::from_millis(250)).await;
        let after_window = rt.run_command("Fast", None, None).await;
        assert!(after_window.is_ok());
    }

    async fn wait_until(rt: &CommandRuntime, name: &str, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !rt.get_history(name, None).await.unwrap().is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {} to finish", name);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_handle(rt: &CommandRuntime, name: &str) -> RunHandle {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let inner = rt.inner.lock().await;
                if let Some(r) = inner.active_runs.get(name).and_then(|v| v.last()) {
                    return RunHandle::new(r.clone());
                }
                if let Some(r) = inner.history.get(name).and_then(|h| h.back()) {
                    return RunHandle::new(r.clone());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {} to start", name);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
