//! Immutable command and runner configuration.
//!
//! Mirrors `cmdorc.command_config.CommandConfig` / `RunnerConfig`: built by
//! value, validated once at construction (`__post_init__` in the original),
//! and otherwise read-only for the lifetime of the runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::error::CmdorcError;

/// What to do when a new trigger arrives while a command is already running
/// and `max_concurrent` has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnRetrigger {
    /// Cancel every active run of the command and start the new one.
    CancelAndRestart,
    /// Reject the new run; incumbents keep running.
    Ignore,
}

fn trigger_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-:]+$").unwrap())
}

/// Immutable, validated configuration for a single command.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub name: String,
    pub command: String,
    pub triggers: Vec<String>,
    pub cancel_on_triggers: Vec<String>,
    pub max_concurrent: u32,
    pub timeout: Option<Duration>,
    pub on_retrigger: OnRetrigger,
    pub keep_history: usize,
    pub vars: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub debounce: Duration,
    pub loop_detection: bool,
}

/// Builder for `CommandConfig`. Mirrors the dataclass field defaults in
/// `command_config.py`: `max_concurrent=1`, `on_retrigger="cancel_and_restart"`,
/// `keep_history=1`, `loop_detection=true`.
pub struct CommandConfigBuilder {
    name: String,
    command: String,
    triggers: Vec<String>,
    cancel_on_triggers: Vec<String>,
    max_concurrent: u32,
    timeout: Option<Duration>,
    on_retrigger: OnRetrigger,
    keep_history: usize,
    vars: HashMap<String, String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    debounce: Duration,
    loop_detection: bool,
}

impl CommandConfigBuilder {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        CommandConfigBuilder {
            name: name.into(),
            command: command.into(),
            triggers: Vec::new(),
            cancel_on_triggers: Vec::new(),
            max_concurrent: 1,
            timeout: None,
            on_retrigger: OnRetrigger::CancelAndRestart,
            keep_history: 1,
            vars: HashMap::new(),
            cwd: None,
            env: HashMap::new(),
            debounce: Duration::ZERO,
            loop_detection: true,
        }
    }

    pub fn trigger(mut self, trigger: impl Into<String>) -> Self {
        self.triggers.push(trigger.into());
        self
    }

    pub fn triggers(mut self, triggers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.triggers.extend(triggers.into_iter().map(Into::into));
        self
    }

    pub fn cancel_on_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.cancel_on_triggers.push(trigger.into());
        self
    }

    pub fn cancel_on_triggers(
        mut self,
        triggers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.cancel_on_triggers
            .extend(triggers.into_iter().map(Into::into));
        self
    }

    pub fn max_concurrent(mut self, n: u32) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(Duration::from_secs(secs));
        self
    }

    pub fn on_retrigger(mut self, policy: OnRetrigger) -> Self {
        self.on_retrigger = policy;
        self
    }

    pub fn keep_history(mut self, n: usize) -> Self {
        self.keep_history = n;
        self
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.debounce = Duration::from_millis(ms);
        self
    }

    pub fn loop_detection(mut self, enabled: bool) -> Self {
        self.loop_detection = enabled;
        self
    }

    /// Validate and build the `CommandConfig`, matching
    /// `CommandConfig.__post_init__`'s rejection rules.
    pub fn build(self) -> Result<CommandConfig, CmdorcError> {
        if self.name.trim().is_empty() {
            return Err(CmdorcError::ConfigInvalid(
                "command name cannot be empty".into(),
            ));
        }
        if self.command.trim().is_empty() {
            return Err(CmdorcError::ConfigInvalid(format!(
                "command for '{}' cannot be empty",
                self.name
            )));
        }
        for t in self.triggers.iter().chain(self.cancel_on_triggers.iter()) {
            if !trigger_pattern().is_match(t) {
                return Err(CmdorcError::ConfigInvalid(format!(
                    "invalid trigger string '{}' for command '{}': must match [A-Za-z0-9_-:]+",
                    t, self.name
                )));
            }
        }
        if let Some(cwd) = &self.cwd {
            if let Err(e) = absolutize(cwd) {
                return Err(CmdorcError::ConfigInvalid(format!(
                    "invalid cwd for '{}': {}",
                    self.name, e
                )));
            }
        }
        if matches!(self.timeout, Some(d) if d.is_zero()) {
            return Err(CmdorcError::ConfigInvalid(format!(
                "timeout_secs for '{}' must be positive, got 0",
                self.name
            )));
        }

        Ok(CommandConfig {
            name: self.name,
            command: self.command,
            triggers: self.triggers,
            cancel_on_triggers: self.cancel_on_triggers,
            max_concurrent: self.max_concurrent,
            timeout: self.timeout,
            on_retrigger: self.on_retrigger,
            keep_history: self.keep_history,
            vars: self.vars,
            cwd: self.cwd,
            env: self.env,
            debounce: self.debounce,
            loop_detection: self.loop_detection,
        })
    }
}

/// Resolve a path to absolute without requiring it to exist, matching
/// `Path(self.cwd).resolve()`'s tolerance for missing directories.
pub(crate) fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

impl CommandConfig {
    pub fn builder(name: impl Into<String>, command: impl Into<String>) -> CommandConfigBuilder {
        CommandConfigBuilder::new(name, command)
    }
}

/// Top-level configuration for a `CommandRuntime`: every command plus
/// global template variables.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub commands: Vec<CommandConfig>,
    pub vars: HashMap<String, String>,
    /// Hard cap on causal-chain length enforced regardless of
    /// `loop_detection` (a configurable hard cap).
    pub max_chain_length: usize,
}

impl RunnerConfig {
    pub fn new(commands: Vec<CommandConfig>) -> Result<Self, CmdorcError> {
        Self::with_vars(commands, HashMap::new())
    }

    pub fn with_vars(
        commands: Vec<CommandConfig>,
        vars: HashMap<String, String>,
    ) -> Result<Self, CmdorcError> {
        if commands.is_empty() {
            return Err(CmdorcError::ConfigInvalid(
                "at least one command is required".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for cmd in &commands {
            if !seen.insert(cmd.name.clone()) {
                return Err(CmdorcError::ConfigInvalid(format!(
                    "duplicate command name '{}'",
                    cmd.name
                )));
            }
        }

        Ok(RunnerConfig {
            commands,
            vars,
            max_chain_length: 64,
        })
    }
}
