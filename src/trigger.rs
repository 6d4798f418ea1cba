//! Trigger dispatch and cycle detection.
//!
//! Mirrors `CommandRunner.trigger`'s cycle-detection loop in the Python
//! original: two indexes (start, cancel) from
//! trigger string to command, dispatch ordering cancel-before-start-before-
//! callbacks, and a branch-local causal chain.
//!
//! `TriggerEngine` is pure: it decides *what* should happen for a dispatched
//! event and returns a `DispatchPlan`; `CommandRuntime` carries the plan out
//! (starting/cancelling runs, invoking callbacks) since only the runtime
//! holds the executor and live-run state.

use std::collections::HashMap;

use crate::callback::{Callback, CallbackContext, CallbackRegistry};
use crate::config::CommandConfig;

/// A command to start, paired with the causal chain its run should carry
/// (branch-local: a fresh `Vec` per command, never shared).
pub struct PlannedStart {
    pub command: CommandConfig,
    pub chain: Vec<String>,
}

/// What `TriggerEngine::dispatch` decided should happen for one event.
#[derive(Default)]
pub struct DispatchPlan {
    pub commands_to_cancel: Vec<CommandConfig>,
    pub commands_to_start: Vec<PlannedStart>,
    pub callbacks: Vec<(Callback, CallbackContext)>,
}

impl DispatchPlan {
    fn empty() -> Self {
        DispatchPlan::default()
    }
}

pub struct TriggerEngine {
    start_index: HashMap<String, Vec<CommandConfig>>,
    cancel_index: HashMap<String, Vec<CommandConfig>>,
    max_chain_length: usize,
}

impl TriggerEngine {
    pub fn new(commands: &[CommandConfig], max_chain_length: usize) -> Self {
        let mut start_index: HashMap<String, Vec<CommandConfig>> = HashMap::new();
        let mut cancel_index: HashMap<String, Vec<CommandConfig>> = HashMap::new();

        for cmd in commands {
            for t in &cmd.triggers {
                start_index.entry(t.clone()).or_default().push(cmd.clone());
            }
            for t in &cmd.cancel_on_triggers {
                cancel_index
                    .entry(t.clone())
                    .or_default()
                    .push(cmd.clone());
            }
        }

        TriggerEngine {
            start_index,
            cancel_index,
            max_chain_length,
        }
    }

    /// Register a new command's triggers/cancel_on_triggers after
    /// construction (commands may be appended at runtime).
    pub fn add_command(&mut self, cmd: &CommandConfig) {
        for t in &cmd.triggers {
            self.start_index
                .entry(t.clone())
                .or_default()
                .push(cmd.clone());
        }
        for t in &cmd.cancel_on_triggers {
            self.cancel_index
                .entry(t.clone())
                .or_default()
                .push(cmd.clone());
        }
    }

    /// Decide the effects of dispatching `event` along causal chain `chain`.
    ///
    /// `source` is the name of the command whose own lifecycle produced
    /// `event` (e.g. `Some("Loop")` when `event` is
    /// `command_success:Loop`), or `None` when `event` comes from an
    /// external `CommandRuntime::trigger` call with no originating run.
    ///
    /// The hard chain-length cap always applies and aborts the whole
    /// branch (no cancels, no starts, no callbacks) once `chain` is already
    /// at capacity — this is the backstop required regardless
    /// of any command's `loop_detection` setting. Per-command cycle
    /// detection skips only *that* command's start, leaving cancel-index
    /// effects and callbacks for the same event unconditional, matching the
    /// original `CommandRunner.trigger`. A candidate is a cycle if either:
    /// its own lifecycle event is the one being dispatched (`source ==
    /// cmd.name`, catching a command's very first self-retrigger, before
    /// `chain` has a chance to record it), or `event` already occurs
    /// earlier in `chain` (catching longer A -> B -> A cascades on their
    /// second lap).
    pub fn dispatch(
        &self,
        event: &str,
        chain: &[String],
        source: Option<&str>,
        registry: &CallbackRegistry,
    ) -> DispatchPlan {
        if chain.len() >= self.max_chain_length {
            tracing::warn!(
                event,
                chain_length = chain.len(),
                "trigger chain hit hard length cap, aborting dispatch"
            );
            return DispatchPlan::empty();
        }

        let mut next_chain = chain.to_vec();
        next_chain.push(event.to_string());

        let commands_to_cancel = self.cancel_index.get(event).cloned().unwrap_or_default();

        let mut commands_to_start = Vec::new();
        for cmd in self.start_index.get(event).cloned().unwrap_or_default() {
            let is_self_retrigger = source == Some(cmd.name.as_str());
            let revisits_chain = chain.contains(&event.to_string());
            if (is_self_retrigger || revisits_chain) && cmd.loop_detection {
                let recent: Vec<&str> = chain.iter().rev().take(8).rev().map(String::as_str).collect();
                tracing::warn!(
                    command = %cmd.name,
                    cycle = format!("{} -> {}", recent.join(" -> "), event),
                    "trigger cycle detected, skipping this command's start"
                );
                continue;
            }
            commands_to_start.push(PlannedStart {
                command: cmd,
                chain: next_chain.clone(),
            });
        }

        let callbacks = registry
            .matching(event)
            .into_iter()
            .map(|cb| {
                (
                    cb,
                    CallbackContext {
                        trigger_chain: next_chain.clone(),
                    },
                )
            })
            .collect();

        DispatchPlan {
            commands_to_cancel,
            commands_to_start,
            callbacks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(name: &str, triggers: &[&str]) -> CommandConfig {
        CommandConfig::builder(name, "echo hi")
            .triggers(triggers.iter().map(|s| s.to_string()))
            .build()
            .unwrap()
    }

    #[test]
    fn dispatch_finds_start_commands() {
        let a = cmd("A", &["start"]);
        let engine = TriggerEngine::new(&[a], 64);
        let registry = CallbackRegistry::new();
        let plan = engine.dispatch("start", &[], None, &registry);
        assert_eq!(plan.commands_to_start.len(), 1);
        assert_eq!(plan.commands_to_start[0].command.name, "A");
        assert_eq!(plan.commands_to_start[0].chain, vec!["start".to_string()]);
    }

    #[test]
    fn loop_detection_skips_self_retrigger_on_first_occurrence() {
        let loop_cmd = CommandConfig::builder("Loop", "echo hi")
            .trigger("go")
            .trigger("command_success:Loop")
            .loop_detection(true)
            .build()
            .unwrap();
        let engine = TriggerEngine::new(&[loop_cmd], 64);
        let registry = CallbackRegistry::new();

        // Loop's own completion dispatches "command_success:Loop" with
        // source = "Loop" and a chain that has not yet recorded the event
        // (chain = ["go"]) — the bug this guards against let exactly this
        // case through once before the chain-based check caught the next.
        let chain = vec!["go".to_string()];
        let plan = engine.dispatch("command_success:Loop", &chain, Some("Loop"), &registry);
        assert!(plan.commands_to_start.is_empty());
    }

    #[test]
    fn loop_detection_skips_repeated_event_for_that_command() {
        let loop_cmd = CommandConfig::builder("Loop", "echo hi")
            .trigger("go")
            .trigger("command_success:Loop")
            .loop_detection(true)
            .build()
            .unwrap();
        let engine = TriggerEngine::new(&[loop_cmd], 64);
        let registry = CallbackRegistry::new();

        let chain = vec!["go".to_string(), "command_success:Loop".to_string()];
        let plan = engine.dispatch("command_success:Loop", &chain, None, &registry);
        assert!(plan.commands_to_start.is_empty());
    }

    #[test]
    fn forward_chain_is_not_mistaken_for_self_retrigger() {
        // Test's own trigger fires from Build's completion, not its own —
        // source = "Build" must not collide with candidate cmd.name = "Test".
        let test_cmd = cmd("Test", &["command_success:Build"]);
        let engine = TriggerEngine::new(&[test_cmd], 64);
        let registry = CallbackRegistry::new();
        let plan = engine.dispatch("command_success:Build", &["build".to_string()], Some("Build"), &registry);
        assert_eq!(plan.commands_to_start.len(), 1);
        assert_eq!(plan.commands_to_start[0].command.name, "Test");
    }

    #[test]
    fn hard_cap_aborts_branch_entirely() {
        let a = cmd("A", &["x"]);
        let engine = TriggerEngine::new(&[a], 2);
        let registry = CallbackRegistry::new();
        let chain = vec!["x".to_string(), "y".to_string()];
        let plan = engine.dispatch("x", &chain, None, &registry);
        assert!(plan.commands_to_start.is_empty());
        assert!(plan.commands_to_cancel.is_empty());
    }
}
