//! TOML configuration loading.
//!
//! An optional convenience layer: the core only ever consumes a
//! validated `RunnerConfig`. This module is the one place that turns a TOML
//! file on disk into one, mirroring `cmdorc.load_config.load_config_file`'s
//! `[variables]` + `[[command]]` shape via `serde` + `toml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::{CommandConfig, OnRetrigger, RunnerConfig};
use crate::error::CmdorcError;

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    variables: HashMap<String, String>,
    #[serde(default)]
    max_chain_length: Option<usize>,
    #[serde(rename = "command", default)]
    commands: Vec<RawCommand>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawOnRetrigger {
    CancelAndRestart,
    Ignore,
}

impl From<RawOnRetrigger> for OnRetrigger {
    fn from(r: RawOnRetrigger) -> Self {
        match r {
            RawOnRetrigger::CancelAndRestart => OnRetrigger::CancelAndRestart,
            RawOnRetrigger::Ignore => OnRetrigger::Ignore,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    name: String,
    command: String,
    #[serde(default)]
    triggers: Vec<String>,
    #[serde(default)]
    cancel_on_triggers: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: u32,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    on_retrigger: Option<RawOnRetrigger>,
    #[serde(default = "default_keep_history")]
    keep_history: usize,
    #[serde(default)]
    vars: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    debounce_in_ms: u64,
    #[serde(default = "default_loop_detection")]
    loop_detection: bool,
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_keep_history() -> usize {
    1
}

fn default_loop_detection() -> bool {
    true
}

/// Load and validate a `RunnerConfig` from a TOML file at `path`. Relative
/// `cwd` entries are resolved against `path`'s parent directory.
pub fn load_config_file(path: impl AsRef<Path>) -> Result<RunnerConfig, CmdorcError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| CmdorcError::ConfigInvalid(format!("cannot read '{}': {}", path.display(), e)))?;
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    load_config_str(&text, &base_dir)
}

/// Parse and validate a `RunnerConfig` from TOML text, resolving relative
/// `cwd` entries against `base_dir`.
pub fn load_config_str(text: &str, base_dir: &Path) -> Result<RunnerConfig, CmdorcError> {
    let raw: RawFile =
        toml::from_str(text).map_err(|e| CmdorcError::ConfigInvalid(format!("invalid TOML: {}", e)))?;

    let mut commands = Vec::with_capacity(raw.commands.len());
    for rc in raw.commands {
        let mut builder = CommandConfig::builder(rc.name, rc.command)
            .triggers(rc.triggers)
            .cancel_on_triggers(rc.cancel_on_triggers)
            .max_concurrent(rc.max_concurrent)
            .keep_history(rc.keep_history)
            .debounce_ms(rc.debounce_in_ms)
            .loop_detection(rc.loop_detection);

        if let Some(secs) = rc.timeout_secs {
            builder = builder.timeout_secs(secs);
        }
        if let Some(policy) = rc.on_retrigger {
            builder = builder.on_retrigger(policy.into());
        }
        for (k, v) in rc.vars {
            builder = builder.var(k, v);
        }
        for (k, v) in rc.env {
            builder = builder.env(k, v);
        }
        if let Some(cwd) = rc.cwd {
            let resolved_cwd = if cwd.is_absolute() { cwd } else { base_dir.join(cwd) };
            builder = builder.cwd(resolved_cwd);
        }

        commands.push(builder.build()?);
    }

    let mut config = RunnerConfig::with_vars(commands, raw.variables)?;
    if let Some(max) = raw.max_chain_length {
        config.max_chain_length = max;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let toml = r#"
            [variables]
            greeting = "hello"

            [[command]]
            name = "Echo"
            command = "echo {{ greeting }}"
            triggers = ["go"]
        "#;
        let config = load_config_str(toml, Path::new("/tmp")).unwrap();
        assert_eq!(config.commands.len(), 1);
        assert_eq!(config.vars.get("greeting").unwrap(), "hello");
        assert_eq!(config.commands[0].name, "Echo");
        assert_eq!(config.commands[0].triggers, vec!["go".to_string()]);
    }

    #[test]
    fn resolves_relative_cwd_against_base_dir() {
        let toml = r#"
            [[command]]
            name = "Build"
            command = "make"
            cwd = "subdir"
        "#;
        let config = load_config_str(toml, Path::new("/srv/project")).unwrap();
        assert_eq!(
            config.commands[0].cwd.as_deref(),
            Some(Path::new("/srv/project/subdir"))
        );
    }

    #[test]
    fn rejects_invalid_on_retrigger() {
        let toml = r#"
            [[command]]
            name = "X"
            command = "echo hi"
            on_retrigger = "not_a_real_option"
        "#;
        assert!(load_config_str(toml, Path::new(".")).is_err());
    }

    #[test]
    fn applies_max_chain_length_override() {
        let toml = r#"
            max_chain_length = 8

            [[command]]
            name = "X"
            command = "echo hi"
        "#;
        let config = load_config_str(toml, Path::new(".")).unwrap();
        assert_eq!(config.max_chain_length, 8);
    }
}
