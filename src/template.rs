//! `{{ name }}` template variable resolution.
//!
//! Mirrors `cmdorc.load_config.VAR_PATTERN` and
//! `CommandRunner._resolve_template_with_vars`: a single pass replaces every
//! `{{ name }}` span with its value from the merged variable map, and the
//! pass is repeated (up to a bounded depth) so a variable's value may itself
//! reference other variables.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{absolutize, CommandConfig};
use crate::error::TemplateError;
use crate::run_result::ResolvedCommand;

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap())
}

/// Minimum nesting depth implementations must support.
pub const MIN_NESTED_DEPTH: usize = 5;

/// Resolve every `{{ name }}` occurrence in `template` against `vars`,
/// re-scanning the result up to `max_depth` times so that a variable whose
/// value itself contains `{{ other }}` is expanded too.
///
/// Returns `TemplateError::MissingVar` if a referenced variable isn't in
/// `vars`, and `TemplateError::TooDeep` if expansion doesn't reach a fixed
/// point within `max_depth` passes (this also catches simple cycles, e.g.
/// `a = "{{ b }}"`, `b = "{{ a }}"`).
pub fn resolve(
    template: &str,
    vars: &HashMap<String, String>,
    max_depth: usize,
) -> Result<String, TemplateError> {
    let mut current = template.to_string();
    for _ in 0..max_depth {
        let next = expand_once(&current, vars)?;
        if next == current {
            return Ok(next);
        }
        current = next;
    }
    Err(TemplateError::TooDeep(max_depth))
}

fn expand_once(template: &str, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
    let pattern = var_pattern();
    let mut missing: Option<String> = None;
    let result = pattern.replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    if let Some(name) = missing {
        return Err(TemplateError::MissingVar(name));
    }
    Ok(result.into_owned())
}

/// Build the `ResolvedCommand` for one run: merges variables by precedence
/// (override > command vars > process env > global vars), resolves `cwd`,
/// and merges `env` (process env, with the command's own `env` entries
/// template-resolved and taking precedence).
pub fn resolve_command(
    config: &CommandConfig,
    global_vars: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
    base_dir: &Path,
) -> Result<ResolvedCommand, TemplateError> {
    let mut vars = global_vars.clone();
    vars.extend(std::env::vars());
    vars.extend(config.vars.clone());
    vars.extend(overrides.clone());

    let command = resolve(&config.command, &vars, MIN_NESTED_DEPTH)?;

    let cwd = match &config.cwd {
        Some(c) => absolutize(c).unwrap_or_else(|_| base_dir.join(c)),
        None => base_dir.to_path_buf(),
    };

    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (k, v) in &config.env {
        env.insert(k.clone(), resolve(v, &vars, MIN_NESTED_DEPTH)?);
    }

    Ok(ResolvedCommand {
        command,
        cwd,
        env,
        timeout: config.timeout,
        vars,
    })
}
