//! Pure concurrency decision logic.
//!
//! Mirrors `cmdorc.concurrency_policy.ConcurrencyPolicy`: a stateless
//! function of a command's config and its currently active runs. This is
//! the only place `max_concurrent` and `on_retrigger` are consulted
//! .

use uuid::Uuid;

use crate::config::{CommandConfig, OnRetrigger};
use crate::run_result::RunResult;

/// Decision returned by `decide`.
pub struct Decision {
    pub allow: bool,
    pub runs_to_cancel: Vec<Uuid>,
}

/// Decide whether a new run of `config` may start given its `active_runs`,
/// and which (if any) must be cancelled first.
///
/// Rules, in order:
/// 1. `max_concurrent == 0` -> allow, cancel none.
/// 2. under the limit -> allow, cancel none.
/// 3. at the limit and `cancel_and_restart` -> allow, cancel all active runs.
/// 4. at the limit and `ignore` -> disallow, cancel none.
pub fn decide(config: &CommandConfig, active_runs: &[&RunResult]) -> Decision {
    if config.max_concurrent == 0 {
        return Decision {
            allow: true,
            runs_to_cancel: vec![],
        };
    }

    if (active_runs.len() as u32) < config.max_concurrent {
        return Decision {
            allow: true,
            runs_to_cancel: vec![],
        };
    }

    match config.on_retrigger {
        OnRetrigger::CancelAndRestart => Decision {
            allow: true,
            runs_to_cancel: active_runs.iter().map(|r| r.run_id).collect(),
        },
        OnRetrigger::Ignore => Decision {
            allow: false,
            runs_to_cancel: vec![],
        },
    }
}
