//! Callback registry and event-pattern matching.
//!
//! Mirrors `CommandRunner.on_trigger`/`off_trigger` plus a
//! richer pattern grammar: a subscription pattern is either an exact
//! trigger string or a trigger string containing exactly one `*` wildcard,
//! matching one or more non-colon characters in that position.
//!
//! Matching is done with a small compiled
//! matcher rather than a regex in the hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::handle::RunSnapshot;

/// Context passed to every invoked callback: at minimum, the causal chain
/// active at the time of dispatch.
#[derive(Debug, Clone, Default)]
pub struct CallbackContext {
    pub trigger_chain: Vec<String>,
}

pub type Callback = Arc<dyn Fn(Option<RunSnapshot>, CallbackContext) + Send + Sync>;

/// Opaque handle returned by `on_event`, used to unsubscribe via `off_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl CallbackId {
    fn next() -> Self {
        CallbackId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A compiled subscription pattern.
enum Pattern {
    Exact(String),
    /// Exactly one `*`, split into the literal text before and after it.
    Wildcard { prefix: String, suffix: String },
}

impl Pattern {
    fn compile(pattern: &str) -> Pattern {
        match pattern.find('*') {
            None => Pattern::Exact(pattern.to_string()),
            Some(idx) => {
                let prefix = pattern[..idx].to_string();
                let suffix = pattern[idx + 1..].to_string();
                Pattern::Wildcard { prefix, suffix }
            }
        }
    }

    fn matches(&self, event: &str) -> bool {
        match self {
            Pattern::Exact(s) => s == event,
            Pattern::Wildcard { prefix, suffix } => {
                // More than one '*' isn't a valid pattern per the grammar
                // (one wildcard per pattern); such patterns never match
                // rather than silently guessing at intent.
                if suffix.contains('*') {
                    return false;
                }
                if !event.starts_with(prefix.as_str()) || !event.ends_with(suffix.as_str()) {
                    return false;
                }
                let mid_start = prefix.len();
                let mid_end = event.len().saturating_sub(suffix.len());
                if mid_end <= mid_start {
                    return false; // the wildcard must match at least one char
                }
                let middle = &event[mid_start..mid_end];
                !middle.is_empty() && !middle.contains(':')
            }
        }
    }
}

struct Subscription {
    id: CallbackId,
    pattern: Pattern,
    callback: Callback,
}

/// Registry of pattern-keyed callbacks, invoked on every dispatched event.
#[derive(Default)]
pub struct CallbackRegistry {
    subscriptions: Vec<Subscription>,
    ids_by_pattern: HashMap<CallbackId, ()>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        CallbackRegistry {
            subscriptions: Vec::new(),
            ids_by_pattern: HashMap::new(),
        }
    }

    /// Subscribe `callback` to every event matching `pattern`.
    pub fn on_event(&mut self, pattern: &str, callback: Callback) -> CallbackId {
        let id = CallbackId::next();
        self.subscriptions.push(Subscription {
            id,
            pattern: Pattern::compile(pattern),
            callback,
        });
        self.ids_by_pattern.insert(id, ());
        id
    }

    /// Remove a previously registered callback by its `CallbackId`.
    pub fn off_event(&mut self, id: CallbackId) {
        self.subscriptions.retain(|s| s.id != id);
        self.ids_by_pattern.remove(&id);
    }

    /// All callbacks whose pattern matches `event`, in registration order.
    pub fn matching(&self, event: &str) -> Vec<Callback> {
        self.subscriptions
            .iter()
            .filter(|s| s.pattern.matches(event))
            .map(|s| s.callback.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_only_exact() {
        let p = Pattern::compile("command_success:Test");
        assert!(p.matches("command_success:Test"));
        assert!(!p.matches("command_success:Other"));
    }

    #[test]
    fn wildcard_matches_command_name() {
        let p = Pattern::compile("command_success:*");
        assert!(p.matches("command_success:Test"));
        assert!(p.matches("command_success:Build"));
        assert!(!p.matches("command_failed:Test"));
    }

    #[test]
    fn wildcard_matches_state_segment() {
        let p = Pattern::compile("command_*:Test");
        assert!(p.matches("command_success:Test"));
        assert!(p.matches("command_failed:Test"));
        assert!(!p.matches("command_success:Other"));
    }

    #[test]
    fn wildcard_requires_nonempty_non_colon_match() {
        let p = Pattern::compile("command_*:Test");
        assert!(!p.matches("command_:Test"));
        assert!(!p.matches("command_a:b:Test"));
    }

    #[test]
    fn pattern_with_two_wildcards_never_matches() {
        let p = Pattern::compile("command_*:*");
        assert!(!p.matches("command_success:Build"));
        assert!(!p.matches("command_*:*"));
    }

    #[test]
    fn registry_dispatches_and_unsubscribes() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let mut registry = CallbackRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let id = registry.on_event(
            "go",
            Arc::new(move |_handle, _ctx| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(registry.matching("go").len(), 1);
        registry.off_event(id);
        assert_eq!(registry.matching("go").len(), 0);
    }
}
