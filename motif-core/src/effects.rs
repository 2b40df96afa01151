//! Effect reconciliation.
//!
//! Effects are matched by registration position. For each position:
//!
//! - nothing ran there before: run it
//! - no dependency list: clean up the previous run, run again
//! - dependency list shallow-equal to the previous one: keep the previous run
//! - dependency list changed: clean up the previous run, run again
//!
//! An empty dependency list therefore runs exactly once per entry. Positions
//! that disappeared are cleaned up.

use crate::hook::Cleanup;
use serde_json::Value;
use std::fmt;

/// Dependency list of an effect. `None` means "re-run on every build".
pub type Deps = Option<Vec<Value>>;

pub(crate) type EffectFn = Box<dyn FnOnce() -> Option<Cleanup>>;

/// An effect registered during a build, not yet reconciled.
pub(crate) struct EffectDef {
    pub(crate) run: EffectFn,
    pub(crate) deps: Deps,
}

/// An effect that has run and may hold a cleanup.
pub(crate) struct ActiveEffect {
    deps: Deps,
    cleanup: Option<Cleanup>,
}

impl fmt::Debug for ActiveEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveEffect")
            .field("deps", &self.deps)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

impl ActiveEffect {
    fn start(def: EffectDef) -> Self {
        let cleanup = (def.run)();
        Self {
            deps: def.deps,
            cleanup,
        }
    }

    fn stop(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Applies `defs` on top of `previous`, returning the effects now active.
pub(crate) fn reconcile(defs: Vec<EffectDef>, previous: Vec<ActiveEffect>) -> Vec<ActiveEffect> {
    let mut previous = previous.into_iter();
    let mut active = Vec::with_capacity(defs.len());

    for (position, def) in defs.into_iter().enumerate() {
        let effect = match previous.next() {
            None => {
                tracing::trace!(position, "effect mounted");
                ActiveEffect::start(def)
            }
            Some(prev) if deps_unchanged(&prev.deps, &def.deps) => {
                tracing::trace!(position, "effect skipped, deps unchanged");
                prev
            }
            Some(prev) => {
                tracing::trace!(position, "effect re-run");
                prev.stop();
                ActiveEffect::start(def)
            }
        };
        active.push(effect);
    }

    for removed in previous {
        removed.stop();
    }

    active
}

/// Runs every cleanup, in registration order.
pub(crate) fn teardown(effects: Vec<ActiveEffect>) {
    for effect in effects {
        effect.stop();
    }
}

fn deps_unchanged(previous: &Deps, next: &Deps) -> bool {
    match (previous, next) {
        (Some(prev), Some(next)) => prev.len() == next.len() && prev.iter().eq(next.iter()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    fn def(log: &Log, label: &str, deps: Deps) -> EffectDef {
        let (run_log, clean_log) = (log.clone(), log.clone());
        let (run_label, clean_label) = (label.to_string(), label.to_string());
        EffectDef {
            run: Box::new(move || {
                run_log.borrow_mut().push(format!("run:{}", run_label));
                let cleanup: Cleanup = Box::new(move || {
                    clean_log.borrow_mut().push(format!("cleanup:{}", clean_label));
                });
                Some(cleanup)
            }),
            deps,
        }
    }

    fn count(log: &Log, entry: &str) -> usize {
        log.borrow().iter().filter(|e| *e == entry).count()
    }

    #[test]
    fn test_first_pass_runs_everything() {
        let log: Log = Default::default();
        let active = reconcile(
            vec![def(&log, "a", None), def(&log, "b", Some(vec![]))],
            Vec::new(),
        );
        assert_eq!(active.len(), 2);
        assert_eq!(*log.borrow(), vec!["run:a", "run:b"]);
    }

    #[test]
    fn test_no_deps_always_reruns() {
        let log: Log = Default::default();
        let active = reconcile(vec![def(&log, "a", None)], Vec::new());
        let active = reconcile(vec![def(&log, "a", None)], active);
        let _active = reconcile(vec![def(&log, "a", None)], active);

        assert_eq!(count(&log, "run:a"), 3);
        assert_eq!(count(&log, "cleanup:a"), 2);
    }

    #[test]
    fn test_empty_deps_run_once() {
        let log: Log = Default::default();
        let mut active = reconcile(vec![def(&log, "a", Some(vec![]))], Vec::new());
        for _ in 0..5 {
            active = reconcile(vec![def(&log, "a", Some(vec![]))], active);
        }
        assert_eq!(count(&log, "run:a"), 1);
        assert_eq!(count(&log, "cleanup:a"), 0);

        teardown(active);
        assert_eq!(count(&log, "cleanup:a"), 1);
    }

    #[test]
    fn test_changed_deps_cleanup_then_rerun() {
        let log: Log = Default::default();
        let active = reconcile(vec![def(&log, "a", Some(vec![json!(1)]))], Vec::new());
        let active = reconcile(vec![def(&log, "a", Some(vec![json!(1)]))], active);
        let _active = reconcile(vec![def(&log, "a", Some(vec![json!(2)]))], active);

        assert_eq!(*log.borrow(), vec!["run:a", "cleanup:a", "run:a"]);
    }

    #[test]
    fn test_length_change_counts_as_change() {
        let log: Log = Default::default();
        let active = reconcile(vec![def(&log, "a", Some(vec![json!(1)]))], Vec::new());
        let _active = reconcile(
            vec![def(&log, "a", Some(vec![json!(1), json!(2)]))],
            active,
        );
        assert_eq!(count(&log, "run:a"), 2);
    }

    #[test]
    fn test_removed_positions_cleaned_up() {
        let log: Log = Default::default();
        let active = reconcile(
            vec![def(&log, "a", Some(vec![])), def(&log, "b", Some(vec![]))],
            Vec::new(),
        );
        let active = reconcile(vec![def(&log, "a", Some(vec![]))], active);

        assert_eq!(active.len(), 1);
        assert_eq!(count(&log, "cleanup:b"), 1);
        assert_eq!(count(&log, "cleanup:a"), 0);
    }

    proptest! {
        #[test]
        fn prop_runs_once_per_distinct_consecutive_deps(values in proptest::collection::vec(0i64..3, 1..20)) {
            let log: Log = Default::default();
            let mut active = Vec::new();
            for v in &values {
                active = reconcile(vec![def(&log, "a", Some(vec![json!(v)]))], active);
            }
            let mut expected = 1;
            for pair in values.windows(2) {
                if pair[0] != pair[1] {
                    expected += 1;
                }
            }
            prop_assert_eq!(count(&log, "run:a"), expected);
            prop_assert_eq!(count(&log, "cleanup:a"), expected - 1);
        }
    }
}
