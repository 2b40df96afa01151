//! Per-entry bookkeeping for the active step.

use crate::effects::{ActiveEffect, EffectDef};
use crate::hook::{Cleanup, Hook};
use crate::store::StoreSubscription;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Hook and effect registrations collected while a step body is built.
#[derive(Default)]
pub(crate) struct Registrations {
    pub(crate) in_hooks: Vec<Hook>,
    pub(crate) out_hooks: Vec<Hook>,
    pub(crate) effects: Vec<EffectDef>,
}

/// Live record for the active node. At most one exists at a time.
pub(crate) struct Context {
    pub(crate) version: u64,
    pub(crate) has_run_in: bool,
    pub(crate) input: Value,
    pub(crate) out_hooks: Vec<Hook>,
    pub(crate) in_cleanups: Vec<Cleanup>,
    pub(crate) effects: Vec<ActiveEffect>,
    pub(crate) store_subscription: Option<StoreSubscription>,
}

impl Context {
    pub(crate) fn new(version: u64, input: Value, out_hooks: Vec<Hook>) -> Self {
        Self {
            version,
            has_run_in: false,
            input,
            out_hooks,
            in_cleanups: Vec::new(),
            effects: Vec::new(),
            store_subscription: None,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("version", &self.version)
            .field("has_run_in", &self.has_run_in)
            .field("input", &self.input)
            .field("out_hooks", &self.out_hooks.len())
            .field("in_cleanups", &self.in_cleanups.len())
            .field("effects", &self.effects.len())
            .field("subscribed", &self.store_subscription.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Bucket {
    cleanups: Vec<Cleanup>,
    drained: bool,
}

/// Exit-hook cleanups of a history entry, held until the user backs into it.
///
/// Once drained, any cleanup that arrives late (from a still-pending exit
/// hook) runs immediately instead of being stored.
#[derive(Clone, Default)]
pub struct DeferredCleanups {
    bucket: Rc<RefCell<Bucket>>,
}

impl fmt::Debug for DeferredCleanups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bucket = self.bucket.borrow();
        f.debug_struct("DeferredCleanups")
            .field("pending", &bucket.cleanups.len())
            .field("drained", &bucket.drained)
            .finish()
    }
}

impl DeferredCleanups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a cleanup, or runs it right away if the bucket was already drained.
    pub fn push(&self, cleanup: Cleanup) {
        let run_now = {
            let mut bucket = self.bucket.borrow_mut();
            if bucket.drained {
                Some(cleanup)
            } else {
                bucket.cleanups.push(cleanup);
                None
            }
        };
        if let Some(cleanup) = run_now {
            cleanup();
        }
    }

    /// Runs every stored cleanup and marks the bucket drained.
    pub fn drain(&self) {
        let cleanups = {
            let mut bucket = self.bucket.borrow_mut();
            bucket.drained = true;
            std::mem::take(&mut bucket.cleanups)
        };
        for cleanup in cleanups {
            cleanup();
        }
    }

    pub fn len(&self) -> usize {
        self.bucket.borrow().cleanups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_drained(&self) -> bool {
        self.bucket.borrow().drained
    }
}
