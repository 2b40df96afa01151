//! Lifecycle hook results and cleanup handles.

use crate::error::HookPhase;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A cleanup produced by a hook or an effect. Runs at most once.
pub type Cleanup = Box<dyn FnOnce()>;

/// A cleanup that is still being produced by asynchronous hook work.
pub type PendingCleanup = Pin<Box<dyn Future<Output = Result<Option<Cleanup>, HookError>>>>;

pub(crate) type Hook = Box<dyn FnOnce() -> HookOutcome>;

/// Boxes a closure as a [`Cleanup`].
pub fn cleanup<F>(f: F) -> Cleanup
where
    F: FnOnce() + 'static,
{
    Box::new(f)
}

/// Failure reported by a hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HookError(String);

impl HookError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}

impl From<&str> for HookError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HookError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What a `transition_in` / `transition_out` hook returned.
pub enum HookOutcome {
    /// Nothing to clean up.
    Done,
    /// Cleanup available immediately.
    Cleanup(Cleanup),
    /// Cleanup arrives when the future resolves.
    Pending(PendingCleanup),
    /// The hook failed synchronously.
    Failed(HookError),
}

impl HookOutcome {
    pub fn cleanup<F>(f: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        HookOutcome::Cleanup(Box::new(f))
    }

    pub fn pending<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = Result<Option<Cleanup>, HookError>> + 'static,
    {
        HookOutcome::Pending(Box::pin(fut))
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        HookOutcome::Failed(HookError::new(reason))
    }
}

impl fmt::Debug for HookOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookOutcome::Done => f.write_str("Done"),
            HookOutcome::Cleanup(_) => f.write_str("Cleanup(..)"),
            HookOutcome::Pending(_) => f.write_str("Pending(..)"),
            HookOutcome::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

impl From<()> for HookOutcome {
    fn from(_: ()) -> Self {
        HookOutcome::Done
    }
}

impl From<Cleanup> for HookOutcome {
    fn from(c: Cleanup) -> Self {
        HookOutcome::Cleanup(c)
    }
}

impl From<Option<Cleanup>> for HookOutcome {
    fn from(c: Option<Cleanup>) -> Self {
        match c {
            Some(c) => HookOutcome::Cleanup(c),
            None => HookOutcome::Done,
        }
    }
}

impl From<Result<HookOutcome, HookError>> for HookOutcome {
    fn from(r: Result<HookOutcome, HookError>) -> Self {
        r.unwrap_or_else(HookOutcome::Failed)
    }
}

/// Spawns the pending part of a hook on the local task set.
///
/// `settle` receives the cleanup once it exists; rejections are logged and
/// otherwise ignored.
pub(crate) fn spawn_pending<S>(
    pending: PendingCleanup,
    step: String,
    phase: HookPhase,
    index: usize,
    settle: S,
) where
    S: FnOnce(Cleanup) + 'static,
{
    tokio::task::spawn_local(async move {
        match pending.await {
            Ok(Some(cleanup)) => settle(cleanup),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    "Asynchronous {} hook #{} of '{}' rejected: {}",
                    phase,
                    index,
                    step,
                    e
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_conversions() {
        assert!(matches!(HookOutcome::from(()), HookOutcome::Done));
        assert!(matches!(HookOutcome::from(None), HookOutcome::Done));
        assert!(matches!(
            HookOutcome::from(Some(cleanup(|| {}))),
            HookOutcome::Cleanup(_)
        ));
        assert!(matches!(
            HookOutcome::from(Err::<HookOutcome, _>(HookError::from("boom"))),
            HookOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_cleanup_runs() {
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        match HookOutcome::cleanup(move || r.set(true)) {
            HookOutcome::Cleanup(c) => c(),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(ran.get());
    }

    #[tokio::test]
    async fn test_spawn_pending_settles() {
        let local = tokio::task::LocalSet::new();
        let ran = Rc::new(Cell::new(0));
        let r = ran.clone();
        local
            .run_until(async move {
                let pending: PendingCleanup = Box::pin(async move {
                    Ok(Some(cleanup(move || r.set(r.get() + 1))))
                });
                spawn_pending(pending, "A".into(), HookPhase::TransitionIn, 0, |c| c());
                tokio::task::yield_now().await;
            })
            .await;
        local.await;
        assert_eq!(ran.get(), 1);
    }
}
