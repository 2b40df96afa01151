//! # motif-core
//!
//! Workflow engine for motif.
//!
//! This crate provides:
//! - Step definitions with validated input, output and config, and per-step stores
//! - Edges: pass-through, conditional and transform, in code or as expressions
//! - The transition engine: entry, exit, forward and back navigation,
//!   lifecycle hooks, effect reconciliation, pause and resume
//!
//! The engine is single-threaded. Hooks that return pending futures are driven
//! with `tokio::task::spawn_local`, so such workflows must run inside a
//! `tokio::task::LocalSet`.

mod context;
pub mod edge;
mod effects;
pub mod error;
pub mod expr;
pub mod hook;
pub mod schema;
pub mod step;
pub mod store;
pub mod workflow;

pub use context::DeferredCleanups;
pub use edge::{Edge, EdgeKind, EdgeRule, Transition};
pub use effects::Deps;
pub use error::{HookPhase, SchemaTarget, WorkflowError};
pub use expr::{CompiledExpr, EvalError};
pub use hook::{cleanup, Cleanup, HookError, HookOutcome, PendingCleanup};
pub use schema::Schema;
pub use step::{StepContext, StepDefinition, StepInstance};
pub use store::{Store, StoreSubscription};
pub use workflow::{
    CurrentStep, HistoryEntry, Internals, Next, Subscription, TransitionStatus, WeakWorkflow,
    Workflow,
};
