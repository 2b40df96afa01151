//! # motif-persist
//!
//! Persistence for motif workflows.
//!
//! - Basic documents carry the graph (nodes and expression edges)
//! - Full documents add the runtime state: active node, history, stores
//! - Time-travel snapshots record and restore a running workflow
//!
//! Everything here is built on the engine's public surface and its
//! [`Internals`](motif_core::Internals).

pub mod document;
pub mod error;
pub mod export;
pub mod import;
pub mod timetravel;

#[cfg(test)]
mod fixtures;

pub use document::{
    load, save, BasicExport, Encoding, FullExport, GraphRecord, StateRecord, BASIC_FORMAT,
    FULL_FORMAT, SCHEMA_VERSION,
};
pub use error::PersistError;
pub use export::{export_basic, export_full};
pub use import::{import_basic, import_full};
pub use timetravel::{capture, restore, RecordedSnapshot, Recorder, WorkflowSnapshot};
