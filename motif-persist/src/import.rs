//! Loading a document into a workflow.
//!
//! Imports are all-or-nothing: the whole document is resolved against the
//! workflow's inventory before anything in the workflow changes.

use crate::document::{BasicExport, FullExport, GraphRecord};
use crate::error::PersistError;
use motif_core::{Edge, HistoryEntry, Internals, StepInstance, Workflow};
use serde_json::Value;

struct PreparedGraph<A> {
    nodes: Vec<StepInstance<A>>,
    edges: Vec<Edge<A>>,
}

impl<A: Clone + 'static> PreparedGraph<A> {
    fn node(&self, id: &str) -> Result<&StepInstance<A>, PersistError> {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .ok_or_else(|| PersistError::UnknownNode(id.to_string()))
    }
}

fn prepare<A: Clone + 'static>(
    internals: &Internals<'_, A>,
    graph: &GraphRecord,
) -> Result<PreparedGraph<A>, PersistError> {
    let inventory = internals.inventory();
    let mut nodes: Vec<StepInstance<A>> = Vec::with_capacity(graph.nodes.len());

    for record in &graph.nodes {
        let definition = inventory
            .get(&record.kind)
            .ok_or_else(|| PersistError::UnknownKind(record.kind.clone()))?;
        let node = definition.create(record.name.as_deref(), record.config.clone())?;
        if node.id() != record.id {
            return Err(PersistError::InvalidDocument(format!(
                "node id '{}' does not match its kind and name (expected '{}')",
                record.id,
                node.id()
            )));
        }
        if nodes.iter().any(|n| n.id() == node.id()) {
            return Err(PersistError::InvalidDocument(format!(
                "duplicate node id '{}'",
                node.id()
            )));
        }
        nodes.push(node);
    }

    let mut prepared = PreparedGraph {
        nodes,
        edges: Vec::with_capacity(graph.edges.len()),
    };
    for record in &graph.edges {
        let from = prepared.node(&record.from)?;
        let to = prepared.node(&record.to)?;
        let edge = Edge::from_parts(
            record.kind,
            from,
            to,
            record.unidirectional,
            record.config.as_deref(),
        )?;
        prepared.edges.push(edge);
    }

    Ok(prepared)
}

/// Exits the active node, drops the history and swaps in the new graph.
fn install<A: Clone + 'static>(
    internals: &Internals<'_, A>,
    prepared: &PreparedGraph<A>,
) -> Result<(), PersistError> {
    // teardown completes even if an exit hook fails
    if let Err(e) = internals.clear() {
        tracing::warn!("Exit hook failed while clearing workflow for import: {}", e);
    }
    internals.replace_graph(prepared.nodes.clone(), prepared.edges.clone())?;
    Ok(())
}

/// Replaces the graph with the document's. The workflow ends up stopped.
pub fn import_basic<A: Clone + 'static>(
    workflow: &Workflow<A>,
    doc: &BasicExport,
) -> Result<(), PersistError> {
    doc.verify()?;
    let internals = workflow.internals();
    let prepared = prepare(&internals, &doc.graph)?;

    install(&internals, &prepared)?;
    internals.set_running(false);

    tracing::info!(
        "Imported {} nodes and {} edges",
        prepared.nodes.len(),
        prepared.edges.len()
    );
    Ok(())
}

/// Replaces the graph and restores the recorded state.
///
/// The recorded node is re-entered with its recorded input; its status in the
/// document is informational.
pub fn import_full<A: Clone + 'static>(
    workflow: &Workflow<A>,
    doc: &FullExport,
) -> Result<(), PersistError> {
    doc.verify()?;
    let internals = workflow.internals();
    let prepared = prepare(&internals, &doc.graph)?;
    let state = &doc.state;

    let history = state
        .history
        .iter()
        .map(|record| {
            let node = prepared.node(&record.node_id)?;
            Ok(HistoryEntry::new(node.clone(), record.input.clone()))
        })
        .collect::<Result<Vec<_>, PersistError>>()?;

    let current: Option<(StepInstance<A>, Value)> = match &state.current {
        Some(record) => Some((prepared.node(&record.node_id)?.clone(), record.input.clone())),
        None => None,
    };

    let mut stores = Vec::with_capacity(state.stores.len());
    for (id, value) in &state.stores {
        let node = prepared.node(id)?;
        let store = node.store().ok_or_else(|| {
            PersistError::InvalidDocument(format!("node '{}' has no store", id))
        })?;
        stores.push((store.clone(), value.clone()));
    }

    install(&internals, &prepared)?;
    for (store, value) in stores {
        store.set(value);
    }
    internals.replace_history(history)?;
    internals.set_running(state.running);

    if let Some((node, input)) = current {
        tracing::debug!("Re-entering '{}' after import", node.id());
        internals.enter(&node, input, None)?;
    }

    tracing::info!(
        "Imported {} nodes, {} edges and {} history entries",
        prepared.nodes.len(),
        prepared.edges.len(),
        doc.state.history.len()
    );
    Ok(())
}
