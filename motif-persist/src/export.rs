//! Writing a workflow out as a document.

use crate::document::{
    BasicExport, CurrentRecord, EdgeRecord, FullExport, GraphRecord, HistoryRecord, NodeRecord,
    StateRecord, BASIC_FORMAT, FULL_FORMAT, SCHEMA_VERSION,
};
use crate::error::PersistError;
use motif_core::{TransitionStatus, Workflow};
use serde_json::Value;
use std::collections::BTreeMap;

/// Exports nodes and edges.
///
/// Fails if an edge was defined in code rather than as an expression.
pub fn export_basic<A: Clone + 'static>(workflow: &Workflow<A>) -> Result<BasicExport, PersistError> {
    let graph = graph_record(workflow)?;
    let checksum = graph.checksum()?;
    Ok(BasicExport {
        format: BASIC_FORMAT.to_string(),
        schema_version: SCHEMA_VERSION,
        graph,
        checksum: Some(checksum),
    })
}

/// Exports nodes, edges and the runtime state.
pub fn export_full<A: Clone + 'static>(workflow: &Workflow<A>) -> Result<FullExport, PersistError> {
    let graph = graph_record(workflow)?;
    let checksum = graph.checksum()?;
    let internals = workflow.internals();

    let current = internals.active_node().map(|node| CurrentRecord {
        node_id: node.id().to_string(),
        status: workflow
            .current_step()
            .map(|c| c.status)
            .unwrap_or(TransitionStatus::Ready),
        input: internals.active_input().unwrap_or(Value::Null),
    });

    let history = internals
        .history()
        .into_iter()
        .map(|entry| HistoryRecord {
            node_id: entry.node.id().to_string(),
            input: entry.input,
        })
        .collect();

    let stores: BTreeMap<String, Value> = internals
        .nodes()
        .iter()
        .filter_map(|node| node.store().map(|s| (node.id().to_string(), s.get())))
        .collect();

    Ok(FullExport {
        format: FULL_FORMAT.to_string(),
        schema_version: SCHEMA_VERSION,
        graph,
        checksum: Some(checksum),
        state: StateRecord {
            running: workflow.is_running(),
            current,
            history,
            stores,
        },
    })
}

fn graph_record<A: Clone + 'static>(workflow: &Workflow<A>) -> Result<GraphRecord, PersistError> {
    let internals = workflow.internals();

    let nodes = internals
        .nodes()
        .iter()
        .map(|node| NodeRecord {
            id: node.id().to_string(),
            kind: node.kind().to_string(),
            name: node.name().map(str::to_string),
            config: node.config().cloned(),
        })
        .collect();

    let mut edges = Vec::new();
    for edge in internals.edges() {
        if !edge.is_serializable() {
            return Err(PersistError::NotSerializable {
                kind: edge.kind().to_string(),
                from: edge.from().id().to_string(),
                to: edge.to().id().to_string(),
            });
        }
        edges.push(EdgeRecord {
            kind: edge.kind(),
            from: edge.from().id().to_string(),
            to: edge.to().id().to_string(),
            unidirectional: edge.is_unidirectional(),
            config: edge.serialized_config().map(str::to_string),
        });
    }

    Ok(GraphRecord { nodes, edges })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_workflow, Api};
    use motif_core::{Edge, EdgeKind};
    use serde_json::json;

    #[test]
    fn test_export_basic() {
        let (wf, _) = sample_workflow();

        let doc = export_basic(&wf).unwrap();

        assert_eq!(doc.format, BASIC_FORMAT);
        let ids: Vec<_> = doc.graph.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["Form:main", "Review", "Done"]);
        assert_eq!(doc.graph.nodes[0].config, Some(json!({"title": "Sign up"})));
        assert_eq!(doc.graph.nodes[0].name.as_deref(), Some("main"));

        let kinds: Vec<_> = doc.graph.edges.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EdgeKind::Conditional, EdgeKind::Transform, EdgeKind::Default]
        );
        assert_eq!(doc.graph.edges[0].config.as_deref(), Some("out.ok === true"));
        assert!(doc.graph.edges[1].unidirectional);
        assert_eq!(doc.graph.edges[2].config, None);
        doc.verify().unwrap();
    }

    #[test]
    fn test_code_edge_not_serializable() {
        let (wf, nodes) = sample_workflow();
        wf.connect_edge(Edge::conditional(&nodes.review, &nodes.form, |_| true))
            .unwrap();

        let err = export_basic(&wf).unwrap_err();

        assert_eq!(err.error_code(), "NOT_SERIALIZABLE");
        assert!(err.to_string().contains("'Review' -> 'Form:main'"));
    }

    #[test]
    fn test_export_full_state() {
        let (wf, nodes) = sample_workflow();
        wf.start(&nodes.form, json!({"email": "a@b.c"})).unwrap();
        nodes.form.store().unwrap().set(json!({"value": 3}));
        let current: Api = wf.current_step().unwrap().state;
        current.next.send(json!({"ok": true, "total": 9})).unwrap();

        let doc = export_full(&wf).unwrap();

        assert_eq!(doc.format, FULL_FORMAT);
        assert!(doc.state.running);
        let cur = doc.state.current.unwrap();
        assert_eq!(cur.node_id, "Review");
        assert_eq!(cur.status, TransitionStatus::Ready);
        assert_eq!(cur.input, json!({"ok": true, "total": 9}));
        assert_eq!(
            doc.state.history,
            vec![HistoryRecord {
                node_id: "Form:main".to_string(),
                input: json!({"email": "a@b.c"}),
            }]
        );
        assert_eq!(doc.state.stores.get("Form:main"), Some(&json!({"value": 3})));
        assert!(!doc.state.stores.contains_key("Review"));
    }

    #[test]
    fn test_export_full_before_start() {
        let (wf, _) = sample_workflow();
        let doc = export_full(&wf).unwrap();
        assert!(!doc.state.running);
        assert!(doc.state.current.is_none());
        assert!(doc.state.history.is_empty());
    }
}
