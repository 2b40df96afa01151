//! Time-travel snapshots.
//!
//! A [`Recorder`] keeps a labelled [`WorkflowSnapshot`] for every status the
//! workflow publishes while running, and can put the workflow back into any
//! of them.

use crate::document::HistoryRecord;
use crate::error::PersistError;
use motif_core::{
    CurrentStep, HistoryEntry, Subscription, TransitionStatus, WeakWorkflow, Workflow,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Point-in-time state of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub status: TransitionStatus,
    pub node_id: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_state: Option<Value>,
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
}

/// Snapshot of the active node, or `None` if nothing is active.
pub fn capture<A: Clone + 'static>(workflow: &Workflow<A>) -> Option<WorkflowSnapshot> {
    let step = workflow.current_step()?;
    Some(snapshot_of(workflow, &step))
}

fn snapshot_of<A: Clone + 'static>(workflow: &Workflow<A>, step: &CurrentStep<A>) -> WorkflowSnapshot {
    let internals = workflow.internals();
    WorkflowSnapshot {
        status: step.status,
        node_id: step.id.clone(),
        input: internals.active_input().unwrap_or(Value::Null),
        store_state: step.instance.store().map(|s| s.get()),
        history: internals
            .history()
            .into_iter()
            .map(|entry| HistoryRecord {
                node_id: entry.node.id().to_string(),
                input: entry.input,
            })
            .collect(),
    }
}

/// Puts the workflow into `snapshot`'s state.
///
/// The active node is exited, the history replaced and the snapshot's node
/// entered directly, without edge or input validation.
pub fn restore<A: Clone + 'static>(
    workflow: &Workflow<A>,
    snapshot: &WorkflowSnapshot,
) -> Result<(), PersistError> {
    let internals = workflow.internals();

    let node = internals
        .node(&snapshot.node_id)
        .ok_or_else(|| PersistError::UnknownNode(snapshot.node_id.clone()))?;
    let history = snapshot
        .history
        .iter()
        .map(|record| {
            internals
                .node(&record.node_id)
                .map(|n| HistoryEntry::new(n, record.input.clone()))
                .ok_or_else(|| PersistError::UnknownNode(record.node_id.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    match internals.exit() {
        Ok(Some(exited)) => exited.deferred.drain(),
        Ok(None) => {}
        Err(e) => tracing::warn!("Exit hook failed during restore: {}", e),
    }

    let previous = internals.history();
    internals.replace_history(history)?;
    for entry in previous {
        entry.deferred.drain();
    }

    if let (Some(store), Some(state)) = (node.store(), &snapshot.store_state) {
        store.set(state.clone());
    }

    tracing::debug!("Restoring snapshot at '{}'", node.id());
    internals.enter(&node, snapshot.input.clone(), None)?;
    Ok(())
}

/// A recorded snapshot with its display label.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSnapshot {
    pub label: String,
    pub snapshot: WorkflowSnapshot,
}

/// `[kind][name]: Ready`, or `[kind]: Ready` for unnamed nodes.
pub fn label<A>(step: &CurrentStep<A>) -> String {
    match &step.name {
        Some(name) => format!("[{}][{}]: {}", step.kind, name, step.status.label()),
        None => format!("[{}]: {}", step.kind, step.status.label()),
    }
}

/// Records a snapshot for every status published while the workflow runs.
///
/// Dropping the recorder detaches it.
pub struct Recorder<A> {
    workflow: WeakWorkflow<A>,
    entries: Rc<RefCell<Vec<RecordedSnapshot>>>,
    subscription: Option<Subscription>,
}

impl<A: Clone + 'static> Recorder<A> {
    pub fn attach(workflow: &Workflow<A>) -> Self {
        let entries = Rc::new(RefCell::new(Vec::new()));
        let weak = workflow.downgrade();

        let sink = Rc::clone(&entries);
        let source = weak.clone();
        let subscription = workflow.subscribe(move |step| {
            let (Some(step), Some(workflow)) = (step, source.upgrade()) else {
                return;
            };
            if !workflow.is_running() {
                return;
            }
            let entry = RecordedSnapshot {
                label: label(step),
                snapshot: snapshot_of(&workflow, step),
            };
            tracing::trace!("Recorded {}", entry.label);
            sink.borrow_mut().push(entry);
        });

        Self {
            workflow: weak,
            entries,
            subscription: Some(subscription),
        }
    }

    pub fn entries(&self) -> Vec<RecordedSnapshot> {
        self.entries.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Pauses the workflow and restores the snapshot at `index`.
    pub fn jump_to(&self, index: usize) -> Result<(), PersistError> {
        let snapshot = self
            .entries
            .borrow()
            .get(index)
            .map(|e| e.snapshot.clone())
            .ok_or(PersistError::NoSuchSnapshot(index))?;
        let Some(workflow) = self.workflow.upgrade() else {
            return Err(PersistError::InvalidDocument(
                "workflow has been dropped".to_string(),
            ));
        };

        workflow.pause();
        restore(&workflow, &snapshot)
    }

    /// Drops every entry except the latest.
    pub fn commit(&self) {
        let mut entries = self.entries.borrow_mut();
        let keep = entries.len().saturating_sub(1);
        entries.drain(..keep);
    }
}

impl<A> Drop for Recorder<A> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{current, logged_workflow, sample_workflow};
    use serde_json::json;

    #[test]
    fn test_capture() {
        let (wf, nodes) = sample_workflow();
        assert!(capture(&wf).is_none());

        wf.start(&nodes.form, json!({"a": 1})).unwrap();
        nodes.form.store().unwrap().set(json!({"value": 2}));
        current(&wf).next.send(json!({"ok": true})).unwrap();

        let snap = capture(&wf).unwrap();
        assert_eq!(snap.status, TransitionStatus::Ready);
        assert_eq!(snap.node_id, "Review");
        assert_eq!(snap.input, json!({"ok": true}));
        assert_eq!(snap.store_state, None);
        assert_eq!(
            snap.history,
            vec![HistoryRecord {
                node_id: "Form:main".to_string(),
                input: json!({"a": 1}),
            }]
        );
    }

    #[test]
    fn test_restore_bypasses_edges() {
        let (wf, nodes, log) = logged_workflow();
        wf.start(&nodes.form, json!({})).unwrap();
        log.borrow_mut().clear();

        let snapshot = WorkflowSnapshot {
            status: TransitionStatus::Ready,
            node_id: "Done".to_string(),
            input: json!({"total": 3}),
            store_state: None,
            history: vec![
                HistoryRecord {
                    node_id: "Form:main".to_string(),
                    input: json!({}),
                },
                HistoryRecord {
                    node_id: "Review".to_string(),
                    input: json!({"ok": true}),
                },
            ],
        };
        restore(&wf, &snapshot).unwrap();

        let step = wf.current_step().unwrap();
        assert_eq!(step.id, "Done");
        assert_eq!(step.state.input, json!({"total": 3}));
        assert!(!step.can_go_back);
        assert_eq!(wf.history_len(), 2);
        assert_eq!(
            *log.borrow(),
            vec![
                "out:Form:main".to_string(),
                "in-cleanup:Form:main".to_string(),
                "in:Done".to_string(),
            ]
        );
    }

    #[test]
    fn test_restore_writes_store() {
        let (wf, nodes) = sample_workflow();
        wf.start(&nodes.review, json!(null)).unwrap();

        let snapshot = WorkflowSnapshot {
            status: TransitionStatus::Ready,
            node_id: "Form:main".to_string(),
            input: json!({}),
            store_state: Some(json!({"value": 42})),
            history: Vec::new(),
        };
        restore(&wf, &snapshot).unwrap();

        assert_eq!(nodes.form.store().unwrap().get(), json!({"value": 42}));
        assert_eq!(current(&wf).state, Some(json!({"value": 42})));
    }

    #[test]
    fn test_restore_unknown_node() {
        let (wf, nodes) = sample_workflow();
        wf.start(&nodes.form, json!({})).unwrap();

        let mut snapshot = capture(&wf).unwrap();
        snapshot.node_id = "Ghost".to_string();

        assert!(matches!(
            restore(&wf, &snapshot),
            Err(PersistError::UnknownNode(ref id)) if id == "Ghost"
        ));
        assert_eq!(wf.current_step().unwrap().id, "Form:main");
    }

    #[test]
    fn test_recorder_labels() {
        let (wf, nodes) = sample_workflow();
        let recorder = Recorder::attach(&wf);

        wf.start(&nodes.form, json!({})).unwrap();
        current(&wf).next.send(json!({"ok": true})).unwrap();

        let labels: Vec<String> = recorder.entries().into_iter().map(|e| e.label).collect();
        assert_eq!(
            labels,
            vec![
                "[Form][main]: Transition In",
                "[Form][main]: Ready",
                "[Form][main]: Transition Out",
                "[Review]: Transition In",
                "[Review]: Ready",
            ]
        );
    }

    #[test]
    fn test_recorder_ignores_paused_publishes() {
        let (wf, nodes) = sample_workflow();
        let recorder = Recorder::attach(&wf);
        wf.start(&nodes.form, json!({})).unwrap();
        let before = recorder.len();

        wf.pause();
        wf.internals().rebuild();

        assert_eq!(recorder.len(), before);
    }

    #[test]
    fn test_jump_to() {
        let (wf, nodes) = sample_workflow();
        let recorder = Recorder::attach(&wf);
        wf.start(&nodes.form, json!({"step": 1})).unwrap();
        current(&wf).next.send(json!({"ok": true})).unwrap();
        let recorded = recorder.len();

        recorder.jump_to(1).unwrap();

        assert!(!wf.is_running());
        let step = wf.current_step().unwrap();
        assert_eq!(step.id, "Form:main");
        assert_eq!(step.state.input, json!({"step": 1}));
        assert_eq!(wf.history_len(), 0);
        assert_eq!(recorder.len(), recorded);

        wf.resume();
        current(&wf).next.send(json!({"ok": true})).unwrap();
        assert_eq!(current(&wf).id, "Review");
    }

    #[test]
    fn test_jump_out_of_range() {
        let (wf, _) = sample_workflow();
        let recorder = Recorder::attach(&wf);
        assert!(matches!(
            recorder.jump_to(3),
            Err(PersistError::NoSuchSnapshot(3))
        ));
    }

    #[test]
    fn test_commit_keeps_latest() {
        let (wf, nodes) = sample_workflow();
        let recorder = Recorder::attach(&wf);
        wf.start(&nodes.form, json!({})).unwrap();
        current(&wf).next.send(json!({"ok": true})).unwrap();

        recorder.commit();

        let entries = recorder.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label, "[Review]: Ready");

        recorder.commit();
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn test_drop_detaches() {
        let (wf, nodes) = sample_workflow();
        let recorder = Recorder::attach(&wf);
        let entries = Rc::clone(&recorder.entries);
        drop(recorder);

        wf.start(&nodes.form, json!({})).unwrap();
        assert!(entries.borrow().is_empty());
    }
}
