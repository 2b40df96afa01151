//! Shared test workflow: `Form:main` -> `Review` -> `Done`.

use motif_core::{cleanup, Edge, Next, Schema, StepDefinition, Workflow};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;

pub type Log = Rc<RefCell<Vec<String>>>;

#[derive(Clone)]
pub struct Api {
    pub id: String,
    pub input: Value,
    pub state: Option<Value>,
    pub next: Next<Api>,
}

pub struct Nodes {
    pub form: motif_core::StepInstance<Api>,
    pub review: motif_core::StepInstance<Api>,
    pub done: motif_core::StepInstance<Api>,
}

fn definition(kind: &str, log: &Log) -> StepDefinition<Api> {
    let log = log.clone();
    StepDefinition::new(kind, move |ctx| {
        let id = ctx.id().to_string();
        let enter_log = log.clone();
        let exit_log = log.clone();
        ctx.transition_in(move || {
            enter_log.borrow_mut().push(format!("in:{}", id));
            let log = enter_log.clone();
            let id = id.clone();
            cleanup(move || log.borrow_mut().push(format!("in-cleanup:{}", id)))
        });
        let id = ctx.id().to_string();
        ctx.transition_out(move || {
            exit_log.borrow_mut().push(format!("out:{}", id));
        });
        Api {
            id: ctx.id().to_string(),
            input: ctx.input().clone(),
            state: ctx.state().cloned(),
            next: ctx.next(),
        }
    })
}

pub fn definitions(log: &Log) -> Vec<StepDefinition<Api>> {
    vec![
        definition("Form", log)
            .with_config(Schema::object([("title", Schema::string())]))
            .with_store(|| json!({"value": 0})),
        definition("Review", log),
        definition("Done", log),
    ]
}

/// Workflow with hook logging.
pub fn logged_workflow() -> (Workflow<Api>, Nodes, Log) {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let wf = Workflow::new(definitions(&log)).unwrap();
    let inventory = wf.internals().inventory();
    let nodes = Nodes {
        form: inventory["Form"]
            .create(Some("main"), Some(json!({"title": "Sign up"})))
            .unwrap(),
        review: inventory["Review"].instance(),
        done: inventory["Done"].instance(),
    };

    wf.register([nodes.form.clone(), nodes.review.clone(), nodes.done.clone()])
        .unwrap();
    wf.connect_edge(Edge::conditional_expr(&nodes.form, &nodes.review, "out.ok === true").unwrap())
        .unwrap();
    wf.connect_edge(
        Edge::transform_expr(&nodes.review, &nodes.done, "{ total: out.total }")
            .unwrap()
            .unidirectional(),
    )
    .unwrap();
    wf.connect(&nodes.review, &nodes.form, false).unwrap();

    (wf, nodes, log)
}

pub fn sample_workflow() -> (Workflow<Api>, Nodes) {
    let (wf, nodes, _) = logged_workflow();
    (wf, nodes)
}

/// A fresh workflow over the same kinds, with no graph.
pub fn empty_workflow() -> (Workflow<Api>, Log) {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    (Workflow::new(definitions(&log)).unwrap(), log)
}

pub fn current(wf: &Workflow<Api>) -> Api {
    wf.current_step().unwrap().state
}
