//! Transition engine - drives the active step through the workflow graph.
//!
//! The engine owns the registered nodes, the edge list, the history stack and
//! the [`Context`] of the active node. Every operation runs to completion
//! synchronously. Store changes never re-enter the engine directly: they mark
//! a rebuild as requested and the outermost operation drains the request when
//! it finishes.

use crate::context::{Context, DeferredCleanups, Registrations};
use crate::edge::{Edge, Transition};
use crate::effects::{self, ActiveEffect};
use crate::error::{HookPhase, WorkflowError};
use crate::hook::{self, Cleanup, HookOutcome};
use crate::step::{StepContext, StepDefinition, StepInstance};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Published lifecycle status of the active step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransitionStatus {
    TransitionIn,
    Ready,
    TransitionOut,
}

impl TransitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionStatus::TransitionIn => "transitionIn",
            TransitionStatus::Ready => "ready",
            TransitionStatus::TransitionOut => "transitionOut",
        }
    }

    /// Human readable label, e.g. `Transition In`.
    pub fn label(&self) -> &'static str {
        match self {
            TransitionStatus::TransitionIn => "Transition In",
            TransitionStatus::Ready => "Ready",
            TransitionStatus::TransitionOut => "Transition Out",
        }
    }
}

impl fmt::Display for TransitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable projection of the active step.
pub struct CurrentStep<A> {
    pub status: TransitionStatus,
    pub kind: String,
    pub name: Option<String>,
    pub id: String,
    /// API returned by the step's build function.
    pub state: A,
    pub can_go_back: bool,
    pub instance: StepInstance<A>,
}

impl<A: Clone> Clone for CurrentStep<A> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            kind: self.kind.clone(),
            name: self.name.clone(),
            id: self.id.clone(),
            state: self.state.clone(),
            can_go_back: self.can_go_back,
            instance: self.instance.clone(),
        }
    }
}

impl<A> fmt::Debug for CurrentStep<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentStep")
            .field("status", &self.status)
            .field("id", &self.id)
            .field("can_go_back", &self.can_go_back)
            .finish()
    }
}

/// A previously visited node.
pub struct HistoryEntry<A> {
    pub node: StepInstance<A>,
    pub input: Value,
    /// Exit-hook cleanups captured when the node was left.
    pub deferred: DeferredCleanups,
}

impl<A> HistoryEntry<A> {
    /// Entry with an empty cleanup bucket.
    pub fn new(node: StepInstance<A>, input: Value) -> Self {
        Self {
            node,
            input,
            deferred: DeferredCleanups::new(),
        }
    }
}

impl<A> Clone for HistoryEntry<A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            input: self.input.clone(),
            deferred: self.deferred.clone(),
        }
    }
}

impl<A> fmt::Debug for HistoryEntry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryEntry")
            .field("node", &self.node.id())
            .field("input", &self.input)
            .field("deferred", &self.deferred)
            .finish()
    }
}

type Subscriber<A> = Rc<dyn Fn(Option<&CurrentStep<A>>)>;

struct EngineState<A> {
    nodes: Vec<StepInstance<A>>,
    edges: Vec<Edge<A>>,
    history: Vec<HistoryEntry<A>>,
    active: Option<StepInstance<A>>,
    context: Option<Context>,
    current: Option<CurrentStep<A>>,
}

struct Shared<A> {
    inventory: BTreeMap<String, StepDefinition<A>>,
    state: RefCell<EngineState<A>>,
    subscribers: RefCell<Vec<(u64, Subscriber<A>)>>,
    next_subscriber: Cell<u64>,
    running: Cell<bool>,
    /// Last issued context version.
    version: Cell<u64>,
    /// Nesting depth of engine operations.
    depth: Cell<usize>,
    rebuild_requested: Cell<Option<u64>>,
    /// Id of the step whose build function is executing.
    building: RefCell<Option<String>>,
}

/// A workflow over steps whose API type is `A`.
///
/// Cloning yields another handle to the same workflow.
pub struct Workflow<A> {
    shared: Rc<Shared<A>>,
}

impl<A> Clone for Workflow<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<A> fmt::Debug for Workflow<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Workflow")
            .field("kinds", &self.shared.inventory.keys().collect::<Vec<_>>())
            .field("nodes", &state.nodes.len())
            .field("edges", &state.edges.len())
            .field("history", &state.history.len())
            .field("active", &state.active.as_ref().map(|n| n.id()))
            .field("running", &self.shared.running.get())
            .finish()
    }
}

/// Non-owning handle to a [`Workflow`].
pub struct WeakWorkflow<A> {
    shared: Weak<Shared<A>>,
}

impl<A> Clone for WeakWorkflow<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<A> WeakWorkflow<A> {
    pub fn upgrade(&self) -> Option<Workflow<A>> {
        self.shared.upgrade().map(|shared| Workflow { shared })
    }
}

/// Handle returned by [`Workflow::subscribe`].
pub struct Subscription {
    detach: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// Sends a step's output to the engine.
pub struct Next<A> {
    shared: Weak<Shared<A>>,
    node: StepInstance<A>,
}

impl<A> Clone for Next<A> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
            node: self.node.clone(),
        }
    }
}

impl<A> fmt::Debug for Next<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("step", &self.node.id()).finish()
    }
}

impl<A: Clone + 'static> Next<A> {
    /// Moves the workflow forward with `output`. A no-op while paused.
    pub fn send(&self, output: Value) -> Result<(), WorkflowError> {
        match self.shared.upgrade() {
            Some(shared) => Workflow { shared }.send_from(&self.node, output),
            None => Err(WorkflowError::StepNotActive {
                step: self.node.id().to_string(),
            }),
        }
    }
}

impl<A> Next<A> {
    pub fn step_id(&self) -> &str {
        self.node.id()
    }
}

impl<A: Clone + 'static> Workflow<A> {
    /// Creates a workflow over the given step definitions.
    pub fn new<I>(definitions: I) -> Result<Self, WorkflowError>
    where
        I: IntoIterator<Item = StepDefinition<A>>,
    {
        let mut inventory = BTreeMap::new();
        for definition in definitions {
            let kind = definition.kind().to_string();
            if inventory.insert(kind.clone(), definition).is_some() {
                return Err(WorkflowError::registration(format!(
                    "duplicate step kind '{}' in inventory",
                    kind
                )));
            }
        }

        Ok(Self {
            shared: Rc::new(Shared {
                inventory,
                state: RefCell::new(EngineState {
                    nodes: Vec::new(),
                    edges: Vec::new(),
                    history: Vec::new(),
                    active: None,
                    context: None,
                    current: None,
                }),
                subscribers: RefCell::new(Vec::new()),
                next_subscriber: Cell::new(0),
                running: Cell::new(false),
                version: Cell::new(0),
                depth: Cell::new(0),
                rebuild_requested: Cell::new(None),
                building: RefCell::new(None),
            }),
        })
    }

    // =========================================================================
    // Graph
    // =========================================================================

    /// Adds nodes to the graph. Registering an instance twice is a no-op.
    pub fn register<I>(&self, instances: I) -> Result<(), WorkflowError>
    where
        I: IntoIterator<Item = StepInstance<A>>,
    {
        let mut state = self.shared.state.borrow_mut();
        let mut staged: Vec<StepInstance<A>> = Vec::new();

        for instance in instances {
            self.check_kind(&instance)?;
            instance
                .definition()
                .check_config(instance.name(), instance.config())?;
            let existing = state
                .nodes
                .iter()
                .chain(staged.iter())
                .find(|n| n.id() == instance.id());
            match existing {
                Some(node) if node.same(&instance) => {}
                Some(_) => {
                    return Err(WorkflowError::registration(format!(
                        "another step is already registered as '{}'",
                        instance.id()
                    )))
                }
                None => staged.push(instance),
            }
        }

        state.nodes.extend(staged);
        Ok(())
    }

    /// Adds a pass-through edge. A unidirectional edge cannot be navigated back across.
    pub fn connect(
        &self,
        from: &StepInstance<A>,
        to: &StepInstance<A>,
        unidirectional: bool,
    ) -> Result<(), WorkflowError> {
        self.connect_edge(Edge::new(from, to).with_unidirectional(unidirectional))
    }

    /// Adds an edge. Outgoing edges are tried in the order they were added.
    pub fn connect_edge(&self, edge: Edge<A>) -> Result<(), WorkflowError> {
        let mut state = self.shared.state.borrow_mut();
        ensure_registered(&state, edge.from())?;
        ensure_registered(&state, edge.to())?;
        state.edges.push(edge);
        Ok(())
    }

    fn check_kind(&self, instance: &StepInstance<A>) -> Result<(), WorkflowError> {
        if self.shared.inventory.contains_key(instance.kind()) {
            Ok(())
        } else {
            Err(WorkflowError::registration(format!(
                "step kind '{}' is not in the inventory",
                instance.kind()
            )))
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts (or restarts) the workflow at `node`.
    pub fn start(&self, node: &StepInstance<A>, input: Value) -> Result<(), WorkflowError> {
        ensure_registered(&self.shared.state.borrow(), node)?;
        let input = node.validate_input(&input)?;

        self.shared.running.set(true);
        tracing::debug!("Starting workflow at '{}'", node.id());

        self.operation(|wf| {
            wf.exit_discarding()?;
            wf.enter(node.clone(), input, None)
        })
    }

    /// Freezes the workflow: effects and the store subscription are torn down,
    /// the active node, its input and the history are kept.
    pub fn pause(&self) {
        if !self.shared.running.replace(false) {
            return;
        }
        self.shared.rebuild_requested.set(None);

        let (live, subscription) = {
            let mut state = self.shared.state.borrow_mut();
            match state.context.as_mut() {
                Some(ctx) => (
                    std::mem::take(&mut ctx.effects),
                    ctx.store_subscription.take(),
                ),
                None => (Vec::new(), None),
            }
        };
        effects::teardown(live);
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }

        tracing::debug!("Workflow paused");
    }

    /// Re-subscribes to the active store and rebuilds once.
    pub fn resume(&self) {
        if self.shared.running.replace(true) {
            return;
        }
        tracing::debug!("Workflow resumed");

        self.operation(|wf| {
            wf.subscribe_store();
            wf.rebuild();
        });
    }

    /// Pauses, then exits and discards the active node.
    ///
    /// Exit hooks do not run; the graph and the history are kept.
    pub fn stop(&self) {
        self.pause();
        self.operation(|wf| {
            // paused, so no exit hook runs and nothing can fail
            if let (Some(entry), _) = wf.teardown_active(false) {
                entry.deferred.drain();
            }
            wf.notify(None);
        });
        tracing::debug!("Workflow stopped");
    }

    /// Returns to the previous node.
    ///
    /// A no-op without history. Fails without touching any state if the edge
    /// that led here is unidirectional. While paused the navigation still
    /// happens, but exit hooks are skipped and the re-entered step's
    /// registrations are discarded until [`Workflow::resume`] rebuilds it.
    pub fn go_back(&self) -> Result<(), WorkflowError> {
        self.operation(|wf| wf.back())
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn current_step(&self) -> Option<CurrentStep<A>> {
        self.shared.state.borrow().current.clone()
    }

    /// Calls `callback` with every published status. `None` after a stop.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<&CurrentStep<A>>) + 'static,
    {
        let id = self.shared.next_subscriber.get();
        self.shared.next_subscriber.set(id + 1);
        self.shared
            .subscribers
            .borrow_mut()
            .push((id, Rc::new(callback)));

        let shared = Rc::downgrade(&self.shared);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.subscribers.borrow_mut().retain(|(i, _)| *i != id);
                }
            })),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    pub fn history_len(&self) -> usize {
        self.shared.state.borrow().history.len()
    }

    /// Handle that does not keep the workflow alive.
    pub fn downgrade(&self) -> WeakWorkflow<A> {
        WeakWorkflow {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// Privileged access for adapters such as persistence and time travel.
    pub fn internals(&self) -> Internals<'_, A> {
        Internals { workflow: self }
    }

    // =========================================================================
    // Engine
    // =========================================================================

    fn operation<T>(&self, f: impl FnOnce(&Self) -> T) -> T {
        let depth = &self.shared.depth;
        depth.set(depth.get() + 1);
        let result = f(self);
        depth.set(depth.get() - 1);
        if depth.get() == 0 {
            self.settle();
        }
        result
    }

    /// Drains rebuild requests raised while an operation was in progress.
    fn settle(&self) {
        while let Some(version) = self.shared.rebuild_requested.take() {
            if self.shared.running.get() && self.is_current(version) {
                let depth = &self.shared.depth;
                depth.set(depth.get() + 1);
                self.rebuild();
                depth.set(depth.get() - 1);
            }
        }
    }

    fn request_rebuild(&self, version: u64) {
        if !self.shared.running.get() {
            return;
        }
        self.shared.rebuild_requested.set(Some(version));
        if self.shared.depth.get() == 0 {
            self.settle();
        }
    }

    fn context_version(&self) -> Option<u64> {
        self.shared.state.borrow().context.as_ref().map(|c| c.version)
    }

    fn is_current(&self, version: u64) -> bool {
        self.context_version() == Some(version)
    }

    fn send_from(&self, node: &StepInstance<A>, output: Value) -> Result<(), WorkflowError> {
        if !self.shared.running.get() {
            return Ok(());
        }
        if self.shared.building.borrow().as_deref() == Some(node.id()) {
            return Err(WorkflowError::ReentrantTransition {
                step: node.id().to_string(),
            });
        }
        let is_active = self
            .shared
            .state
            .borrow()
            .active
            .as_ref()
            .map_or(false, |active| active.same(node));
        if !is_active {
            return Err(WorkflowError::StepNotActive {
                step: node.id().to_string(),
            });
        }

        self.operation(|wf| wf.forward(node, output))
    }

    fn forward(&self, node: &StepInstance<A>, output: Value) -> Result<(), WorkflowError> {
        let output = node.validate_output(&output)?;

        let outgoing: Vec<Edge<A>> = self
            .shared
            .state
            .borrow()
            .edges
            .iter()
            .filter(|e| e.from().same(node))
            .cloned()
            .collect();

        if outgoing.is_empty() {
            self.exit_discarding()?;
            return Err(WorkflowError::NoNextStep {
                step: node.id().to_string(),
            });
        }

        let mut chosen = None;
        for edge in outgoing {
            if let Transition::Allow { next_input } = edge.validate_transition(&output)? {
                chosen = Some((edge, next_input));
                break;
            }
        }
        let Some((edge, next_input)) = chosen else {
            self.exit_discarding()?;
            return Err(WorkflowError::TransitionBlocked {
                step: node.id().to_string(),
            });
        };

        let next_input = edge.to().validate_input(&next_input)?;

        tracing::debug!(
            "Transition '{}' -> '{}' ({} edge)",
            node.id(),
            edge.to().id(),
            edge.kind()
        );

        if let Some(exited) = self.exit()? {
            self.shared.state.borrow_mut().history.push(exited);
        }
        self.enter(edge.to().clone(), next_input, None)
    }

    fn back(&self) -> Result<(), WorkflowError> {
        {
            let state = self.shared.state.borrow();
            let Some(entry) = state.history.last() else {
                return Ok(());
            };
            if let Some(active) = &state.active {
                let edge = connecting_edge(&state.edges, &entry.node, active);
                if edge.map_or(false, Edge::is_unidirectional) {
                    return Err(WorkflowError::Navigation {
                        from: entry.node.id().to_string(),
                        to: active.id().to_string(),
                    });
                }
            }
        }

        self.exit_discarding()?;

        let Some(entry) = self.shared.state.borrow_mut().history.pop() else {
            return Ok(());
        };
        tracing::debug!("Navigating back to '{}'", entry.node.id());
        self.enter(entry.node, entry.input, Some(entry.deferred))
    }

    fn build(&self, node: &StepInstance<A>, input: &Value) -> (A, Registrations) {
        let next = Next {
            shared: Rc::downgrade(&self.shared),
            node: node.clone(),
        };
        let ctx = StepContext::new(node.clone(), input.clone(), self.shared.running.get(), next);

        let previous = self.shared.building.replace(Some(node.id().to_string()));
        let api = node.build(&ctx);
        self.shared.building.replace(previous);

        (api, ctx.into_registrations())
    }

    fn enter(
        &self,
        node: StepInstance<A>,
        input: Value,
        back: Option<DeferredCleanups>,
    ) -> Result<(), WorkflowError> {
        if let Some(deferred) = back {
            deferred.drain();
        }

        let version = self.shared.version.get() + 1;
        self.shared.version.set(version);
        tracing::debug!("Entering '{}' (version {})", node.id(), version);

        let (api, registrations) = self.build(&node, &input);
        let Registrations {
            in_hooks,
            out_hooks,
            effects: effect_defs,
        } = registrations;

        {
            let mut state = self.shared.state.borrow_mut();
            state.active = Some(node.clone());
            state.context = Some(Context::new(version, input, out_hooks));
        }
        if self.shared.running.get() {
            self.subscribe_store();
        }

        self.publish(TransitionStatus::TransitionIn, api.clone());

        let mut failure = None;
        for (index, hook) in in_hooks.into_iter().enumerate() {
            if !self.is_current(version) {
                break;
            }
            match hook() {
                HookOutcome::Done => {}
                HookOutcome::Cleanup(cleanup) => self.keep_in_cleanup(version, cleanup),
                HookOutcome::Pending(pending) => {
                    let shared = Rc::downgrade(&self.shared);
                    hook::spawn_pending(
                        pending,
                        node.id().to_string(),
                        HookPhase::TransitionIn,
                        index,
                        move |cleanup| match shared.upgrade() {
                            Some(shared) => Workflow { shared }.keep_in_cleanup(version, cleanup),
                            None => cleanup(),
                        },
                    );
                }
                HookOutcome::Failed(e) => {
                    failure = Some(WorkflowError::Hook {
                        step: node.id().to_string(),
                        phase: HookPhase::TransitionIn,
                        reason: e.reason().to_string(),
                    });
                    break;
                }
            }
        }

        // a hook may have moved the workflow on already
        if self.is_current(version) {
            if let Some(ctx) = self.shared.state.borrow_mut().context.as_mut() {
                ctx.has_run_in = true;
            }

            let live = effects::reconcile(effect_defs, Vec::new());
            self.adopt_effects(version, live);

            if self.is_current(version) {
                self.publish(TransitionStatus::Ready, api);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs the exit sequence for the active node, if any.
    fn exit(&self) -> Result<Option<HistoryEntry<A>>, WorkflowError> {
        let (exited, failure) = self.teardown_active(self.shared.running.get());
        match failure {
            Some(e) => {
                // the entry never reaches history
                if let Some(entry) = exited {
                    entry.deferred.drain();
                }
                Err(e)
            }
            None => Ok(exited),
        }
    }

    /// Exit sequence for an entry that is not kept in history: its exit
    /// cleanups run right away.
    fn exit_discarding(&self) -> Result<(), WorkflowError> {
        if let Some(entry) = self.exit()? {
            entry.deferred.drain();
        }
        Ok(())
    }

    /// Exit sequence. Teardown always completes; a failed exit hook is
    /// reported alongside the exited entry.
    fn teardown_active(&self, run_hooks: bool) -> (Option<HistoryEntry<A>>, Option<WorkflowError>) {
        let api = self
            .shared
            .state
            .borrow()
            .current
            .as_ref()
            .map(|c| c.state.clone());
        if let Some(api) = api {
            self.publish(TransitionStatus::TransitionOut, api);
        }

        let (node, context) = {
            let mut state = self.shared.state.borrow_mut();
            state.current = None;
            (state.active.take(), state.context.take())
        };
        let (Some(node), Some(context)) = (node, context) else {
            return (None, None);
        };
        tracing::debug!("Exiting '{}' (version {})", node.id(), context.version);

        let Context {
            input,
            out_hooks,
            in_cleanups,
            effects: live,
            store_subscription,
            ..
        } = context;

        let deferred = DeferredCleanups::new();
        let mut failure = None;
        if run_hooks {
            for (index, hook) in out_hooks.into_iter().enumerate() {
                match hook() {
                    HookOutcome::Done => {}
                    HookOutcome::Cleanup(cleanup) => deferred.push(cleanup),
                    HookOutcome::Pending(pending) => {
                        let bucket = deferred.clone();
                        hook::spawn_pending(
                            pending,
                            node.id().to_string(),
                            HookPhase::TransitionOut,
                            index,
                            move |cleanup| bucket.push(cleanup),
                        );
                    }
                    HookOutcome::Failed(e) => {
                        failure = Some(WorkflowError::Hook {
                            step: node.id().to_string(),
                            phase: HookPhase::TransitionOut,
                            reason: e.reason().to_string(),
                        });
                        break;
                    }
                }
            }
        }

        effects::teardown(live);
        for cleanup in in_cleanups {
            cleanup();
        }
        if let Some(subscription) = store_subscription {
            subscription.unsubscribe();
        }

        let entry = HistoryEntry {
            node,
            input,
            deferred,
        };
        (Some(entry), failure)
    }

    /// Re-runs the active step's build with the same input.
    ///
    /// While paused the build still runs, but its registrations are discarded.
    fn rebuild(&self) {
        let (node, input, version) = {
            let state = self.shared.state.borrow();
            match (&state.active, &state.context) {
                (Some(node), Some(ctx)) => (node.clone(), ctx.input.clone(), ctx.version),
                _ => return,
            }
        };
        tracing::debug!("Rebuilding '{}' (version {})", node.id(), version);

        let (api, registrations) = self.build(&node, &input);
        if !self.is_current(version) {
            return;
        }

        if self.shared.running.get() {
            let Registrations {
                out_hooks,
                effects: effect_defs,
                ..
            } = registrations;
            let previous = match self.shared.state.borrow_mut().context.as_mut() {
                Some(ctx) => {
                    ctx.out_hooks = out_hooks;
                    std::mem::take(&mut ctx.effects)
                }
                None => Vec::new(),
            };
            let live = effects::reconcile(effect_defs, previous);
            self.adopt_effects(version, live);
            if !self.is_current(version) {
                return;
            }
        }

        self.publish(TransitionStatus::Ready, api);
    }

    fn subscribe_store(&self) {
        let mut state = self.shared.state.borrow_mut();
        let EngineState {
            active, context, ..
        } = &mut *state;
        let (Some(node), Some(ctx)) = (active.as_ref(), context.as_mut()) else {
            return;
        };
        let Some(store) = node.store() else {
            return;
        };
        if ctx.store_subscription.is_some() {
            return;
        }

        let version = ctx.version;
        let shared = Rc::downgrade(&self.shared);
        ctx.store_subscription = Some(store.subscribe(move || {
            if let Some(shared) = shared.upgrade() {
                Workflow { shared }.request_rebuild(version);
            }
        }));
    }

    /// Keeps an enter-hook cleanup on its Context, or runs it if that Context is gone.
    fn keep_in_cleanup(&self, version: u64, cleanup: Cleanup) {
        let superseded = {
            let mut state = self.shared.state.borrow_mut();
            match state.context.as_mut() {
                Some(ctx) if ctx.version == version => {
                    ctx.in_cleanups.push(cleanup);
                    None
                }
                _ => Some(cleanup),
            }
        };
        if let Some(cleanup) = superseded {
            tracing::trace!("Context version {} superseded, running cleanup now", version);
            cleanup();
        }
    }

    fn adopt_effects(&self, version: u64, live: Vec<ActiveEffect>) {
        let superseded = {
            let mut state = self.shared.state.borrow_mut();
            match state.context.as_mut() {
                Some(ctx) if ctx.version == version => {
                    ctx.effects = live;
                    None
                }
                _ => Some(live),
            }
        };
        if let Some(live) = superseded {
            effects::teardown(live);
        }
    }

    fn publish(&self, status: TransitionStatus, api: A) {
        let step = {
            let mut state = self.shared.state.borrow_mut();
            let Some(node) = state.active.clone() else {
                return;
            };
            let step = CurrentStep {
                status,
                kind: node.kind().to_string(),
                name: node.name().map(str::to_string),
                id: node.id().to_string(),
                state: api,
                can_go_back: status == TransitionStatus::Ready && can_go_back(&state),
                instance: node,
            };
            state.current = Some(step.clone());
            step
        };
        self.notify(Some(&step));
    }

    fn notify(&self, step: Option<&CurrentStep<A>>) {
        let subscribers: Vec<Subscriber<A>> = self
            .shared
            .subscribers
            .borrow()
            .iter()
            .map(|(_, s)| Rc::clone(s))
            .collect();
        for subscriber in subscribers {
            subscriber(step);
        }
    }
}

fn ensure_registered<A>(state: &EngineState<A>, node: &StepInstance<A>) -> Result<(), WorkflowError> {
    if state.nodes.iter().any(|n| n.same(node)) {
        Ok(())
    } else {
        Err(WorkflowError::registration(format!(
            "step '{}' is not registered",
            node.id()
        )))
    }
}

/// First registered edge from `from` to `to`.
fn connecting_edge<'a, A>(
    edges: &'a [Edge<A>],
    from: &StepInstance<A>,
    to: &StepInstance<A>,
) -> Option<&'a Edge<A>> {
    edges.iter().find(|e| e.connects(from, to))
}

fn can_go_back<A>(state: &EngineState<A>) -> bool {
    match (state.history.last(), state.active.as_ref()) {
        (Some(entry), Some(active)) => {
            !connecting_edge(&state.edges, &entry.node, active).map_or(false, Edge::is_unidirectional)
        }
        _ => false,
    }
}

/// Raw engine access for trusted adapters.
///
/// These calls bypass edge validation and input validation.
pub struct Internals<'a, A> {
    workflow: &'a Workflow<A>,
}

impl<'a, A: Clone + 'static> Internals<'a, A> {
    pub fn nodes(&self) -> Vec<StepInstance<A>> {
        self.workflow.shared.state.borrow().nodes.clone()
    }

    pub fn edges(&self) -> Vec<Edge<A>> {
        self.workflow.shared.state.borrow().edges.clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry<A>> {
        self.workflow.shared.state.borrow().history.clone()
    }

    /// Kind -> definition.
    pub fn inventory(&self) -> &'a BTreeMap<String, StepDefinition<A>> {
        &self.workflow.shared.inventory
    }

    pub fn node(&self, id: &str) -> Option<StepInstance<A>> {
        self.workflow
            .shared
            .state
            .borrow()
            .nodes
            .iter()
            .find(|n| n.id() == id)
            .cloned()
    }

    pub fn active_node(&self) -> Option<StepInstance<A>> {
        self.workflow.shared.state.borrow().active.clone()
    }

    pub fn active_input(&self) -> Option<Value> {
        self.workflow
            .shared
            .state
            .borrow()
            .context
            .as_ref()
            .map(|c| c.input.clone())
    }

    pub fn context_version(&self) -> Option<u64> {
        self.workflow.context_version()
    }

    pub fn is_running(&self) -> bool {
        self.workflow.is_running()
    }

    /// Enters `node` directly. The active node must have been exited first.
    pub fn enter(
        &self,
        node: &StepInstance<A>,
        input: Value,
        back: Option<DeferredCleanups>,
    ) -> Result<(), WorkflowError> {
        ensure_registered(&self.workflow.shared.state.borrow(), node)?;
        self.workflow
            .operation(|wf| wf.enter(node.clone(), input, back))
    }

    /// Runs the exit sequence and returns what a forward transition would push.
    pub fn exit(&self) -> Result<Option<HistoryEntry<A>>, WorkflowError> {
        self.workflow.operation(|wf| wf.exit())
    }

    pub fn rebuild(&self) {
        self.workflow.operation(|wf| wf.rebuild());
    }

    /// Replaces every node and edge.
    pub fn replace_graph(
        &self,
        nodes: Vec<StepInstance<A>>,
        edges: Vec<Edge<A>>,
    ) -> Result<(), WorkflowError> {
        for (i, node) in nodes.iter().enumerate() {
            self.workflow.check_kind(node)?;
            if nodes[..i].iter().any(|n| n.id() == node.id()) {
                return Err(WorkflowError::registration(format!(
                    "duplicate node id '{}'",
                    node.id()
                )));
            }
        }
        for edge in &edges {
            for end in [edge.from(), edge.to()] {
                if !nodes.iter().any(|n| n.same(end)) {
                    return Err(WorkflowError::registration(format!(
                        "edge endpoint '{}' is not among the nodes",
                        end.id()
                    )));
                }
            }
        }

        let mut state = self.workflow.shared.state.borrow_mut();
        state.nodes = nodes;
        state.edges = edges;
        Ok(())
    }

    pub fn replace_history(&self, entries: Vec<HistoryEntry<A>>) -> Result<(), WorkflowError> {
        let mut state = self.workflow.shared.state.borrow_mut();
        for entry in &entries {
            ensure_registered(&state, &entry.node)?;
        }
        state.history = entries;
        Ok(())
    }

    /// Exits the active node and empties the history, running any cleanups it held.
    pub fn clear(&self) -> Result<(), WorkflowError> {
        self.workflow.operation(|wf| {
            let result = wf.exit_discarding();
            let history = std::mem::take(&mut wf.shared.state.borrow_mut().history);
            for entry in history {
                entry.deferred.drain();
            }
            wf.notify(None);
            result
        })
    }

    /// Sets the running flag without touching effects or the store subscription.
    pub fn set_running(&self, running: bool) {
        self.workflow.shared.running.set(running);
    }
}
