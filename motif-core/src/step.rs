//! Step definitions, instances and the per-entry build context.
//!
//! A [`StepDefinition`] describes a kind of step: its validators, its store
//! factory and the build function that turns a [`StepContext`] into the
//! consumer-facing API `A`. A [`StepInstance`] is one placement of that
//! definition in a workflow graph.

use crate::context::Registrations;
use crate::effects::{Deps, EffectDef};
use crate::error::{SchemaTarget, WorkflowError};
use crate::hook::{Cleanup, HookOutcome};
use crate::schema::Schema;
use crate::store::Store;
use crate::workflow::Next;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

type BuildFn<A> = Rc<dyn Fn(&StepContext<A>) -> A>;
type StoreFactory = Rc<dyn Fn() -> Value>;

/// A kind of step.
pub struct StepDefinition<A> {
    kind: String,
    input: Option<Schema>,
    output: Option<Schema>,
    config: Option<Schema>,
    store: Option<StoreFactory>,
    build: BuildFn<A>,
}

impl<A> Clone for StepDefinition<A> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            build: Rc::clone(&self.build),
        }
    }
}

impl<A> fmt::Debug for StepDefinition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("kind", &self.kind)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("config", &self.config)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

impl<A: 'static> StepDefinition<A> {
    /// Creates a definition with no validators and no store.
    pub fn new<F>(kind: impl Into<String>, build: F) -> Self
    where
        F: Fn(&StepContext<A>) -> A + 'static,
    {
        Self {
            kind: kind.into(),
            input: None,
            output: None,
            config: None,
            store: None,
            build: Rc::new(build),
        }
    }

    pub fn with_input(mut self, schema: Schema) -> Self {
        self.input = Some(schema);
        self
    }

    pub fn with_output(mut self, schema: Schema) -> Self {
        self.output = Some(schema);
        self
    }

    pub fn with_config(mut self, schema: Schema) -> Self {
        self.config = Some(schema);
        self
    }

    /// Gives every instance its own store, initialised from `factory`.
    pub fn with_store<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Value + 'static,
    {
        self.store = Some(Rc::new(factory));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn input_schema(&self) -> Option<&Schema> {
        self.input.as_ref()
    }

    pub fn output_schema(&self) -> Option<&Schema> {
        self.output.as_ref()
    }

    pub fn config_schema(&self) -> Option<&Schema> {
        self.config.as_ref()
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Unnamed instance without config.
    ///
    /// If the definition declares a config schema, the instance must accept
    /// a missing config or [`Workflow::register`](crate::Workflow::register)
    /// rejects it; use [`StepDefinition::create`] to supply one.
    pub fn instance(&self) -> StepInstance<A> {
        self.materialize(None, None)
    }

    /// Named instance without config. See [`StepDefinition::instance`].
    pub fn named(&self, name: impl Into<String>) -> StepInstance<A> {
        self.materialize(Some(name.into()), None)
    }

    /// Creates an instance, validating `config` against the config schema.
    ///
    /// A declared schema always runs; an absent config is checked as `null`.
    pub fn create(
        &self,
        name: Option<&str>,
        config: Option<Value>,
    ) -> Result<StepInstance<A>, WorkflowError> {
        let config = self.check_config(name, config.as_ref())?;
        Ok(self.materialize(name.map(str::to_string), config))
    }

    /// Parses `config` with the config schema, if one is declared.
    pub(crate) fn check_config(
        &self,
        name: Option<&str>,
        config: Option<&Value>,
    ) -> Result<Option<Value>, WorkflowError> {
        let Some(schema) = &self.config else {
            return Ok(config.cloned());
        };
        let parsed = schema
            .parse(config.unwrap_or(&Value::Null))
            .map_err(|reason| WorkflowError::SchemaValidation {
                step: instance_id(&self.kind, name),
                target: SchemaTarget::Config,
                reason,
            })?;
        // an optional schema accepting a missing config leaves it missing
        if config.is_none() && parsed.is_null() {
            Ok(None)
        } else {
            Ok(Some(parsed))
        }
    }

    fn materialize(&self, name: Option<String>, config: Option<Value>) -> StepInstance<A> {
        let id = instance_id(&self.kind, name.as_deref());
        let store = self.store.as_ref().map(|factory| Store::new(factory()));
        StepInstance {
            inner: Rc::new(InstanceInner {
                definition: self.clone(),
                name,
                id,
                config,
                store,
            }),
        }
    }
}

fn instance_id(kind: &str, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{}:{}", kind, name),
        None => kind.to_string(),
    }
}

struct InstanceInner<A> {
    definition: StepDefinition<A>,
    name: Option<String>,
    id: String,
    config: Option<Value>,
    store: Option<Store>,
}

/// A step placed in a workflow graph.
///
/// Cloning shares the instance; identity is pointer identity ([`StepInstance::same`]).
pub struct StepInstance<A> {
    inner: Rc<InstanceInner<A>>,
}

impl<A> Clone for StepInstance<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A> fmt::Debug for StepInstance<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepInstance")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("store", &self.inner.store)
            .finish()
    }
}

impl<A> StepInstance<A> {
    /// `kind` or `kind:name`.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> &str {
        &self.inner.definition.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn config(&self) -> Option<&Value> {
        self.inner.config.as_ref()
    }

    pub fn store(&self) -> Option<&Store> {
        self.inner.store.as_ref()
    }

    pub fn definition(&self) -> &StepDefinition<A> {
        &self.inner.definition
    }

    /// True if both handles point to the same instance.
    pub fn same(&self, other: &StepInstance<A>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Validates a value about to become this step's input.
    pub fn validate_input(&self, input: &Value) -> Result<Value, WorkflowError> {
        self.validate(self.inner.definition.input.as_ref(), SchemaTarget::Input, input)
    }

    /// Validates an output produced by this step.
    pub fn validate_output(&self, output: &Value) -> Result<Value, WorkflowError> {
        self.validate(
            self.inner.definition.output.as_ref(),
            SchemaTarget::Output,
            output,
        )
    }

    fn validate(
        &self,
        schema: Option<&Schema>,
        target: SchemaTarget,
        value: &Value,
    ) -> Result<Value, WorkflowError> {
        match schema {
            None => Ok(value.clone()),
            Some(schema) => schema
                .parse(value)
                .map_err(|reason| WorkflowError::SchemaValidation {
                    step: self.inner.id.clone(),
                    target,
                    reason,
                }),
        }
    }

    pub(crate) fn build(&self, ctx: &StepContext<A>) -> A {
        (self.inner.definition.build)(ctx)
    }
}

/// What a step body sees while it is being built.
///
/// Registration calls are ignored while the workflow is paused.
pub struct StepContext<A> {
    instance: StepInstance<A>,
    input: Value,
    state: Option<Value>,
    accepting: bool,
    registrations: RefCell<Registrations>,
    next: Next<A>,
}

impl<A> StepContext<A> {
    pub(crate) fn new(instance: StepInstance<A>, input: Value, accepting: bool, next: Next<A>) -> Self {
        let state = instance.store().map(Store::get);
        Self {
            instance,
            input,
            state,
            accepting,
            registrations: RefCell::new(Registrations::default()),
            next,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.instance.name()
    }

    pub fn kind(&self) -> &str {
        self.instance.kind()
    }

    pub fn id(&self) -> &str {
        self.instance.id()
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn config(&self) -> Option<&Value> {
        self.instance.config()
    }

    /// Handle to the step's store, for mutation from hooks and effects.
    pub fn store(&self) -> Option<&Store> {
        self.instance.store()
    }

    /// Store state as it was when this build started.
    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    /// False while the workflow is paused.
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Registers a hook run once when the step is entered.
    pub fn transition_in<F, R>(&self, hook: F)
    where
        F: FnOnce() -> R + 'static,
        R: Into<HookOutcome>,
    {
        if self.accepting {
            self.registrations
                .borrow_mut()
                .in_hooks
                .push(Box::new(move || hook().into()));
        }
    }

    /// Registers a hook run when the step is left.
    pub fn transition_out<F, R>(&self, hook: F)
    where
        F: FnOnce() -> R + 'static,
        R: Into<HookOutcome>,
    {
        if self.accepting {
            self.registrations
                .borrow_mut()
                .out_hooks
                .push(Box::new(move || hook().into()));
        }
    }

    /// Registers an effect, reconciled against the previous build by position.
    pub fn effect<F>(&self, run: F, deps: Deps)
    where
        F: FnOnce() -> Option<Cleanup> + 'static,
    {
        if self.accepting {
            self.registrations.borrow_mut().effects.push(EffectDef {
                run: Box::new(run),
                deps,
            });
        }
    }

    /// Handle for sending this step's output to the engine.
    pub fn next(&self) -> Next<A> {
        self.next.clone()
    }

    pub(crate) fn into_registrations(self) -> Registrations {
        self.registrations.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> StepDefinition<()> {
        StepDefinition::new("Form", |_| ())
            .with_input(Schema::number())
            .with_config(Schema::object([("title", Schema::string())]))
    }

    #[test]
    fn test_identity() {
        let def = definition();
        let a = def.instance();
        let b = def.named("b");

        assert_eq!(a.id(), "Form");
        assert_eq!(b.id(), "Form:b");
        assert_eq!(b.name(), Some("b"));
        assert_eq!(b.kind(), "Form");
        assert!(a.same(&a.clone()));
        assert!(!a.same(&def.instance()));
    }

    #[test]
    fn test_create_validates_config() {
        let def = definition();
        let ok = def
            .create(Some("x"), Some(json!({"title": "Hello", "extra": 1})))
            .unwrap();
        assert_eq!(ok.config(), Some(&json!({"title": "Hello"})));

        let err = def.create(Some("x"), Some(json!({"title": 3}))).unwrap_err();
        match err {
            WorkflowError::SchemaValidation { step, target, .. } => {
                assert_eq!(step, "Form:x");
                assert_eq!(target, SchemaTarget::Config);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_config_is_validated() {
        let def = definition();
        let err = def.create(Some("x"), None).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::SchemaValidation {
                target: SchemaTarget::Config,
                ..
            }
        ));
        assert!(def.check_config(None, None).is_err());

        let optional: StepDefinition<()> = StepDefinition::new("Opt", |_| ())
            .with_config(Schema::optional(Schema::object([("title", Schema::string())])));
        let step = optional.create(None, None).unwrap();
        assert_eq!(step.config(), None);
        assert_eq!(optional.check_config(None, None).unwrap(), None);
    }

    #[test]
    fn test_config_without_schema_is_kept() {
        let def: StepDefinition<()> = StepDefinition::new("Plain", |_| ());
        let step = def.create(None, Some(json!({"a": 1}))).unwrap();
        assert_eq!(step.config(), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_validate_input_and_output() {
        let def = definition();
        let step = def.instance();
        assert_eq!(step.validate_input(&json!(3)).unwrap(), json!(3));
        assert!(step.validate_input(&json!("3")).is_err());

        // no output schema: pass-through
        assert_eq!(step.validate_output(&json!("any")).unwrap(), json!("any"));
    }

    #[test]
    fn test_each_instance_owns_a_store() {
        let def: StepDefinition<()> =
            StepDefinition::new("Counter", |_| ()).with_store(|| json!({"count": 0}));
        let a = def.named("a");
        let b = def.named("b");

        a.store().unwrap().set(json!({"count": 1}));

        assert_eq!(a.store().unwrap().get(), json!({"count": 1}));
        assert_eq!(b.store().unwrap().get(), json!({"count": 0}));
        assert!(def.instance().store().is_some());
        assert!(definition().instance().store().is_none());
    }
}
