//! Edges between step instances.
//!
//! An edge decides whether the output of its source step may move the
//! workflow to its destination, and what input the destination receives.

use crate::error::WorkflowError;
use crate::expr::CompiledExpr;
use crate::step::StepInstance;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::rc::Rc;

/// Outcome of checking an output against an edge.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Allow { next_input: Value },
    Deny,
}

/// Transition family of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Output passed through unchanged.
    Default,
    Conditional,
    Transform,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Default => "default",
            EdgeKind::Conditional => "conditional",
            EdgeKind::Transform => "transform",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision logic attached to an edge.
///
/// `Err` means the output could not be converted; the edge reports it as a
/// transform failure.
pub trait EdgeRule {
    fn kind(&self) -> EdgeKind;

    fn validate(&self, output: &Value) -> Result<Transition, String>;

    /// Source text for rules that can be written out as data.
    fn expression(&self) -> Option<&str> {
        None
    }
}

struct PassThrough;

impl EdgeRule for PassThrough {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Default
    }

    fn validate(&self, output: &Value) -> Result<Transition, String> {
        Ok(Transition::Allow {
            next_input: output.clone(),
        })
    }
}

struct Condition<P>(P);

impl<P> EdgeRule for Condition<P>
where
    P: Fn(&Value) -> bool,
{
    fn kind(&self) -> EdgeKind {
        EdgeKind::Conditional
    }

    fn validate(&self, output: &Value) -> Result<Transition, String> {
        if (self.0)(output) {
            Ok(Transition::Allow {
                next_input: output.clone(),
            })
        } else {
            Ok(Transition::Deny)
        }
    }
}

struct Convert<F>(F);

impl<F> EdgeRule for Convert<F>
where
    F: Fn(&Value) -> Result<Value, String>,
{
    fn kind(&self) -> EdgeKind {
        EdgeKind::Transform
    }

    fn validate(&self, output: &Value) -> Result<Transition, String> {
        (self.0)(output).map(|next_input| Transition::Allow { next_input })
    }
}

struct ConditionExpr(CompiledExpr);

impl EdgeRule for ConditionExpr {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Conditional
    }

    fn validate(&self, output: &Value) -> Result<Transition, String> {
        match self.0.test(output) {
            Ok(true) => Ok(Transition::Allow {
                next_input: output.clone(),
            }),
            Ok(false) => Ok(Transition::Deny),
            Err(e) => {
                tracing::warn!(
                    "Condition '{}' failed to evaluate, denying: {}",
                    self.0.source(),
                    e
                );
                Ok(Transition::Deny)
            }
        }
    }

    fn expression(&self) -> Option<&str> {
        Some(self.0.source())
    }
}

struct TransformExpr(CompiledExpr);

impl EdgeRule for TransformExpr {
    fn kind(&self) -> EdgeKind {
        EdgeKind::Transform
    }

    fn validate(&self, output: &Value) -> Result<Transition, String> {
        match self.0.evaluate(output) {
            Ok(Some(next_input)) => Ok(Transition::Allow { next_input }),
            Ok(None) => Err("result is undefined".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn expression(&self) -> Option<&str> {
        Some(self.0.source())
    }
}

/// A directed edge between two step instances.
pub struct Edge<A> {
    from: StepInstance<A>,
    to: StepInstance<A>,
    unidirectional: bool,
    rule: Rc<dyn EdgeRule>,
}

impl<A> Clone for Edge<A> {
    fn clone(&self) -> Self {
        Self {
            from: self.from.clone(),
            to: self.to.clone(),
            unidirectional: self.unidirectional,
            rule: Rc::clone(&self.rule),
        }
    }
}

impl<A> fmt::Debug for Edge<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("kind", &self.rule.kind())
            .field("from", &self.from.id())
            .field("to", &self.to.id())
            .field("unidirectional", &self.unidirectional)
            .field("expression", &self.rule.expression())
            .finish()
    }
}

impl<A> Edge<A> {
    /// Pass-through edge.
    pub fn new(from: &StepInstance<A>, to: &StepInstance<A>) -> Self {
        Self::with_rule(from, to, PassThrough)
    }

    /// Edge taken only when `predicate` accepts the output.
    pub fn conditional<P>(from: &StepInstance<A>, to: &StepInstance<A>, predicate: P) -> Self
    where
        P: Fn(&Value) -> bool + 'static,
    {
        Self::with_rule(from, to, Condition(predicate))
    }

    /// Edge converting the output into the destination's input.
    pub fn transform<F>(from: &StepInstance<A>, to: &StepInstance<A>, convert: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + 'static,
    {
        Self::with_rule(from, to, Convert(convert))
    }

    /// Conditional edge from an expression, e.g. `out % 2 === 0`.
    pub fn conditional_expr(
        from: &StepInstance<A>,
        to: &StepInstance<A>,
        expression: &str,
    ) -> Result<Self, WorkflowError> {
        let compiled = CompiledExpr::compile(expression)?;
        Ok(Self::with_rule(from, to, ConditionExpr(compiled)))
    }

    /// Transform edge from an expression, e.g. `{ name: out.user }`.
    pub fn transform_expr(
        from: &StepInstance<A>,
        to: &StepInstance<A>,
        expression: &str,
    ) -> Result<Self, WorkflowError> {
        let compiled = CompiledExpr::compile(expression)?;
        Ok(Self::with_rule(from, to, TransformExpr(compiled)))
    }

    pub fn with_rule<R>(from: &StepInstance<A>, to: &StepInstance<A>, rule: R) -> Self
    where
        R: EdgeRule + 'static,
    {
        Self {
            from: from.clone(),
            to: to.clone(),
            unidirectional: false,
            rule: Rc::new(rule),
        }
    }

    /// Rebuilds an edge from its serialised parts.
    pub fn from_parts(
        kind: EdgeKind,
        from: &StepInstance<A>,
        to: &StepInstance<A>,
        unidirectional: bool,
        config: Option<&str>,
    ) -> Result<Self, WorkflowError> {
        let edge = match (kind, config) {
            (EdgeKind::Default, _) => Self::new(from, to),
            (EdgeKind::Conditional, Some(expr)) => Self::conditional_expr(from, to, expr)?,
            (EdgeKind::Transform, Some(expr)) => Self::transform_expr(from, to, expr)?,
            (kind, None) => {
                return Err(WorkflowError::InvalidExpression {
                    reason: format!(
                        "{} edge '{}' -> '{}' needs an expression",
                        kind,
                        from.id(),
                        to.id()
                    ),
                })
            }
        };
        Ok(edge.with_unidirectional(unidirectional))
    }

    /// Forbids back navigation across this edge.
    pub fn unidirectional(self) -> Self {
        self.with_unidirectional(true)
    }

    pub fn with_unidirectional(mut self, unidirectional: bool) -> Self {
        self.unidirectional = unidirectional;
        self
    }

    pub fn from(&self) -> &StepInstance<A> {
        &self.from
    }

    pub fn to(&self) -> &StepInstance<A> {
        &self.to
    }

    pub fn is_unidirectional(&self) -> bool {
        self.unidirectional
    }

    pub fn kind(&self) -> EdgeKind {
        self.rule.kind()
    }

    /// Expression source of an expression-defined edge.
    pub fn serialized_config(&self) -> Option<&str> {
        self.rule.expression()
    }

    /// False for conditional and transform edges defined in code.
    pub fn is_serializable(&self) -> bool {
        self.kind() == EdgeKind::Default || self.rule.expression().is_some()
    }

    /// True if this edge goes from `from` to `to`.
    pub fn connects(&self, from: &StepInstance<A>, to: &StepInstance<A>) -> bool {
        self.from.same(from) && self.to.same(to)
    }

    /// Checks `output` against this edge.
    pub fn validate_transition(&self, output: &Value) -> Result<Transition, WorkflowError> {
        self.rule
            .validate(output)
            .map_err(|reason| WorkflowError::Transform {
                from: self.from.id().to_string(),
                to: self.to.id().to_string(),
                reason,
            })
    }
}
