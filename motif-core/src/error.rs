//! Core error types.

use std::fmt;
use thiserror::Error;

/// Which declared validator rejected a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaTarget {
    Input,
    Output,
    Config,
}

impl fmt::Display for SchemaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaTarget::Input => f.write_str("input"),
            SchemaTarget::Output => f.write_str("output"),
            SchemaTarget::Config => f.write_str("config"),
        }
    }
}

/// Lifecycle phase a hook was registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    TransitionIn,
    TransitionOut,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::TransitionIn => f.write_str("transitionIn"),
            HookPhase::TransitionOut => f.write_str("transitionOut"),
        }
    }
}

/// Errors from the workflow engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("schema validation failed for {target} of '{step}': {reason}")]
    SchemaValidation {
        step: String,
        target: SchemaTarget,
        reason: String,
    },

    #[error("no next step from '{step}'")]
    NoNextStep { step: String },

    #[error("transition blocked by edge condition from '{step}'")]
    TransitionBlocked { step: String },

    #[error("transform edge '{from}' -> '{to}' failed to convert output -> input: {reason}")]
    Transform {
        from: String,
        to: String,
        reason: String,
    },

    #[error("back navigation is not allowed: edge from '{from}' to '{to}' is unidirectional")]
    Navigation { from: String, to: String },

    #[error("registration error: {reason}")]
    Registration { reason: String },

    #[error("invalid expression: {reason}")]
    InvalidExpression { reason: String },

    #[error("{phase} hook of '{step}' failed: {reason}")]
    Hook {
        step: String,
        phase: HookPhase,
        reason: String,
    },

    #[error("step '{step}' is not the active step")]
    StepNotActive { step: String },

    #[error("step '{step}' cannot transition while it is being built")]
    ReentrantTransition { step: String },
}

impl WorkflowError {
    pub(crate) fn registration(reason: impl Into<String>) -> Self {
        WorkflowError::Registration {
            reason: reason.into(),
        }
    }

    /// Returns true for the two routing failures ("no next step", "transition blocked").
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            WorkflowError::NoNextStep { .. } | WorkflowError::TransitionBlocked { .. }
        )
    }

    /// Returns a stable error code for adapters that report errors as data.
    pub fn error_code(&self) -> &'static str {
        match self {
            WorkflowError::SchemaValidation { .. } => "SCHEMA_VALIDATION",
            WorkflowError::NoNextStep { .. } => "ROUTING",
            WorkflowError::TransitionBlocked { .. } => "ROUTING",
            WorkflowError::Transform { .. } => "TRANSFORM",
            WorkflowError::Navigation { .. } => "NAVIGATION",
            WorkflowError::Registration { .. } => "REGISTRATION",
            WorkflowError::InvalidExpression { .. } => "INVALID_EXPRESSION",
            WorkflowError::Hook { .. } => "HOOK_FAILED",
            WorkflowError::StepNotActive { .. } => "STEP_NOT_ACTIVE",
            WorkflowError::ReentrantTransition { .. } => "REENTRANT_TRANSITION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_classification() {
        let no_next = WorkflowError::NoNextStep {
            step: "A".to_string(),
        };
        let blocked = WorkflowError::TransitionBlocked {
            step: "A".to_string(),
        };
        let nav = WorkflowError::Navigation {
            from: "A".to_string(),
            to: "B".to_string(),
        };

        assert!(no_next.is_routing());
        assert!(blocked.is_routing());
        assert!(!nav.is_routing());
        assert_eq!(no_next.error_code(), "ROUTING");
        assert_eq!(blocked.error_code(), "ROUTING");
        assert_eq!(nav.error_code(), "NAVIGATION");
    }

    #[test]
    fn test_messages() {
        let err = WorkflowError::SchemaValidation {
            step: "B:b".to_string(),
            target: SchemaTarget::Input,
            reason: "expected number, received string".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "schema validation failed for input of 'B:b': expected number, received string"
        );

        let err = WorkflowError::Hook {
            step: "A".to_string(),
            phase: HookPhase::TransitionOut,
            reason: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "transitionOut hook of 'A' failed: boom");
    }
}
