//! Typed errors for conditions callers branch on.
//!
//! Everything else travels as `anyhow::Error` with context. These variants are
//! surfaced through `anyhow` too, so callers recover them with `downcast_ref`.

use std::time::Duration;

use thiserror::Error;

use crate::core::types::UnitStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The plan document failed schema or graph validation. Fatal at load.
    #[error("malformed plan:\n- {}", .problems.join("\n- "))]
    MalformedPlan { problems: Vec<String> },

    /// A collaborator process exceeded its wall-clock budget.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// The integration branch moved underneath the merge resolver.
    #[error("integration tip moved: expected {expected}, found {found}")]
    TipMoved { expected: String, found: String },

    /// A unit status change that the lifecycle does not allow.
    #[error("unit '{unit_id}': invalid transition {from} -> {to}")]
    InvalidTransition {
        unit_id: String,
        from: UnitStatus,
        to: UnitStatus,
    },

    #[error("unknown unit '{0}'")]
    UnknownUnit(String),

    /// A collaborator program could not be started at all.
    #[error("spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn malformed(problems: Vec<String>) -> Self {
        Self::MalformedPlan { problems }
    }

    /// True if `err` (or anything in its chain) is a timeout.
    pub fn is_timeout(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<EngineError>(),
                Some(EngineError::Timeout { .. })
            )
        })
    }

    /// True if `err` (or anything in its chain) is a failed spawn.
    pub fn is_spawn(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<EngineError>(),
                Some(EngineError::Spawn { .. })
            )
        })
    }

    /// True if `err` (or anything in its chain) is a malformed plan.
    pub fn is_malformed_plan(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<EngineError>(),
                Some(EngineError::MalformedPlan { .. })
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn malformed_plan_lists_every_problem() {
        let err = EngineError::malformed(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "malformed plan:\n- a\n- b");
    }

    #[test]
    fn timeout_is_detected_through_context_layers() {
        let err: anyhow::Result<()> = Err(EngineError::Timeout {
            operation: "gate test".to_string(),
            after: Duration::from_secs(3),
        }
        .into());
        let err = err.context("run gates").unwrap_err();
        assert!(EngineError::is_timeout(&err));
        assert!(!EngineError::is_malformed_plan(&err));
    }
}
