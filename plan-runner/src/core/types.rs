//! Shared deterministic types for runner core logic.
//!
//! These types define stable contracts between core components and the
//! collaborators at the edges. They do not depend on I/O and serialize the same
//! way across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Running => "running",
            UnitStatus::Done => "done",
            UnitStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Done | UnitStatus::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded in a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Gates passed and the change set was integrated.
    Done,
    /// The attempt failed and consumed a retry.
    Failed,
    /// The unit went back to `pending` without being charged (merge conflict).
    Requeued,
    /// The run was cancelled while the attempt was in flight.
    Cancelled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Failed => "failed",
            Outcome::Requeued => "requeued",
            Outcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt did not produce a mergeable change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The implementer touched paths outside the unit's file scope.
    ScopeViolation,
    /// A quality gate reported failure.
    GateFailure,
    /// The attempt ran out of wall-clock budget.
    Timeout,
    /// The implementer reported `done = false`.
    Incomplete,
    /// The implementer crashed or produced no readable report.
    ImplementerError,
    /// The change set could not be replayed on the integration tip.
    MergeConflict,
    /// Runner infrastructure (git, filesystem) failed mid-attempt.
    RunnerError,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::ScopeViolation => "scope_violation",
            FailureKind::GateFailure => "gate_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Incomplete => "incomplete",
            FailureKind::ImplementerError => "implementer_error",
            FailureKind::MergeConflict => "merge_conflict",
            FailureKind::RunnerError => "runner_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one quality gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub gate_name: String,
    pub passed: bool,
    pub detail: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl GateResult {
    pub fn pass(gate_name: &str, detail: impl Into<String>) -> Self {
        Self {
            gate_name: gate_name.to_string(),
            passed: true,
            detail: detail.into(),
            timed_out: false,
        }
    }

    pub fn fail(gate_name: &str, detail: impl Into<String>) -> Self {
        Self {
            gate_name: gate_name.to_string(),
            passed: false,
            detail: detail.into(),
            timed_out: false,
        }
    }
}

/// Structured report returned by the implementer collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementerReport {
    pub done: bool,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub summary: String,
}
