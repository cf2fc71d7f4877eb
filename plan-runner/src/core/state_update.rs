//! Runner-owned unit state transitions.
//!
//! Every mutation of `status` and `attempts` goes through these functions so
//! the lifecycle rules live in one place. The plan store applies them under
//! its lock and persists the result.

use crate::core::plan::Plan;
use crate::core::types::UnitStatus;
use crate::error::EngineError;

/// Allowed lifecycle edges.
pub fn transition_allowed(from: UnitStatus, to: UnitStatus) -> bool {
    matches!(
        (from, to),
        (UnitStatus::Pending, UnitStatus::Running)
            | (UnitStatus::Running, UnitStatus::Done)
            | (UnitStatus::Running, UnitStatus::Failed)
            | (UnitStatus::Running, UnitStatus::Pending)
    )
}

fn transition(plan: &mut Plan, id: &str, to: UnitStatus) -> Result<(), EngineError> {
    let unit = plan
        .unit_mut(id)
        .ok_or_else(|| EngineError::UnknownUnit(id.to_string()))?;
    if !transition_allowed(unit.status, to) {
        return Err(EngineError::InvalidTransition {
            unit_id: id.to_string(),
            from: unit.status,
            to,
        });
    }
    unit.status = to;
    Ok(())
}

pub fn mark_running(plan: &mut Plan, id: &str) -> Result<(), EngineError> {
    transition(plan, id, UnitStatus::Running)
}

/// Consume one attempt on a running unit; returns the attempt number.
pub fn record_attempt(plan: &mut Plan, id: &str) -> Result<u32, EngineError> {
    let unit = plan
        .unit_mut(id)
        .ok_or_else(|| EngineError::UnknownUnit(id.to_string()))?;
    if unit.status != UnitStatus::Running {
        return Err(EngineError::InvalidTransition {
            unit_id: id.to_string(),
            from: unit.status,
            to: UnitStatus::Running,
        });
    }
    unit.attempts += 1;
    Ok(unit.attempts)
}

pub fn mark_done(plan: &mut Plan, id: &str, summary: &str) -> Result<(), EngineError> {
    transition(plan, id, UnitStatus::Done)?;
    push_note(plan, id, format!("done: {summary}"));
    plan.refresh_complete();
    Ok(())
}

pub fn mark_failed(plan: &mut Plan, id: &str, reason: &str) -> Result<(), EngineError> {
    transition(plan, id, UnitStatus::Failed)?;
    push_note(plan, id, format!("failed: {reason}"));
    Ok(())
}

/// Return a running unit to `pending`, keeping its attempt count.
pub fn release(plan: &mut Plan, id: &str, reason: &str) -> Result<(), EngineError> {
    transition(plan, id, UnitStatus::Pending)?;
    push_note(plan, id, format!("released: {reason}"));
    Ok(())
}

/// Return a running unit to `pending`, refunding the attempt it was charged.
pub fn requeue(plan: &mut Plan, id: &str, reason: &str) -> Result<(), EngineError> {
    transition(plan, id, UnitStatus::Pending)?;
    if let Some(unit) = plan.unit_mut(id) {
        unit.attempts = unit.attempts.saturating_sub(1);
    }
    push_note(plan, id, format!("requeued: {reason}"));
    Ok(())
}

/// Return units left `running` by an interrupted process to `pending`.
///
/// Returns the ids that were recovered, in declaration order.
pub fn recover_interrupted(plan: &mut Plan) -> Vec<String> {
    let running = plan.ids_with_status(UnitStatus::Running);
    for id in &running {
        // Running -> Pending is always allowed.
        let _ = requeue(plan, id, "interrupted run");
    }
    running
}

fn push_note(plan: &mut Plan, id: &str, note: String) {
    if let Some(unit) = plan.unit_mut(id) {
        unit.notes.push(note);
    }
}
