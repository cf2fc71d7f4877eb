//! Batch loop for `plan-runner run`.
//!
//! Each round takes a plan snapshot, picks the next conflict-free batch, runs
//! its units on a bounded pool of scoped threads and integrates their change
//! sets in selection order. The loop ends when the plan is complete, nothing
//! is eligible, or the run is cancelled.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::thread;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::batch::next_batch;
use crate::core::plan::Plan;
use crate::core::selector::{BlockedUnit, blocked_units};
use crate::core::types::{FailureKind, UnitStatus};
use crate::engine::{Engine, PassedAttempt, UnitOutcome};
use crate::io::ledger::LedgerEntry;
use crate::merge::{Integration, MergeResolver};

/// Progress notifications for observers (the CLI prints them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    BatchScheduled {
        units: Vec<String>,
    },
    AttemptStarted {
        unit_id: String,
        attempt: u32,
        workspace: String,
    },
    AttemptFailed {
        unit_id: String,
        attempt: u32,
        kind: FailureKind,
        reason: String,
    },
    UnitMerged {
        unit_id: String,
        attempt: u32,
        tip: String,
    },
    UnitRequeued {
        unit_id: String,
        paths: Vec<String>,
    },
    UnitFailed {
        unit_id: String,
        attempts: u32,
        reason: String,
    },
    UnitCancelled {
        unit_id: String,
    },
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::BatchScheduled { units } => write!(f, "batch: {}", units.join(", ")),
            RunEvent::AttemptStarted {
                unit_id, attempt, ..
            } => write!(f, "{unit_id}: attempt {attempt} started"),
            RunEvent::AttemptFailed {
                unit_id,
                attempt,
                kind,
                reason,
            } => {
                let first = reason.lines().next().unwrap_or_default();
                write!(f, "{unit_id}: attempt {attempt} failed ({kind}) {first}")
            }
            RunEvent::UnitMerged {
                unit_id,
                attempt,
                tip,
            } => {
                let short = tip.get(..12).unwrap_or(tip);
                write!(f, "{unit_id}: merged attempt {attempt} at {short}")
            }
            RunEvent::UnitRequeued { unit_id, paths } => {
                write!(f, "{unit_id}: merge conflict on {}, requeued", paths.join(", "))
            }
            RunEvent::UnitFailed {
                unit_id,
                attempts,
                reason,
            } => {
                let first = reason.lines().next().unwrap_or_default();
                write!(f, "{unit_id}: failed after {attempts} attempt(s): {first}")
            }
            RunEvent::UnitCancelled { unit_id } => write!(f, "{unit_id}: cancelled"),
        }
    }
}

/// Why `run_plan` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStop {
    Complete,
    /// Work remains but no unit is eligible.
    Blocked,
    Cancelled,
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub stop: RunStop,
    pub done: Vec<String>,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
    /// Pending units with their failed ancestry; only filled when blocked.
    pub blocked: Vec<BlockedUnit>,
}

impl RunReport {
    pub fn from_plan(plan: &Plan, stop: RunStop) -> Self {
        Self {
            stop,
            done: plan.ids_with_status(UnitStatus::Done),
            failed: plan.ids_with_status(UnitStatus::Failed),
            pending: plan.ids_with_status(UnitStatus::Pending),
            blocked: if stop == RunStop::Blocked {
                blocked_units(plan)
            } else {
                Vec::new()
            },
        }
    }
}

/// What happened to one batch member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Member {
    Merged,
    /// Conflicted on its first try; runs alone from now on.
    Requeued,
    /// Conflicted while already serial; the attempt was charged.
    Retried,
    Failed,
    Cancelled,
}

/// Drive the plan until it is complete, blocked or cancelled.
///
/// Infrastructure errors stop the run after the rest of the batch finishes;
/// the affected unit is back in `pending` by then.
#[instrument(skip_all)]
pub fn run_plan(
    engine: &Engine<'_>,
    cancel: &CancelToken,
    observe: &(dyn Fn(&RunEvent) + Sync),
) -> Result<RunReport> {
    let services = engine.services();
    let store = services.store;
    store.recover_interrupted()?;
    let merge = MergeResolver::new(services.vcs)?;
    let mut serial: HashSet<String> = HashSet::new();

    loop {
        let plan = store.snapshot()?;
        if cancel.is_cancelled() {
            info!("run cancelled");
            return Ok(RunReport::from_plan(&plan, RunStop::Cancelled));
        }
        if plan.is_complete() {
            info!(units = plan.units.len(), "plan complete");
            return Ok(RunReport::from_plan(&plan, RunStop::Complete));
        }
        let batch = next_batch(&plan, &serial);
        if batch.is_empty() {
            let report = RunReport::from_plan(&plan, RunStop::Blocked);
            warn!(failed = ?report.failed, pending = ?report.pending, "run blocked");
            return Ok(report);
        }

        info!(units = ?batch, "batch scheduled");
        observe(&RunEvent::BatchScheduled {
            units: batch.clone(),
        });
        merge.begin_batch(batch.clone())?;
        let outcomes = run_batch(engine, &merge, &batch, &serial, cancel, observe)?;

        let mut first_error = None;
        for (unit_id, outcome) in outcomes {
            match outcome {
                Ok(Member::Requeued) | Ok(Member::Retried) => {
                    serial.insert(unit_id);
                }
                Ok(Member::Merged) | Ok(Member::Failed) => {
                    serial.remove(&unit_id);
                }
                Ok(Member::Cancelled) => {}
                Err(err) => {
                    error!(unit = %unit_id, err = %format!("{err:#}"), "unit hit a runner error");
                    if first_error.is_none() {
                        first_error = Some(err.context(format!("unit {unit_id}")));
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
    }
}

/// Run every batch member on up to `max_workers` threads. Results come back
/// in batch order.
fn run_batch(
    engine: &Engine<'_>,
    merge: &MergeResolver<'_>,
    batch: &[String],
    serial: &HashSet<String>,
    cancel: &CancelToken,
    observe: &(dyn Fn(&RunEvent) + Sync),
) -> Result<Vec<(String, Result<Member>)>> {
    let queue = Mutex::new(batch.iter().cloned().collect::<VecDeque<_>>());
    let workers = engine.config().max_workers.clamp(1, batch.len().max(1));

    let per_worker = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(|| {
                    let mut done = Vec::new();
                    loop {
                        let next = queue.lock().ok().and_then(|mut q| q.pop_front());
                        let Some(unit_id) = next else {
                            break;
                        };
                        let outcome = if cancel.is_cancelled() {
                            merge.release(&unit_id).map(|()| Member::Cancelled)
                        } else {
                            let was_serial = serial.contains(&unit_id);
                            run_member(engine, merge, &unit_id, was_serial, cancel, observe)
                        };
                        done.push((unit_id, outcome));
                    }
                    done
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("batch worker thread panicked"))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut outcomes: Vec<(String, Result<Member>)> = per_worker.into_iter().flatten().collect();
    outcomes.sort_by_key(|(unit_id, _)| batch.iter().position(|id| id == unit_id));
    Ok(outcomes)
}

/// Take one unit from `pending` through its attempts and integration.
fn run_member(
    engine: &Engine<'_>,
    merge: &MergeResolver<'_>,
    unit_id: &str,
    was_serial: bool,
    cancel: &CancelToken,
    observe: &(dyn Fn(&RunEvent) + Sync),
) -> Result<Member> {
    let services = engine.services();
    if let Err(err) = services.store.mark_running(unit_id) {
        merge.release(unit_id)?;
        return Err(err);
    }

    let outcome = match engine.run_unit(unit_id, merge, cancel, observe) {
        Ok(outcome) => outcome,
        Err(err) => {
            merge.release(unit_id)?;
            return Err(recover_from_error(engine, unit_id, err));
        }
    };

    match outcome {
        UnitOutcome::Failed { .. } => {
            merge.release(unit_id)?;
            Ok(Member::Failed)
        }
        UnitOutcome::Cancelled { attempt } => {
            merge.release(unit_id)?;
            cancel_unit(engine, unit_id, attempt, observe)
        }
        UnitOutcome::Passed(passed) => {
            match integrate(engine, merge, &passed, was_serial, cancel, observe) {
                Ok(member) => Ok(member),
                Err(err) => {
                    if let Err(cleanup) = services.vcs.remove_workspace(&passed.workspace) {
                        warn!(err = %cleanup, "failed to remove workspace after error");
                    }
                    Err(recover_from_error(engine, unit_id, err))
                }
            }
        }
    }
}

fn integrate(
    engine: &Engine<'_>,
    merge: &MergeResolver<'_>,
    passed: &PassedAttempt,
    was_serial: bool,
    cancel: &CancelToken,
    observe: &(dyn Fn(&RunEvent) + Sync),
) -> Result<Member> {
    let services = engine.services();
    let unit_id = passed.change_set.unit_id.as_str();
    let attempt = passed.attempt;

    let integration = if cancel.is_cancelled() {
        merge.release(unit_id)?;
        Integration::Cancelled
    } else {
        merge.integrate(&passed.change_set, cancel)?
    };
    if let Err(err) = services.vcs.remove_workspace(&passed.workspace) {
        warn!(err = %err, unit = %unit_id, "failed to remove workspace");
    }

    match integration {
        Integration::Merged { tip } => {
            services.ledger.append(&LedgerEntry::done(
                unit_id,
                attempt,
                &passed.summary,
                passed.gates.clone(),
            ))?;
            services.store.mark_done(unit_id, &passed.summary)?;
            observe(&RunEvent::UnitMerged {
                unit_id: unit_id.to_string(),
                attempt,
                tip,
            });
            Ok(Member::Merged)
        }
        Integration::Conflict { paths } => {
            let reason = format!("merge conflict on {}", paths.join(", "));
            if !was_serial {
                services.ledger.append(&LedgerEntry::requeued(
                    unit_id,
                    attempt,
                    &reason,
                    &passed.summary,
                ))?;
                services.store.requeue(unit_id, &reason)?;
                observe(&RunEvent::UnitRequeued {
                    unit_id: unit_id.to_string(),
                    paths,
                });
                return Ok(Member::Requeued);
            }

            services.ledger.append(&LedgerEntry::failed(
                unit_id,
                attempt,
                FailureKind::MergeConflict,
                &reason,
                &passed.summary,
                passed.gates.clone(),
            ))?;
            observe(&RunEvent::AttemptFailed {
                unit_id: unit_id.to_string(),
                attempt,
                kind: FailureKind::MergeConflict,
                reason: reason.clone(),
            });
            if attempt >= engine.config().max_attempts {
                let reason = format!("{}: {reason}", FailureKind::MergeConflict);
                services.store.mark_failed(unit_id, &reason)?;
                observe(&RunEvent::UnitFailed {
                    unit_id: unit_id.to_string(),
                    attempts: attempt,
                    reason,
                });
                return Ok(Member::Failed);
            }
            services.store.release(unit_id, &reason)?;
            Ok(Member::Retried)
        }
        Integration::Cancelled => cancel_unit(engine, unit_id, Some(attempt), observe),
    }
}

/// Cancelled units go back to `pending`; a charged attempt is refunded.
fn cancel_unit(
    engine: &Engine<'_>,
    unit_id: &str,
    attempt: Option<u32>,
    observe: &(dyn Fn(&RunEvent) + Sync),
) -> Result<Member> {
    let services = engine.services();
    match attempt {
        Some(attempt) => {
            services
                .ledger
                .append(&LedgerEntry::cancelled(unit_id, attempt))?;
            services.store.requeue(unit_id, "run cancelled")?;
        }
        None => services.store.release(unit_id, "run cancelled")?,
    }
    observe(&RunEvent::UnitCancelled {
        unit_id: unit_id.to_string(),
    });
    Ok(Member::Cancelled)
}

/// Put a unit that hit a runner error back in the queue and pass the error on.
fn recover_from_error(engine: &Engine<'_>, unit_id: &str, err: anyhow::Error) -> anyhow::Error {
    if let Err(requeue_err) = engine
        .services()
        .store
        .requeue(unit_id, &format!("runner error: {err}"))
    {
        warn!(err = %requeue_err, unit = %unit_id, "failed to requeue unit after runner error");
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::skill::NoSkills;
    use crate::core::types::Outcome;
    use crate::engine::Services;
    use crate::io::config::{GateConfig, RunnerConfig};
    use crate::io::init::RunnerPaths;
    use crate::io::ledger::Ledger;
    use crate::io::plan_store::PlanStore;
    use crate::test_support::{
        MemoryVcs, ScriptedAttempt, ScriptedGateRunner, ScriptedImplementer, plan_of,
        unit_with_deps, unit_with_scope,
    };

    struct Fixture {
        _temp: tempfile::TempDir,
        paths: RunnerPaths,
        store: PlanStore,
        ledger: Ledger,
        vcs: MemoryVcs,
        config: RunnerConfig,
    }

    fn fixture(plan: Plan, max_attempts: u32) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunnerPaths::new(temp.path());
        Fixture {
            store: PlanStore::from_plan(&paths.plan_path, plan),
            ledger: Ledger::new(&paths.ledger_path),
            vcs: MemoryVcs::new().expect("vcs"),
            config: RunnerConfig {
                max_attempts,
                max_workers: 2,
                gates: vec![GateConfig {
                    name: "ci".to_string(),
                    command: vec!["true".to_string()],
                }],
                ..RunnerConfig::default()
            },
            paths,
            _temp: temp,
        }
    }

    fn run(
        fx: &Fixture,
        implementer: &ScriptedImplementer,
        gates: &ScriptedGateRunner,
        cancel: &CancelToken,
    ) -> (RunReport, Vec<RunEvent>) {
        let services = Services {
            store: &fx.store,
            ledger: &fx.ledger,
            vcs: &fx.vcs,
            implementer,
            gates,
            skills: &NoSkills,
        };
        let engine = Engine::new(services, &fx.config, &fx.paths).expect("engine");
        let events = Mutex::new(Vec::new());
        let report = run_plan(&engine, cancel, &|event| {
            events.lock().expect("events").push(event.clone());
        })
        .expect("run");
        (report, events.into_inner().expect("events"))
    }

    #[test]
    fn conflicting_sibling_is_requeued_then_runs_alone() {
        // b's first replay is rejected by the vcs.
        let fx = fixture(
            plan_of(vec![
                unit_with_scope("a", 0, &["src/a"]),
                unit_with_scope("b", 0, &["src/b"]),
            ]),
            3,
        );
        fx.vcs.force_conflict("b", 1);
        let implementer = ScriptedImplementer::new()
            .script("a", vec![ScriptedAttempt::write(&[("src/a/lib.rs", "a")])])
            .script(
                "b",
                vec![
                    ScriptedAttempt::write(&[("src/b/lib.rs", "b1")]),
                    ScriptedAttempt::write(&[("src/b/lib.rs", "b2")]),
                ],
            );

        let (report, events) = run(
            &fx,
            &implementer,
            &ScriptedGateRunner::always(true),
            &CancelToken::new(),
        );
        assert_eq!(report.stop, RunStop::Complete);
        assert_eq!(fx.vcs.history(), vec!["a", "b"]);

        let b = fx.store.snapshot().expect("plan");
        assert_eq!(b.unit("b").expect("b").attempts, 1);

        let outcomes: Vec<Outcome> = fx
            .ledger
            .entries_for("b")
            .expect("ledger")
            .into_iter()
            .map(|e| e.outcome)
            .collect();
        assert_eq!(outcomes, vec![Outcome::Requeued, Outcome::Done]);

        let batches: Vec<&Vec<String>> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::BatchScheduled { units } => Some(units),
                _ => None,
            })
            .collect();
        assert_eq!(batches, vec![&vec!["a".to_string(), "b".to_string()], &vec!["b".to_string()]]);
    }

    #[test]
    fn second_conflict_while_serial_is_charged() {
        let fx = fixture(plan_of(vec![unit_with_scope("a", 0, &["src/a"])]), 2);
        fx.vcs.force_conflict("a", 3);
        let implementer = ScriptedImplementer::new().script(
            "a",
            vec![
                ScriptedAttempt::write(&[("src/a/lib.rs", "1")]),
                ScriptedAttempt::write(&[("src/a/lib.rs", "2")]),
                ScriptedAttempt::write(&[("src/a/lib.rs", "3")]),
            ],
        );
        let (report, _) = run(
            &fx,
            &implementer,
            &ScriptedGateRunner::always(true),
            &CancelToken::new(),
        );
        assert_eq!(report.stop, RunStop::Blocked);
        assert_eq!(report.failed, vec!["a"]);

        let outcomes: Vec<Outcome> = fx
            .ledger
            .entries_for("a")
            .expect("ledger")
            .into_iter()
            .map(|e| e.outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![Outcome::Requeued, Outcome::Failed, Outcome::Failed]
        );
    }

    #[test]
    fn cancelled_run_leaves_units_pending() {
        let fx = fixture(
            plan_of(vec![
                unit_with_scope("a", 0, &["src/a"]),
                unit_with_deps("b", 0, &["a"]),
            ]),
            3,
        );
        let cancel = CancelToken::new();
        let implementer = ScriptedImplementer::new()
            .script("a", vec![ScriptedAttempt::write(&[("src/a/lib.rs", "a")])])
            .cancel_on_execute(cancel.clone());

        let (report, events) = run(&fx, &implementer, &ScriptedGateRunner::always(true), &cancel);
        assert_eq!(report.stop, RunStop::Cancelled);
        assert_eq!(report.pending, vec!["a", "b"]);
        assert!(events.contains(&RunEvent::UnitCancelled {
            unit_id: "a".to_string()
        }));

        let plan = fx.store.snapshot().expect("plan");
        assert_eq!(plan.unit("a").expect("a").attempts, 0);
        let entries = fx.ledger.entries_for("a").expect("ledger");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, Outcome::Cancelled);
        assert!(fx.vcs.history().is_empty());
    }

    #[test]
    fn interrupted_units_are_recovered_before_scheduling() {
        let mut plan = plan_of(vec![unit_with_scope("a", 0, &["src/a"])]);
        plan.units[0].status = UnitStatus::Running;
        plan.units[0].attempts = 1;
        let fx = fixture(plan, 3);
        let implementer = ScriptedImplementer::new()
            .script("a", vec![ScriptedAttempt::write(&[("src/a/lib.rs", "a")])]);
        let (report, _) = run(
            &fx,
            &implementer,
            &ScriptedGateRunner::always(true),
            &CancelToken::new(),
        );
        assert_eq!(report.stop, RunStop::Complete);
        assert_eq!(fx.store.snapshot().expect("plan").units[0].attempts, 1);
    }
}
