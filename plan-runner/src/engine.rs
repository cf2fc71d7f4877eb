//! Attempt loop for a single unit.
//!
//! The coordinator marks a unit running and hands it to [`Engine::run_unit`],
//! which retries until an attempt produces a verified change set, attempts
//! run out, or the run is cancelled. Integration is the caller's job.

use std::collections::BTreeSet;
use std::time::Instant;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::plan::Unit;
use crate::core::scope::out_of_scope;
use crate::core::skill::SkillSelector;
use crate::core::types::{FailureKind, GateResult};
use crate::coordinator::RunEvent;
use crate::error::EngineError;
use crate::io::attempt_log::{AttemptMeta, AttemptPaths};
use crate::io::config::RunnerConfig;
use crate::io::context::{assemble_context, write_context};
use crate::io::gates::{GateRunner, GateVerdict, run_gates};
use crate::io::implementer::{ImplementRequest, Implementer};
use crate::io::init::RunnerPaths;
use crate::io::ledger::{Ledger, LedgerEntry};
use crate::io::plan_store::PlanStore;
use crate::io::prompt::PromptBuilder;
use crate::io::vcs::{ChangeSet, VersionControl, Workspace};
use crate::merge::MergeResolver;

/// Shared collaborators for a run. Every field is a handle; nothing here is
/// owned by the engine.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub store: &'a PlanStore,
    pub ledger: &'a Ledger,
    pub vcs: &'a dyn VersionControl,
    pub implementer: &'a dyn Implementer,
    pub gates: &'a dyn GateRunner,
    pub skills: &'a dyn SkillSelector,
}

/// An attempt whose gates passed, ready to integrate.
#[derive(Debug, Clone)]
pub struct PassedAttempt {
    pub attempt: u32,
    pub workspace: Workspace,
    pub change_set: ChangeSet,
    pub summary: String,
    pub gates: Vec<GateResult>,
}

#[derive(Debug, Clone)]
pub enum UnitOutcome {
    Passed(PassedAttempt),
    /// Attempts are exhausted and the unit is marked failed.
    Failed { attempts: u32, reason: String },
    /// `attempt` is `None` when cancellation came before an attempt was charged.
    Cancelled { attempt: Option<u32> },
}

enum Verdict {
    Passed {
        change_set: ChangeSet,
        summary: String,
        gates: Vec<GateResult>,
    },
    Failed {
        kind: FailureKind,
        reason: String,
        summary: String,
        gates: Vec<GateResult>,
    },
    Cancelled,
}

impl Verdict {
    fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Verdict::Failed {
            kind,
            reason: reason.into(),
            summary: String::new(),
            gates: Vec::new(),
        }
    }
}

pub struct Engine<'a> {
    services: Services<'a>,
    config: &'a RunnerConfig,
    paths: &'a RunnerPaths,
    prompts: PromptBuilder,
}

impl<'a> Engine<'a> {
    pub fn new(
        services: Services<'a>,
        config: &'a RunnerConfig,
        paths: &'a RunnerPaths,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            services,
            config,
            paths,
            prompts: PromptBuilder::new(config.prompt_budget_bytes)?,
        })
    }

    pub fn services(&self) -> Services<'a> {
        self.services
    }

    pub fn config(&self) -> &RunnerConfig {
        self.config
    }

    /// Run attempts for a unit the caller has already marked running.
    ///
    /// Failed attempts are written to the ledger here. Infrastructure errors
    /// are returned as `Err` with the unit still running.
    #[instrument(skip_all, fields(unit = %unit_id))]
    pub fn run_unit(
        &self,
        unit_id: &str,
        merge: &MergeResolver<'_>,
        cancel: &CancelToken,
        observe: &(dyn Fn(&RunEvent) + Sync),
    ) -> Result<UnitOutcome> {
        let max_attempts = self.config.max_attempts;
        let mut last_reason = String::from("attempts exhausted");
        loop {
            let unit = self
                .services
                .store
                .snapshot()?
                .unit(unit_id)
                .cloned()
                .ok_or_else(|| EngineError::UnknownUnit(unit_id.to_string()))?;
            if unit.attempts >= max_attempts {
                self.services.store.mark_failed(unit_id, &last_reason)?;
                observe(&RunEvent::UnitFailed {
                    unit_id: unit_id.to_string(),
                    attempts: unit.attempts,
                    reason: last_reason.clone(),
                });
                return Ok(UnitOutcome::Failed {
                    attempts: unit.attempts,
                    reason: last_reason,
                });
            }
            if cancel.is_cancelled() {
                return Ok(UnitOutcome::Cancelled { attempt: None });
            }

            let attempt = self.services.store.record_attempt(unit_id)?;
            let base = merge.tip()?;
            let workspace = self
                .services
                .vcs
                .create_workspace(&format!("{unit_id}-{attempt}"), &base)?;
            observe(&RunEvent::AttemptStarted {
                unit_id: unit_id.to_string(),
                attempt,
                workspace: workspace.name.clone(),
            });

            match self.attempt(&unit, attempt, &workspace, cancel) {
                Ok(Verdict::Passed {
                    change_set,
                    summary,
                    gates,
                }) => {
                    info!(attempt, commits = change_set.commits.len(), "attempt passed");
                    return Ok(UnitOutcome::Passed(PassedAttempt {
                        attempt,
                        workspace,
                        change_set,
                        summary,
                        gates,
                    }));
                }
                Ok(Verdict::Failed {
                    kind,
                    reason,
                    summary,
                    gates,
                }) => {
                    warn!(attempt, kind = %kind, reason = %reason, "attempt failed");
                    self.services.vcs.remove_workspace(&workspace)?;
                    self.services.ledger.append(&LedgerEntry::failed(
                        unit_id, attempt, kind, &reason, &summary, gates,
                    ))?;
                    observe(&RunEvent::AttemptFailed {
                        unit_id: unit_id.to_string(),
                        attempt,
                        kind,
                        reason: reason.clone(),
                    });
                    last_reason = format!("{kind}: {reason}");
                }
                Ok(Verdict::Cancelled) => {
                    self.services.vcs.remove_workspace(&workspace)?;
                    return Ok(UnitOutcome::Cancelled {
                        attempt: Some(attempt),
                    });
                }
                Err(err) => {
                    if let Err(cleanup) = self.services.vcs.remove_workspace(&workspace) {
                        warn!(err = %cleanup, "failed to remove workspace after error");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One attempt inside `workspace`. Writes the attempt logs either way.
    fn attempt(
        &self,
        unit: &Unit,
        attempt: u32,
        workspace: &Workspace,
        cancel: &CancelToken,
    ) -> Result<Verdict> {
        let started = Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();
        let deadline = started + self.config.attempt_timeout();
        let logs = AttemptPaths::new(&self.paths.logs_dir, &unit.id, attempt);
        logs.prepare()?;

        let verdict = self.verify(unit, attempt, workspace, &logs, deadline, cancel)?;

        let (passed, failure_kind, failure_reason, gates) = match &verdict {
            Verdict::Passed { gates, .. } => (true, None, None, gates.clone()),
            Verdict::Failed {
                kind,
                reason,
                gates,
                ..
            } => (false, Some(*kind), Some(reason.clone()), gates.clone()),
            Verdict::Cancelled => (false, None, Some("run cancelled".to_string()), Vec::new()),
        };
        logs.write_meta(&AttemptMeta {
            unit_id: unit.id.clone(),
            attempt,
            workspace: workspace.name.clone(),
            base: workspace.base.clone(),
            started_at,
            ended_at: chrono::Utc::now().to_rfc3339(),
            duration_ms: started.elapsed().as_millis() as u64,
            passed,
            failure_kind,
            failure_reason,
            gates,
        })?;
        Ok(verdict)
    }

    fn verify(
        &self,
        unit: &Unit,
        attempt: u32,
        workspace: &Workspace,
        logs: &AttemptPaths,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<Verdict> {
        let services = self.services;
        let context = assemble_context(
            unit,
            attempt,
            self.config.max_attempts,
            services.ledger,
            self.config.context_entries,
            services.skills,
        )?;
        let context_paths = write_context(&self.paths.context_dir, &context)?;
        let prompt = self.prompts.build(&context)?;
        logs.write_prompt(&prompt)?;

        if cancel.is_cancelled() {
            return Ok(Verdict::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(Verdict::failed(
                FailureKind::Timeout,
                "attempt budget exhausted before the implementer started",
            ));
        }

        let request = ImplementRequest {
            unit_id: unit.id.clone(),
            attempt,
            workdir: workspace.path.clone(),
            prompt,
            context_dir: context_paths.dir,
            schema_path: self.paths.implementer_schema_path.clone(),
            output_path: logs.report_path.clone(),
            log_path: logs.implementer_log_path.clone(),
            timeout: remaining,
            output_limit_bytes: self.config.implementer_output_limit_bytes,
        };
        let report = match services.implementer.execute(&request) {
            Ok(report) => report,
            Err(err) if EngineError::is_timeout(&err) => {
                return Ok(Verdict::failed(FailureKind::Timeout, err.to_string()));
            }
            Err(err) => {
                return Ok(Verdict::failed(FailureKind::ImplementerError, format!("{err:#}")));
            }
        };
        logs.write_report(&report)?;

        let mut touched: BTreeSet<String> = report
            .files_touched
            .iter()
            .map(|path| normalize_reported_path(path))
            .filter(|path| !path.is_empty())
            .collect();
        touched.extend(services.vcs.touched_paths(workspace)?);
        let touched: Vec<String> = touched.into_iter().collect();
        let outside = out_of_scope(&unit.file_scope, &touched);
        if !outside.is_empty() {
            return Ok(Verdict::Failed {
                kind: FailureKind::ScopeViolation,
                reason: format!("touched paths outside file scope: {}", outside.join(", ")),
                summary: report.summary,
                gates: Vec::new(),
            });
        }
        if !report.done {
            return Ok(Verdict::Failed {
                kind: FailureKind::Incomplete,
                reason: "implementer reported the unit as not done".to_string(),
                summary: report.summary,
                gates: Vec::new(),
            });
        }

        let verdict = run_gates(
            services.gates,
            &self.config.gates,
            &workspace.path,
            &logs.gates_log_path,
            self.config.gate_output_limit_bytes,
            deadline,
            cancel,
        )?;
        let gates = match verdict {
            GateVerdict::Passed(results) => results,
            GateVerdict::Cancelled(_) => return Ok(Verdict::Cancelled),
            GateVerdict::Failed(results) => {
                let failing = results
                    .last()
                    .ok_or_else(|| anyhow!("gate verdict failed without a result"))?;
                let kind = if failing.timed_out {
                    FailureKind::Timeout
                } else {
                    FailureKind::GateFailure
                };
                let reason = format!("gate {} failed: {}", failing.gate_name, failing.detail);
                return Ok(Verdict::Failed {
                    kind,
                    reason,
                    summary: report.summary,
                    gates: results,
                });
            }
        };

        if cancel.is_cancelled() {
            return Ok(Verdict::Cancelled);
        }
        let message = commit_message(unit, attempt, &report.summary);
        services.vcs.commit(workspace, &message)?;
        let change_set = services.vcs.change_set(&unit.id, workspace)?;
        Ok(Verdict::Passed {
            change_set,
            summary: report.summary,
            gates,
        })
    }
}

fn normalize_reported_path(path: &str) -> String {
    path.trim().trim_start_matches("./").to_string()
}

fn commit_message(unit: &Unit, attempt: u32, summary: &str) -> String {
    let mut message = format!(
        "{}: {}\n\nplan-runner unit {} attempt {}",
        unit.id, unit.title, unit.id, attempt
    );
    if !summary.trim().is_empty() {
        message.push_str("\n\n");
        message.push_str(summary.trim());
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::skill::NoSkills;
    use crate::core::types::{Outcome, UnitStatus};
    use crate::io::config::GateConfig;
    use crate::test_support::{
        MemoryVcs, ScriptedAttempt, ScriptedGateRunner, ScriptedImplementer, plan_of,
        unit_with_scope,
    };
    use std::fs;

    struct Fixture {
        _temp: tempfile::TempDir,
        paths: RunnerPaths,
        store: PlanStore,
        ledger: Ledger,
        vcs: MemoryVcs,
        config: RunnerConfig,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunnerPaths::new(temp.path());
        let store = PlanStore::from_plan(
            &paths.plan_path,
            plan_of(vec![unit_with_scope("a", 0, &["src/a"])]),
        );
        let ledger = Ledger::new(&paths.ledger_path);
        Fixture {
            paths,
            store,
            ledger,
            vcs: MemoryVcs::new().expect("vcs"),
            config: RunnerConfig {
                max_attempts,
                gates: vec![GateConfig {
                    name: "ci".to_string(),
                    command: vec!["true".to_string()],
                }],
                ..RunnerConfig::default()
            },
            _temp: temp,
        }
    }

    fn run(
        fx: &Fixture,
        implementer: &ScriptedImplementer,
        gates: &ScriptedGateRunner,
        cancel: &CancelToken,
    ) -> UnitOutcome {
        let services = Services {
            store: &fx.store,
            ledger: &fx.ledger,
            vcs: &fx.vcs,
            implementer,
            gates,
            skills: &NoSkills,
        };
        let engine = Engine::new(services, &fx.config, &fx.paths).expect("engine");
        let merge = MergeResolver::new(&fx.vcs).expect("merge");
        fx.store.mark_running("a").expect("running");
        engine.run_unit("a", &merge, cancel, &|_| {}).expect("run unit")
    }

    #[test]
    fn gate_failure_is_retried_with_history() {
        let fx = fixture(3);
        let implementer = ScriptedImplementer::new().script(
            "a",
            vec![
                ScriptedAttempt::write(&[("src/a/lib.rs", "v1")]),
                ScriptedAttempt::write(&[("src/a/lib.rs", "v2")]),
            ],
        );
        let gates = ScriptedGateRunner::sequence(vec![false, true]);

        let UnitOutcome::Passed(passed) =
            run(&fx, &implementer, &gates, &CancelToken::new())
        else {
            panic!("expected a passing attempt");
        };
        assert_eq!(passed.attempt, 2);
        assert_eq!(passed.change_set.files, vec!["src/a/lib.rs"]);

        let entries = fx.ledger.entries_for("a").expect("ledger");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_kind, Some(FailureKind::GateFailure));

        let prompts = implementer.prompts();
        assert!(!prompts[0].contains("### Previous Attempts"));
        assert!(prompts[1].contains("### Previous Attempts"));
        assert!(prompts[1].contains("gate ci failed"));

        let logs = AttemptPaths::new(&fx.paths.logs_dir, "a", 2);
        assert!(logs.meta_path.is_file());
        assert!(logs.prompt_path.is_file());
        assert!(logs.report_path.is_file());
    }

    #[test]
    fn out_of_scope_edits_are_scope_violations() {
        let fx = fixture(1);
        let implementer = ScriptedImplementer::new().script(
            "a",
            vec![ScriptedAttempt::write(&[
                ("src/a/lib.rs", "ok"),
                ("Cargo.toml", "sneaky"),
            ])],
        );
        let outcome = run(&fx, &implementer, &ScriptedGateRunner::always(true), &CancelToken::new());
        assert!(matches!(outcome, UnitOutcome::Failed { attempts: 1, .. }));

        let entry = &fx.ledger.entries_for("a").expect("ledger")[0];
        assert_eq!(entry.failure_kind, Some(FailureKind::ScopeViolation));
        assert!(
            entry
                .failure_reason
                .as_deref()
                .is_some_and(|r| r.contains("Cargo.toml"))
        );
        assert_eq!(
            fx.store.snapshot().expect("plan").units[0].status,
            UnitStatus::Failed
        );
    }

    #[test]
    fn incomplete_and_crashing_implementers_consume_attempts() {
        let fx = fixture(2);
        let implementer = ScriptedImplementer::new().script(
            "a",
            vec![ScriptedAttempt::Incomplete, ScriptedAttempt::crash("agent died")],
        );
        let outcome = run(&fx, &implementer, &ScriptedGateRunner::always(true), &CancelToken::new());
        let UnitOutcome::Failed { attempts, reason } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(attempts, 2);
        assert!(reason.starts_with("implementer_error"));

        let kinds: Vec<_> = fx
            .ledger
            .entries_for("a")
            .expect("ledger")
            .into_iter()
            .map(|e| (e.outcome, e.failure_kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (Outcome::Failed, Some(FailureKind::Incomplete)),
                (Outcome::Failed, Some(FailureKind::ImplementerError)),
            ]
        );
    }

    #[test]
    fn cancellation_before_the_first_attempt_charges_nothing() {
        let fx = fixture(3);
        let cancel = CancelToken::new();
        cancel.cancel();
        let implementer = ScriptedImplementer::new();
        let outcome = run(&fx, &implementer, &ScriptedGateRunner::always(true), &cancel);
        assert!(matches!(outcome, UnitOutcome::Cancelled { attempt: None }));
        assert_eq!(fx.store.snapshot().expect("plan").units[0].attempts, 0);
        assert!(implementer.prompts().is_empty());
    }

    #[test]
    fn context_files_are_written_for_the_implementer() {
        let fx = fixture(1);
        let implementer = ScriptedImplementer::new()
            .script("a", vec![ScriptedAttempt::write(&[("src/a/lib.rs", "ok")])]);
        run(&fx, &implementer, &ScriptedGateRunner::always(true), &CancelToken::new());
        let unit_md =
            fs::read_to_string(fx.paths.context_dir.join("a").join("unit.md")).expect("unit.md");
        assert!(unit_md.contains("- src/a"));
    }
}
