//! Plan load/save with schema + invariant validation, and the shared store
//! that serializes every unit state change to disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::invariants::validate_invariants;
use crate::core::plan::Plan;
use crate::core::state_update;
use crate::core::types::UnitStatus;
use crate::error::EngineError;

pub const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");

/// Parse and validate a plan document.
///
/// Schema violations and graph problems are collected and reported together as
/// [`EngineError::MalformedPlan`].
pub fn parse_plan(contents: &str) -> Result<Plan> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|err| EngineError::malformed(vec![format!("invalid JSON: {err}")]))?;

    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse embedded plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("invalid plan schema: {err}"))?;
    let schema_errors: Vec<String> = compiled.iter_errors(&value).map(|e| e.to_string()).collect();
    if !schema_errors.is_empty() {
        return Err(EngineError::malformed(schema_errors).into());
    }

    let plan: Plan = serde_json::from_value(value)
        .map_err(|err| EngineError::malformed(vec![err.to_string()]))?;
    let problems = validate_invariants(&plan);
    if !problems.is_empty() {
        return Err(EngineError::malformed(problems).into());
    }
    Ok(plan)
}

#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let plan = parse_plan(&contents).with_context(|| format!("load plan {}", path.display()))?;
    debug!(units = plan.units.len(), "plan loaded");
    Ok(plan)
}

/// Atomically write a plan (temp file + rename).
pub fn write_plan(path: &Path, plan: &Plan) -> Result<()> {
    let mut plan = plan.clone();
    plan.refresh_complete();
    let mut buf = serde_json::to_string_pretty(&plan).context("serialize plan")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("plan path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace plan {}", path.display()))?;
    Ok(())
}

/// Shared, persistent plan state.
///
/// One mutex covers the in-memory plan and the on-disk write. An update is
/// applied to a copy, persisted, and only then published, so a failed write
/// leaves memory and disk in agreement.
#[derive(Debug)]
pub struct PlanStore {
    path: PathBuf,
    plan: Mutex<Plan>,
}

impl PlanStore {
    /// Load and validate the plan at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let plan = load_plan(path)?;
        Ok(Self::from_plan(path, plan))
    }

    /// Wrap an already-validated plan. Nothing is written until the first update.
    pub fn from_plan(path: &Path, plan: Plan) -> Self {
        Self {
            path: path.to_path_buf(),
            plan: Mutex::new(plan),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Plan>> {
        self.plan
            .lock()
            .map_err(|_| anyhow!("plan store lock poisoned"))
    }

    fn update<T>(
        &self,
        apply: impl FnOnce(&mut Plan) -> Result<T, EngineError>,
    ) -> Result<T> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let value = apply(&mut next)?;
        next.refresh_complete();
        write_plan(&self.path, &next)?;
        *guard = next;
        Ok(value)
    }

    /// Consistent copy of the current plan.
    pub fn snapshot(&self) -> Result<Plan> {
        Ok(self.lock()?.clone())
    }

    pub fn is_complete(&self) -> Result<bool> {
        Ok(self.lock()?.is_complete())
    }

    #[instrument(skip(self))]
    pub fn mark_running(&self, id: &str) -> Result<()> {
        self.update(|plan| state_update::mark_running(plan, id))?;
        debug!("unit running");
        Ok(())
    }

    /// Charge one attempt to a running unit; returns the attempt number.
    #[instrument(skip(self))]
    pub fn record_attempt(&self, id: &str) -> Result<u32> {
        let attempt = self.update(|plan| state_update::record_attempt(plan, id))?;
        debug!(attempt, "attempt recorded");
        Ok(attempt)
    }

    #[instrument(skip(self, summary))]
    pub fn mark_done(&self, id: &str, summary: &str) -> Result<()> {
        self.update(|plan| state_update::mark_done(plan, id, summary))?;
        info!("unit done");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<()> {
        self.update(|plan| state_update::mark_failed(plan, id, reason))?;
        warn!("unit failed");
        Ok(())
    }

    /// Running -> pending without a refund.
    #[instrument(skip(self))]
    pub fn release(&self, id: &str, reason: &str) -> Result<()> {
        self.update(|plan| state_update::release(plan, id, reason))?;
        info!("unit released");
        Ok(())
    }

    /// Running -> pending, refunding the attempt.
    #[instrument(skip(self))]
    pub fn requeue(&self, id: &str, reason: &str) -> Result<()> {
        self.update(|plan| state_update::requeue(plan, id, reason))?;
        info!("unit requeued");
        Ok(())
    }

    /// Reset units a crashed run left `running`. Writes only if something changed.
    pub fn recover_interrupted(&self) -> Result<Vec<String>> {
        if self.lock()?.ids_with_status(UnitStatus::Running).is_empty() {
            return Ok(Vec::new());
        }
        let recovered = self.update(|plan| Ok(state_update::recover_interrupted(plan)))?;
        if !recovered.is_empty() {
            warn!(units = ?recovered, "recovered units from interrupted run");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_of, unit, unit_with_deps, unit_with_scope};

    #[test]
    fn persist_then_reload_is_equal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        let mut plan = plan_of(vec![
            unit_with_scope("a", 1, &["src/a", "docs/*.md"]),
            unit_with_deps("b", 0, &["a"]),
        ]);
        plan.units[0].acceptance_criteria = vec!["compiles".to_string()];
        plan.branch = Some("main".to_string());

        write_plan(&path, &plan).expect("write");
        let loaded = load_plan(&path).expect("load");
        assert_eq!(loaded, plan);
    }

    #[test]
    fn cyclic_plan_is_malformed() {
        let doc = r#"{"units": [
            {"id": "a", "title": "A", "dependencies": ["b"]},
            {"id": "b", "title": "B", "dependencies": ["a"]}
        ]}"#;
        let err = parse_plan(doc).unwrap_err();
        assert!(EngineError::is_malformed_plan(&err));
        assert!(err.to_string().contains("dependency cycle among units: a, b"));
    }

    #[test]
    fn every_problem_is_reported() {
        let doc = r#"{"units": [{"id": "a"}]}"#;
        let err = parse_plan(doc).unwrap_err();
        assert!(EngineError::is_malformed_plan(&err));
        assert!(err.to_string().contains("title"));

        let doc = r#"{"units": [
            {"id": "a", "title": "A", "dependencies": ["ghost"]},
            {"id": "a", "title": "again"}
        ]}"#;
        let msg = parse_plan(doc).unwrap_err().to_string();
        assert!(msg.contains("duplicate unit id 'a'"));
        assert!(msg.contains("unknown dependency 'ghost'"));
    }

    #[test]
    fn updates_are_persisted_immediately() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        write_plan(&path, &plan_of(vec![unit("a", 0)])).expect("write");

        let store = PlanStore::open(&path).expect("open");
        store.mark_running("a").expect("running");
        assert_eq!(store.record_attempt("a").expect("attempt"), 1);
        store.mark_done("a", "implemented").expect("done");

        let on_disk = load_plan(&path).expect("reload");
        assert_eq!(on_disk, store.snapshot().expect("snapshot"));
        assert_eq!(on_disk.units[0].status, UnitStatus::Done);
        assert!(on_disk.complete);
    }

    #[test]
    fn rejected_transition_leaves_state_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        let store = PlanStore::from_plan(&path, plan_of(vec![unit("a", 0)]));

        let err = store.mark_done("a", "too early").unwrap_err();
        assert!(err.to_string().contains("invalid transition pending -> done"));
        assert!(!path.exists());
        assert_eq!(
            store.snapshot().expect("snapshot").units[0].status,
            UnitStatus::Pending
        );
    }
}
