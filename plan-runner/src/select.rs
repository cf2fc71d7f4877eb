//! Selection helpers for `plan-runner next` and `plan-runner batches`.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::batch::conflict_free_groups;
use crate::core::plan::Plan;
use crate::core::selector::{BlockedUnit, blocked_units, is_stalled, next_unit};
use crate::core::types::UnitStatus;
use crate::io::plan_store::load_plan;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Every unit is done.
    Complete,
    /// The unit a run would start next.
    Ready(String),
    /// Nothing is eligible until running units finish.
    Waiting { running: Vec<String> },
    /// Work remains but nothing can ever become eligible.
    Blocked(Vec<BlockedUnit>),
}

/// Select the next unit from an in-memory plan.
pub fn select_unit(plan: &Plan) -> SelectOutcome {
    if plan.is_complete() {
        return SelectOutcome::Complete;
    }
    if let Some(unit) = next_unit(plan) {
        return SelectOutcome::Ready(unit.id.clone());
    }
    if is_stalled(plan) {
        return SelectOutcome::Blocked(blocked_units(plan));
    }
    SelectOutcome::Waiting {
        running: plan.ids_with_status(UnitStatus::Running),
    }
}

/// Load the plan from disk and select the next unit.
pub fn select_from_path(plan_path: &Path) -> Result<SelectOutcome> {
    let plan = load_plan(plan_path).with_context(|| "load plan for selection")?;
    Ok(select_unit(&plan))
}

/// Conflict-free groups of the eligible set, in the order a run would
/// schedule them.
pub fn batches_from_path(plan_path: &Path) -> Result<Vec<Vec<String>>> {
    let plan = load_plan(plan_path).with_context(|| "load plan for batching")?;
    Ok(conflict_free_groups(&plan, &HashSet::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::plan_store::write_plan;
    use crate::test_support::{plan_of, unit, unit_with_deps, unit_with_scope};

    #[test]
    fn select_prefers_lowest_priority() {
        let plan = plan_of(vec![unit("a", 2), unit("b", 1), unit("c", 1)]);
        assert_eq!(select_unit(&plan), SelectOutcome::Ready("b".to_string()));
    }

    #[test]
    fn select_reports_failed_ancestry_when_blocked() {
        let mut plan = plan_of(vec![
            unit("a", 0),
            unit_with_deps("b", 0, &["a"]),
            unit_with_deps("c", 0, &["b"]),
        ]);
        plan.units[0].status = UnitStatus::Failed;
        assert_eq!(
            select_unit(&plan),
            SelectOutcome::Blocked(vec![
                BlockedUnit {
                    id: "b".to_string(),
                    failed_ancestors: vec!["a".to_string()],
                },
                BlockedUnit {
                    id: "c".to_string(),
                    failed_ancestors: vec!["a".to_string()],
                },
            ])
        );
    }

    #[test]
    fn select_waits_on_running_units() {
        let mut plan = plan_of(vec![unit("a", 0), unit_with_deps("b", 0, &["a"])]);
        plan.units[0].status = UnitStatus::Running;
        assert_eq!(
            select_unit(&plan),
            SelectOutcome::Waiting {
                running: vec!["a".to_string()]
            }
        );
    }

    #[test]
    fn select_returns_complete_when_all_done() {
        let mut plan = plan_of(vec![unit("a", 0)]);
        plan.units[0].status = UnitStatus::Done;
        assert_eq!(select_unit(&plan), SelectOutcome::Complete);
    }

    #[test]
    fn batches_are_read_from_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        write_plan(
            &path,
            &plan_of(vec![
                unit_with_scope("a", 0, &["src/a"]),
                unit_with_scope("b", 0, &["src/a/b.rs"]),
                unit_with_scope("c", 0, &["docs"]),
            ]),
        )
        .expect("write");
        assert_eq!(
            batches_from_path(&path).expect("batches"),
            vec![vec!["a", "c"], vec!["b"]]
        );
    }
}
