//! Deterministic unit selection over a plan snapshot.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::core::plan::{Plan, Unit};
use crate::core::types::UnitStatus;

/// A pending unit that can never become eligible, with the failed units that
/// hold it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedUnit {
    pub id: String,
    /// Failed transitive dependencies, in declaration order.
    pub failed_ancestors: Vec<String>,
}

/// True if `unit` is pending and every dependency is done.
pub fn is_eligible(plan: &Plan, unit: &Unit) -> bool {
    unit.status == UnitStatus::Pending
        && unit.dependencies.iter().all(|dep| {
            plan.unit(dep)
                .is_some_and(|d| d.status == UnitStatus::Done)
        })
}

/// Eligible units in selection order: lowest priority first, then declaration
/// order.
pub fn eligible_units(plan: &Plan) -> Vec<&Unit> {
    let mut eligible: Vec<(usize, &Unit)> = plan
        .units
        .iter()
        .enumerate()
        .filter(|(_, unit)| is_eligible(plan, unit))
        .collect();
    eligible.sort_by_key(|(index, unit)| (unit.priority, *index));
    eligible.into_iter().map(|(_, unit)| unit).collect()
}

/// The single next unit to run, if any.
pub fn next_unit(plan: &Plan) -> Option<&Unit> {
    eligible_units(plan).into_iter().next()
}

/// No eligible unit, nothing running, and work remains.
pub fn is_stalled(plan: &Plan) -> bool {
    !plan.is_complete()
        && eligible_units(plan).is_empty()
        && !plan.units.iter().any(|u| u.status == UnitStatus::Running)
}

/// Every pending unit with its failed ancestry, in declaration order.
pub fn blocked_units(plan: &Plan) -> Vec<BlockedUnit> {
    let by_id: HashMap<&str, &Unit> = plan.units.iter().map(|u| (u.id.as_str(), u)).collect();
    plan.units
        .iter()
        .filter(|unit| unit.status == UnitStatus::Pending)
        .map(|unit| {
            let ancestors = ancestors_of(&by_id, unit);
            let failed_ancestors = plan
                .units
                .iter()
                .filter(|u| u.status == UnitStatus::Failed && ancestors.contains(u.id.as_str()))
                .map(|u| u.id.clone())
                .collect();
            BlockedUnit {
                id: unit.id.clone(),
                failed_ancestors,
            }
        })
        .collect()
}

fn ancestors_of<'a>(by_id: &HashMap<&'a str, &'a Unit>, unit: &'a Unit) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = unit.dependencies.iter().map(String::as_str).collect();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(dep) = by_id.get(id) {
            stack.extend(dep.dependencies.iter().map(String::as_str));
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_of, unit, unit_with_deps};

    fn with_status(mut u: Unit, status: UnitStatus) -> Unit {
        u.status = status;
        u
    }

    #[test]
    fn selects_lowest_priority_then_declaration_order() {
        let plan = plan_of(vec![unit("late", 5), unit("first", 1), unit("second", 1)]);
        let ids: Vec<&str> = eligible_units(&plan).iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "late"]);
        assert_eq!(next_unit(&plan).map(|u| u.id.as_str()), Some("first"));
    }

    #[test]
    fn dependencies_must_be_done() {
        let plan = plan_of(vec![
            with_status(unit("a", 0), UnitStatus::Running),
            unit_with_deps("b", 0, &["a"]),
        ]);
        assert!(eligible_units(&plan).is_empty());
        assert!(!is_stalled(&plan));

        let plan = plan_of(vec![
            with_status(unit("a", 0), UnitStatus::Done),
            unit_with_deps("b", 0, &["a"]),
        ]);
        assert_eq!(next_unit(&plan).map(|u| u.id.as_str()), Some("b"));
    }

    #[test]
    fn selection_is_deterministic() {
        let plan = plan_of(vec![unit("x", 2), unit("y", 0), unit("z", 2)]);
        let first: Vec<String> = eligible_units(&plan).iter().map(|u| u.id.clone()).collect();
        for _ in 0..10 {
            let again: Vec<String> = eligible_units(&plan).iter().map(|u| u.id.clone()).collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn failed_dependency_blocks_descendants() {
        let plan = plan_of(vec![
            with_status(unit("a", 0), UnitStatus::Failed),
            with_status(unit("ok", 0), UnitStatus::Done),
            unit_with_deps("b", 0, &["a", "ok"]),
            unit_with_deps("c", 0, &["b"]),
        ]);
        assert!(is_stalled(&plan));
        assert_eq!(
            blocked_units(&plan),
            vec![
                BlockedUnit {
                    id: "b".to_string(),
                    failed_ancestors: vec!["a".to_string()],
                },
                BlockedUnit {
                    id: "c".to_string(),
                    failed_ancestors: vec!["a".to_string()],
                },
            ]
        );
    }

    #[test]
    fn complete_plan_is_not_stalled() {
        let plan = plan_of(vec![with_status(unit("a", 0), UnitStatus::Done)]);
        assert!(!is_stalled(&plan));
        assert!(next_unit(&plan).is_none());
    }
}
