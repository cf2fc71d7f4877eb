//! Partition of the eligible set into conflict-free batches.

use std::collections::HashSet;

use crate::core::plan::{Plan, Unit};
use crate::core::scope::scopes_overlap;
use crate::core::selector::eligible_units;

/// True if the two units may touch a common path.
pub fn conflicts(a: &Unit, b: &Unit) -> bool {
    scopes_overlap(&a.file_scope, &b.file_scope)
}

/// Greedy first-fit partition of the eligible units, in selection order.
///
/// Every group has pairwise disjoint file scopes. Units listed in `serial`
/// always form their own singleton group. The first group is the next batch
/// to run; the rest are what would follow if nothing changed.
pub fn conflict_free_groups(plan: &Plan, serial: &HashSet<String>) -> Vec<Vec<String>> {
    let mut groups: Vec<(bool, Vec<&Unit>)> = Vec::new();
    for unit in eligible_units(plan) {
        if serial.contains(&unit.id) {
            groups.push((true, vec![unit]));
            continue;
        }
        let slot = groups.iter_mut().find(|(is_serial, members)| {
            !*is_serial && members.iter().all(|member| !conflicts(member, unit))
        });
        match slot {
            Some((_, members)) => members.push(unit),
            None => groups.push((false, vec![unit])),
        }
    }
    groups
        .into_iter()
        .map(|(_, members)| members.into_iter().map(|u| u.id.clone()).collect())
        .collect()
}

/// The batch to run next: the first conflict-free group.
pub fn next_batch(plan: &Plan, serial: &HashSet<String>) -> Vec<String> {
    conflict_free_groups(plan, serial)
        .into_iter()
        .next()
        .unwrap_or_default()
}
