//! Semantic invariants not expressible via JSON Schema.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::core::plan::Plan;
use crate::core::scope::parse_scope;

/// Check semantic invariants of a plan:
/// - No empty or duplicate unit ids
/// - Every dependency names a declared unit
/// - No unit depends on itself
/// - Every file-scope entry is a valid relative path or glob
/// - The dependency graph is acyclic
///
/// Returns every violation found; an empty list means the plan is valid.
pub fn validate_invariants(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, unit) in plan.units.iter().enumerate() {
        if unit.id.trim().is_empty() {
            errors.push(format!("units[{index}]: id must not be empty"));
            continue;
        }
        if !seen.insert(unit.id.as_str()) {
            errors.push(format!("duplicate unit id '{}'", unit.id));
        }
    }

    let declared: HashSet<&str> = plan.units.iter().map(|u| u.id.as_str()).collect();
    for unit in &plan.units {
        for dep in &unit.dependencies {
            if dep == &unit.id {
                errors.push(format!("{}: depends on itself", unit.id));
            } else if !declared.contains(dep.as_str()) {
                errors.push(format!("{}: unknown dependency '{}'", unit.id, dep));
            }
        }
        if let Err(problems) = parse_scope(&unit.file_scope) {
            for problem in problems {
                errors.push(format!("{}: fileScope {}", unit.id, problem));
            }
        }
    }

    // Cycle detection only makes sense once every edge resolves.
    if errors.is_empty()
        && let Err(stuck) = topological_order(plan)
    {
        errors.push(format!(
            "dependency cycle among units: {}",
            stuck.join(", ")
        ));
    }

    errors
}

/// Kahn topological sort over dependency edges.
///
/// Returns unit ids in an order where every unit follows its dependencies
/// (ties resolved by declaration order). If the graph has a cycle, returns the
/// ids that were never reached, sorted.
pub fn topological_order(plan: &Plan) -> Result<Vec<String>, Vec<String>> {
    let index: HashMap<&str, usize> = plan
        .units
        .iter()
        .enumerate()
        .map(|(i, unit)| (unit.id.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; plan.units.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plan.units.len()];
    for (i, unit) in plan.units.iter().enumerate() {
        let deps: BTreeSet<&str> = unit.dependencies.iter().map(String::as_str).collect();
        for dep in deps {
            if let Some(&d) = index.get(dep) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..plan.units.len())
        .filter(|&i| indegree[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(plan.units.len());
    while let Some(i) = ready.pop_front() {
        order.push(plan.units[i].id.clone());
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() == plan.units.len() {
        return Ok(order);
    }
    let reached: HashSet<&str> = order.iter().map(String::as_str).collect();
    let mut stuck: Vec<String> = plan
        .units
        .iter()
        .filter(|unit| !reached.contains(unit.id.as_str()))
        .map(|unit| unit.id.clone())
        .collect();
    stuck.sort();
    Err(stuck)
}
