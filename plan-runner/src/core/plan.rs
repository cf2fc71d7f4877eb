use serde::{Deserialize, Serialize};

use crate::core::types::UnitStatus;

/// A work plan: units in declaration order plus run-level metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default = "default_plan_id")]
    pub id: String,
    /// Integration branch. `None` means "whatever branch the repository is on".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub complete: bool,
    pub units: Vec<Unit>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub file_scope: Vec<String>,
    #[serde(default)]
    pub status: UnitStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub notes: Vec<String>,
}

fn default_plan_id() -> String {
    "plan".to_string()
}

impl Plan {
    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.iter().find(|unit| unit.id == id)
    }

    pub fn unit_mut(&mut self, id: &str) -> Option<&mut Unit> {
        self.units.iter_mut().find(|unit| unit.id == id)
    }

    /// Declaration index of a unit, used as the scheduling tie-breaker.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.units.iter().position(|unit| unit.id == id)
    }

    pub fn is_complete(&self) -> bool {
        self.units.iter().all(|unit| unit.status == UnitStatus::Done)
    }

    pub fn ids_with_status(&self, status: UnitStatus) -> Vec<String> {
        self.units
            .iter()
            .filter(|unit| unit.status == status)
            .map(|unit| unit.id.clone())
            .collect()
    }

    /// Recompute derived fields before persisting.
    pub fn refresh_complete(&mut self) {
        self.complete = self.is_complete();
    }
}

/// Plan used by `plan-runner init` when no plan exists yet.
pub fn template_plan() -> Plan {
    Plan {
        id: "plan".to_string(),
        branch: None,
        complete: false,
        units: vec![Unit {
            id: "example".to_string(),
            title: "Describe the first unit of work".to_string(),
            description: "Replace this unit with real work.".to_string(),
            acceptance_criteria: vec!["The change is covered by a test".to_string()],
            priority: 0,
            dependencies: Vec::new(),
            file_scope: vec!["src/".to_string()],
            status: UnitStatus::Pending,
            attempts: 0,
            notes: Vec::new(),
        }],
    }
}
