//! Execution context for one attempt, and its files under
//! `.runner/context/<unit>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::plan::Unit;
use crate::core::skill::{Skill, SkillSelector};
use crate::io::ledger::{Ledger, LedgerEntry};
use crate::io::vcs::escape_component;

/// Everything the implementer is told about an attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub unit: Unit,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Recent ledger entries for this unit, oldest first.
    pub history: Vec<LedgerEntry>,
    /// Recent ledger entries for other units, oldest first.
    pub learnings: Vec<LedgerEntry>,
    pub skill: Option<Skill>,
}

pub fn assemble_context(
    unit: &Unit,
    attempt: u32,
    max_attempts: u32,
    ledger: &Ledger,
    entries: usize,
    skills: &dyn SkillSelector,
) -> Result<ExecutionContext> {
    let context = ExecutionContext {
        unit: unit.clone(),
        attempt,
        max_attempts,
        history: ledger.recent_for(&unit.id, entries)?,
        learnings: ledger.recent_others(&unit.id, entries)?,
        skill: skills.select(unit),
    };
    debug!(
        unit = %unit.id,
        history = context.history.len(),
        learnings = context.learnings.len(),
        skill = context.skill.as_ref().map(|s| s.name.as_str()),
        "context assembled"
    );
    Ok(context)
}

/// Resolved paths for one unit's context files.
#[derive(Debug, Clone)]
pub struct ContextPaths {
    pub dir: PathBuf,
    pub unit_path: PathBuf,
    pub history_path: PathBuf,
    pub learnings_path: PathBuf,
    pub skill_path: PathBuf,
}

impl ContextPaths {
    pub fn new(context_root: &Path, unit_id: &str) -> Self {
        let dir = context_root.join(escape_component(unit_id));
        Self {
            unit_path: dir.join("unit.md"),
            history_path: dir.join("history.md"),
            learnings_path: dir.join("learnings.md"),
            skill_path: dir.join("skill.md"),
            dir,
        }
    }
}

/// Clear the unit's context directory and write fresh context files.
pub fn write_context(context_root: &Path, context: &ExecutionContext) -> Result<ContextPaths> {
    let paths = ContextPaths::new(context_root, &context.unit.id);
    if paths.dir.exists() {
        fs::remove_dir_all(&paths.dir)
            .with_context(|| format!("remove context dir {}", paths.dir.display()))?;
    }
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create context dir {}", paths.dir.display()))?;

    write_file(&paths.unit_path, &render_unit(&context.unit))?;
    write_file(
        &paths.history_path,
        &render_optional("History (this unit)", &render_entries(&context.history)),
    )?;
    write_file(
        &paths.learnings_path,
        &render_optional("Learnings (other units)", &render_entries(&context.learnings)),
    )?;
    let skill = context
        .skill
        .as_ref()
        .map(|s| format!("{}\n\n{}", s.name, s.instructions.trim()))
        .unwrap_or_default();
    write_file(&paths.skill_path, &render_optional("Skill", &skill))?;
    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

pub fn render_unit(unit: &Unit) -> String {
    let mut buf = format!("# {} ({})\n\n", unit.title, unit.id);
    if !unit.description.trim().is_empty() {
        buf.push_str(unit.description.trim());
        buf.push_str("\n\n");
    }
    buf.push_str("## Acceptance criteria\n\n");
    for criterion in &unit.acceptance_criteria {
        buf.push_str(&format!("- {criterion}\n"));
    }
    buf.push_str("\n## File scope\n\n");
    for pattern in &unit.file_scope {
        buf.push_str(&format!("- {pattern}\n"));
    }
    buf
}

/// One line per entry, oldest first.
pub fn render_entries(entries: &[LedgerEntry]) -> String {
    entries
        .iter()
        .map(describe_entry)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn describe_entry(entry: &LedgerEntry) -> String {
    let mut line = format!(
        "- [{}] {} attempt {}: {}",
        entry.timestamp, entry.unit_id, entry.attempt, entry.outcome
    );
    if let Some(kind) = entry.failure_kind {
        line.push_str(&format!(" ({kind})"));
    }
    if let Some(reason) = entry.failure_reason.as_deref().filter(|r| !r.is_empty()) {
        line.push_str(&format!(" {}", first_line(reason)));
    }
    if !entry.summary.trim().is_empty() {
        line.push_str(&format!(" | {}", first_line(&entry.summary)));
    }
    line
}

fn first_line(text: &str) -> &str {
    text.trim().lines().next().unwrap_or_default()
}

fn render_optional(title: &str, body: &str) -> String {
    let content = if body.trim().is_empty() {
        "None."
    } else {
        body.trim()
    };
    format!("# {title}\n\n{content}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::skill::NoSkills;
    use crate::core::types::FailureKind;
    use crate::test_support::unit_with_scope;

    #[test]
    fn assembles_history_and_learnings_separately() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(temp.path().join("ledger.jsonl"));
        ledger
            .append(&LedgerEntry::failed(
                "a",
                1,
                FailureKind::GateFailure,
                "gate ci failed",
                "",
                Vec::new(),
            ))
            .expect("append");
        ledger
            .append(&LedgerEntry::done("b", 1, "added parser", Vec::new()))
            .expect("append");

        let a = unit_with_scope("a", 0, &["src/a"]);
        let context = assemble_context(&a, 2, 3, &ledger, 5, &NoSkills).expect("context");
        assert_eq!(context.history.len(), 1);
        assert_eq!(context.learnings[0].unit_id, "b");
        assert!(context.skill.is_none());
    }

    #[test]
    fn rewrite_clears_previous_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("context");
        let paths = ContextPaths::new(&root, "a");
        fs::create_dir_all(&paths.dir).expect("create");
        fs::write(paths.dir.join("stale.txt"), "stale").expect("write");

        let context = ExecutionContext {
            unit: unit_with_scope("a", 0, &["src/a"]),
            attempt: 1,
            max_attempts: 3,
            history: Vec::new(),
            learnings: Vec::new(),
            skill: None,
        };
        let paths = write_context(&root, &context).expect("write");
        assert!(!paths.dir.join("stale.txt").exists());
        assert!(fs::read_to_string(&paths.unit_path).expect("unit").contains("- src/a"));
        assert!(fs::read_to_string(&paths.history_path).expect("history").contains("None."));
        assert!(paths.skill_path.is_file());
    }

    #[test]
    fn entry_description_is_one_line() {
        let entry = LedgerEntry::failed(
            "a",
            2,
            FailureKind::ScopeViolation,
            "touched outside scope: Cargo.lock\nsecond line",
            "",
            Vec::new(),
        );
        let line = describe_entry(&entry);
        assert!(line.contains("a attempt 2: failed (scope_violation) touched outside scope: Cargo.lock"));
        assert!(!line.contains('\n'));
    }
}
