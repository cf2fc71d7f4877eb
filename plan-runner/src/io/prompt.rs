//! Implementer prompt rendering within a byte budget.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::io::context::{ExecutionContext, render_entries};

const IMPLEMENTER_TEMPLATE: &str = include_str!("prompts/implementer.md");

/// Least important first.
const DROP_ORDER: [&str; 3] = ["learnings", "history", "skill"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

#[derive(Debug, Clone, Serialize)]
struct UnitView<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    acceptance_criteria: &'a [String],
    file_scope: &'a [String],
}

#[derive(Debug, Clone, Serialize)]
struct SkillView<'a> {
    name: &'a str,
    instructions: &'a str,
}

/// A rendered section, keyed by its marker.
#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Drop droppable sections in [`DROP_ORDER`] until the prompt fits, then
/// truncate the last section if it still does not.
fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    if let Some(last) = sections.last_mut() {
        let allowed = last.content.len().saturating_sub(total - budget);
        let marker = "\n[truncated]";
        let mut cut = allowed.saturating_sub(marker.len());
        while !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        let before_len = last.content.len();
        last.content.truncate(cut);
        if allowed >= marker.len() {
            last.content.push_str(marker);
        }
        debug!(section = %last.key, before_len, after_len = last.content.len(), "truncated section for budget");
    }
}

/// Renders implementer prompts from an [`ExecutionContext`].
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("implementer", IMPLEMENTER_TEMPLATE)?;
        Ok(Self { env, budget_bytes })
    }

    pub fn build(&self, ctx: &ExecutionContext) -> Result<String> {
        let unit = UnitView {
            id: &ctx.unit.id,
            title: &ctx.unit.title,
            description: ctx.unit.description.trim(),
            acceptance_criteria: &ctx.unit.acceptance_criteria,
            file_scope: &ctx.unit.file_scope,
        };
        let skill = ctx.skill.as_ref().map(|s| SkillView {
            name: &s.name,
            instructions: s.instructions.trim(),
        });
        let history = render_entries(&ctx.history);
        let learnings = render_entries(&ctx.learnings);

        let rendered = self.env.get_template("implementer")?.render(context! {
            attempt => ctx.attempt,
            max_attempts => ctx.max_attempts,
            unit => unit,
            skill => skill,
            history => (!history.is_empty()).then_some(history),
            learnings => (!learnings.is_empty()).then_some(learnings),
        })?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::skill::Skill;
    use crate::core::types::FailureKind;
    use crate::io::ledger::LedgerEntry;
    use crate::test_support::unit_with_scope;

    fn context_with(history: usize, learnings: usize) -> ExecutionContext {
        let mut unit = unit_with_scope("parser", 0, &["src/parser"]);
        unit.acceptance_criteria = vec!["parses empty input".to_string()];
        ExecutionContext {
            unit,
            attempt: 2,
            max_attempts: 3,
            history: (0..history)
                .map(|i| {
                    LedgerEntry::failed(
                        "parser",
                        i as u32 + 1,
                        FailureKind::GateFailure,
                        "gate ci failed",
                        &"h".repeat(200),
                        Vec::new(),
                    )
                })
                .collect(),
            learnings: (0..learnings)
                .map(|i| LedgerEntry::done(&format!("other-{i}"), 1, &"l".repeat(200), Vec::new()))
                .collect(),
            skill: Some(Skill {
                name: "rust".to_string(),
                description: String::new(),
                keywords: Vec::new(),
                instructions: "Run cargo fmt.".to_string(),
            }),
        }
    }

    #[test]
    fn sections_appear_in_stable_order() {
        let prompt = PromptBuilder::new(100_000)
            .expect("builder")
            .build(&context_with(1, 1))
            .expect("build");
        let contract = prompt.find("### Implementer Contract").expect("contract");
        let unit = prompt.find("### Unit").expect("unit");
        let skill = prompt.find("### Skill: rust").expect("skill");
        let history = prompt.find("### Previous Attempts").expect("history");
        let learnings = prompt.find("### Plan Learnings").expect("learnings");
        assert!(contract < unit && unit < skill && skill < history && history < learnings);
        assert!(prompt.contains("attempt 2 of 3"));
        assert!(prompt.contains("- src/parser"));
        assert!(prompt.contains("- parses empty input"));
    }

    #[test]
    fn empty_context_sections_are_omitted() {
        let mut ctx = context_with(0, 0);
        ctx.skill = None;
        let prompt = PromptBuilder::new(100_000)
            .expect("builder")
            .build(&ctx)
            .expect("build");
        assert!(!prompt.contains("### Previous Attempts"));
        assert!(!prompt.contains("### Plan Learnings"));
        assert!(!prompt.contains("### Skill"));
    }

    #[test]
    fn budget_drops_learnings_before_history() {
        let ctx = context_with(3, 10);
        let builder = PromptBuilder::new(100_000).expect("builder");
        let full = builder.build(&ctx).expect("build");
        let learnings_len = full.len() - full.find("### Plan Learnings").expect("learnings");

        let tight = PromptBuilder::new(full.len() - learnings_len + 10)
            .expect("builder")
            .build(&ctx)
            .expect("build");
        assert!(!tight.contains("### Plan Learnings"));
        assert!(tight.contains("### Previous Attempts"));
        assert!(tight.contains("### Implementer Contract"));
    }

    #[test]
    fn required_sections_survive_any_budget() {
        let prompt = PromptBuilder::new(300)
            .expect("builder")
            .build(&context_with(5, 5))
            .expect("build");
        assert!(prompt.contains("### Implementer Contract"));
        assert!(!prompt.contains("### Previous Attempts"));
        assert!(!prompt.contains("### Skill"));
    }
}
