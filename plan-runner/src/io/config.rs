//! Runner configuration stored under `.runner/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::skill::{
    EmbeddingSelector, HashingEmbedder, KeywordSelector, NoSkills, Skill, SkillSelector,
};

/// Runner configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Attempts a unit may consume before it is marked failed.
    pub max_attempts: u32,

    /// Units executed concurrently within one batch.
    pub max_workers: usize,

    /// Wall-clock budget per attempt (implementer + gates), in seconds.
    pub attempt_timeout_secs: u64,

    /// Ledger entries of each kind (this unit / other units) shown to the implementer.
    pub context_entries: usize,

    /// Upper bound for the rendered implementer prompt.
    pub prompt_budget_bytes: usize,

    pub implementer_output_limit_bytes: usize,
    pub gate_output_limit_bytes: usize,

    pub implementer: ImplementerConfig,

    /// Quality gates, run in order. An empty list passes vacuously.
    pub gates: Vec<GateConfig>,

    pub skills: SkillsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImplementerConfig {
    /// Program and arguments. `{output}`, `{schema}`, `{unit}` and `{context}`
    /// are substituted per attempt; the prompt arrives on stdin.
    pub command: Vec<String>,
}

impl Default for ImplementerConfig {
    fn default() -> Self {
        Self {
            command: [
                "codex",
                "exec",
                "--sandbox",
                "workspace-write",
                "--skip-git-repo-check",
                "--output-schema",
                "{schema}",
                "--output-last-message",
                "{output}",
                "-",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateConfig {
    pub name: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SkillStrategy {
    #[default]
    Keyword,
    Embedding,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SkillsConfig {
    pub strategy: SkillStrategy,
    /// Cosine similarity a skill must reach under the `embedding` strategy.
    pub min_similarity: f32,
    pub catalog: Vec<Skill>,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            strategy: SkillStrategy::Keyword,
            min_similarity: 0.2,
            catalog: Vec::new(),
        }
    }
}

impl SkillsConfig {
    pub fn selector(&self) -> Box<dyn SkillSelector> {
        if self.catalog.is_empty() {
            return Box::new(NoSkills);
        }
        match self.strategy {
            SkillStrategy::Keyword => Box::new(KeywordSelector::new(self.catalog.clone())),
            SkillStrategy::Embedding => Box::new(EmbeddingSelector::new(
                HashingEmbedder::default(),
                self.catalog.clone(),
                self.min_similarity,
            )),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_workers: 2,
            attempt_timeout_secs: 30 * 60,
            context_entries: 5,
            prompt_budget_bytes: 40_000,
            implementer_output_limit_bytes: 100_000,
            gate_output_limit_bytes: 100_000,
            implementer: ImplementerConfig::default(),
            gates: vec![GateConfig {
                name: "ci".to_string(),
                command: vec!["just".to_string(), "ci".to_string()],
            }],
            skills: SkillsConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be > 0"));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(anyhow!("attempt_timeout_secs must be > 0"));
        }
        if self.implementer_output_limit_bytes == 0 {
            return Err(anyhow!("implementer_output_limit_bytes must be > 0"));
        }
        if self.gate_output_limit_bytes == 0 {
            return Err(anyhow!("gate_output_limit_bytes must be > 0"));
        }
        if !is_runnable(&self.implementer.command) {
            return Err(anyhow!("implementer.command must be a non-empty array"));
        }
        let mut names = std::collections::HashSet::new();
        for gate in &self.gates {
            if gate.name.trim().is_empty() {
                return Err(anyhow!("gate name must not be empty"));
            }
            if !names.insert(gate.name.as_str()) {
                return Err(anyhow!("duplicate gate name '{}'", gate.name));
            }
            if !is_runnable(&gate.command) {
                return Err(anyhow!("gate '{}': command must be a non-empty array", gate.name));
            }
        }
        if !(0.0..=1.0).contains(&self.skills.min_similarity) {
            return Err(anyhow!("skills.min_similarity must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

fn is_runnable(command: &[String]) -> bool {
    command.first().is_some_and(|program| !program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RunnerConfig::default();
        cfg.skills.catalog.push(Skill {
            name: "db".to_string(),
            description: "database work".to_string(),
            keywords: vec!["sql".to_string()],
            instructions: "Write a migration.".to_string(),
        });
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_workers = 4\n\n[[gates]]\nname = \"test\"\ncommand = [\"cargo\", \"test\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_workers, 4);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.gates.len(), 1);
        assert_eq!(cfg.gates[0].name, "test");
    }

    #[test]
    fn rejects_duplicate_gate_names() {
        let mut cfg = RunnerConfig::default();
        cfg.gates.push(cfg.gates[0].clone());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate gate name 'ci'"));
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = RunnerConfig {
            max_workers: 0,
            ..RunnerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
