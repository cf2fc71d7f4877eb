//! Per-attempt artifacts under `.runner/logs/<unit>/<attempt>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{FailureKind, GateResult, ImplementerReport};
use crate::io::vcs::escape_component;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptMeta {
    pub unit_id: String,
    pub attempt: u32,
    pub workspace: String,
    pub base: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub gates: Vec<GateResult>,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub implementer_log_path: PathBuf,
    pub report_path: PathBuf,
    pub gates_log_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(logs_dir: &Path, unit_id: &str, attempt: u32) -> Self {
        let dir = logs_dir
            .join(escape_component(unit_id))
            .join(attempt.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            implementer_log_path: dir.join("implementer.log"),
            report_path: dir.join("report.json"),
            gates_log_path: dir.join("gates.log"),
            dir,
        }
    }

    /// Start a fresh attempt directory. A leftover directory from a refunded
    /// attempt with the same number is replaced.
    pub fn prepare(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("remove attempt dir {}", self.dir.display()))?;
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create attempt dir {}", self.dir.display()))
    }

    pub fn write_prompt(&self, prompt: &str) -> Result<()> {
        write_text(&self.prompt_path, prompt)
    }

    /// Persist the parsed report when the implementer did not leave one.
    pub fn write_report(&self, report: &ImplementerReport) -> Result<()> {
        if self.report_path.exists() {
            return Ok(());
        }
        write_json(&self.report_path, report)
    }

    pub fn write_meta(&self, meta: &AttemptMeta) -> Result<()> {
        write_json(&self.meta_path, meta)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
