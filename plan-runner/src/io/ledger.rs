//! Append-only progress ledger (`.runner/ledger.jsonl`).
//!
//! Every attempt outcome becomes one JSON line. Lines are never rewritten. The
//! ledger is handed to the engine as a shared service; queries feed the
//! execution context of later attempts.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{FailureKind, GateResult, Outcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub unit_id: String,
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub attempt: u32,
    pub outcome: Outcome,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub gates: Vec<GateResult>,
}

impl LedgerEntry {
    fn now(unit_id: &str, attempt: u32, outcome: Outcome) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            attempt,
            outcome,
            summary: String::new(),
            failure_kind: None,
            failure_reason: None,
            gates: Vec::new(),
        }
    }

    pub fn done(unit_id: &str, attempt: u32, summary: &str, gates: Vec<GateResult>) -> Self {
        Self {
            summary: summary.to_string(),
            gates,
            ..Self::now(unit_id, attempt, Outcome::Done)
        }
    }

    pub fn failed(
        unit_id: &str,
        attempt: u32,
        kind: FailureKind,
        reason: &str,
        summary: &str,
        gates: Vec<GateResult>,
    ) -> Self {
        Self {
            summary: summary.to_string(),
            failure_kind: Some(kind),
            failure_reason: Some(reason.to_string()),
            gates,
            ..Self::now(unit_id, attempt, Outcome::Failed)
        }
    }

    /// Merge conflict: the unit goes back to the queue uncharged.
    pub fn requeued(unit_id: &str, attempt: u32, reason: &str, summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            failure_kind: Some(FailureKind::MergeConflict),
            failure_reason: Some(reason.to_string()),
            ..Self::now(unit_id, attempt, Outcome::Requeued)
        }
    }

    pub fn cancelled(unit_id: &str, attempt: u32) -> Self {
        Self {
            summary: "run cancelled".to_string(),
            ..Self::now(unit_id, attempt, Outcome::Cancelled)
        }
    }
}

/// Shared handle to the ledger file. One writer lock serializes appends and
/// keeps readers from observing a half-written line.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|_| anyhow!("ledger lock poisoned"))
    }

    #[instrument(skip_all, fields(unit = %entry.unit_id, attempt = entry.attempt, outcome = ?entry.outcome))]
    pub fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("serialize ledger entry")?;
        line.push('\n');

        let _guard = self.guard()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append ledger {}", self.path.display()))?;
        debug!("ledger entry appended");
        Ok(())
    }

    /// All entries in append order. A missing ledger is empty.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let _guard = self.guard()?;
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read ledger {}", self.path.display()))?;
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("parse ledger {} line {}", self.path.display(), index + 1)
                })
            })
            .collect()
    }

    pub fn entries_for(&self, unit_id: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.unit_id == unit_id)
            .collect())
    }

    /// The `n` most recent entries for `unit_id`, oldest first.
    pub fn recent_for(&self, unit_id: &str, n: usize) -> Result<Vec<LedgerEntry>> {
        Ok(last_n(self.entries_for(unit_id)?, n))
    }

    /// The `n` most recent entries across all units, oldest first.
    pub fn recent_global(&self, n: usize) -> Result<Vec<LedgerEntry>> {
        Ok(last_n(self.entries()?, n))
    }

    /// The `n` most recent entries for units other than `unit_id`, oldest first.
    pub fn recent_others(&self, unit_id: &str, n: usize) -> Result<Vec<LedgerEntry>> {
        let others = self
            .entries()?
            .into_iter()
            .filter(|entry| entry.unit_id != unit_id)
            .collect();
        Ok(last_n(others, n))
    }
}

fn last_n(mut entries: Vec<LedgerEntry>, n: usize) -> Vec<LedgerEntry> {
    let skip = entries.len().saturating_sub(n);
    entries.drain(..skip);
    entries
}
