//! Quality gates: ordered, fail-fast verification commands.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::GateResult;
use crate::error::EngineError;
use crate::io::config::GateConfig;
use crate::io::process::run_command;

const DETAIL_TAIL_BYTES: usize = 2_000;

#[derive(Debug, Clone)]
pub struct GateRequest {
    pub workdir: PathBuf,
    /// Gate output is appended here, one section per gate.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait GateRunner: Send + Sync {
    fn run(&self, gate: &GateConfig, request: &GateRequest) -> Result<GateResult>;
}

/// Runs each gate's command in the workspace.
pub struct CommandGateRunner;

impl GateRunner for CommandGateRunner {
    #[instrument(skip_all, fields(gate = %gate.name, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, gate: &GateConfig, request: &GateRequest) -> Result<GateResult> {
        let (program, args) = gate
            .command
            .split_first()
            .ok_or_else(|| anyhow!("gate '{}' has an empty command", gate.name))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        let output = match run_command(cmd, None, request.timeout, request.output_limit_bytes, None)
        {
            Ok(output) => output,
            Err(err) if EngineError::is_spawn(&err) => {
                let detail = format!("{err:#}");
                warn!(err = %detail, "gate could not start");
                append_gate_log(&request.log_path, &gate.name, &detail)?;
                return Ok(GateResult::fail(&gate.name, detail));
            }
            Err(err) => return Err(err).with_context(|| format!("run gate {}", gate.name)),
        };
        append_gate_log(
            &request.log_path,
            &gate.name,
            &output.render_log(&format!("gate {}", gate.name)),
        )?;

        if output.timed_out {
            warn!("gate timed out");
            return Ok(GateResult {
                timed_out: true,
                ..GateResult::fail(
                    &gate.name,
                    format!("timed out after {}s", request.timeout.as_secs()),
                )
            });
        }
        if output.status.success() {
            debug!("gate passed");
            Ok(GateResult::pass(&gate.name, "ok"))
        } else {
            warn!(exit_code = ?output.status.code(), "gate failed");
            Ok(GateResult::fail(
                &gate.name,
                format!(
                    "exit status {:?}\n{}",
                    output.status.code(),
                    output.tail(DETAIL_TAIL_BYTES)
                ),
            ))
        }
    }
}

/// Overall verdict of a gate run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    /// Every gate passed (vacuously true with no gates).
    Passed(Vec<GateResult>),
    /// The last result is the failing (or timed-out) gate; later gates never ran.
    Failed(Vec<GateResult>),
    /// Cancellation was observed between gates.
    Cancelled(Vec<GateResult>),
}

impl GateVerdict {
    pub fn results(&self) -> &[GateResult] {
        match self {
            GateVerdict::Passed(results)
            | GateVerdict::Failed(results)
            | GateVerdict::Cancelled(results) => results,
        }
    }
}

/// Run `gates` in order until one fails, the deadline passes or the run is
/// cancelled. Each gate gets whatever remains of the attempt budget.
#[instrument(skip_all, fields(gates = gates.len()))]
pub fn run_gates(
    runner: &dyn GateRunner,
    gates: &[GateConfig],
    workdir: &Path,
    log_path: &Path,
    output_limit_bytes: usize,
    deadline: Instant,
    cancel: &CancelToken,
) -> Result<GateVerdict> {
    let mut results = Vec::with_capacity(gates.len());
    for gate in gates {
        if cancel.is_cancelled() {
            info!(gate = %gate.name, "cancelled before gate");
            return Ok(GateVerdict::Cancelled(results));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            results.push(GateResult {
                timed_out: true,
                ..GateResult::fail(&gate.name, "attempt budget exhausted before gate started")
            });
            return Ok(GateVerdict::Failed(results));
        }
        let request = GateRequest {
            workdir: workdir.to_path_buf(),
            log_path: log_path.to_path_buf(),
            timeout: remaining,
            output_limit_bytes,
        };
        let result = runner.run(gate, &request)?;
        let passed = result.passed;
        results.push(result);
        if !passed {
            return Ok(GateVerdict::Failed(results));
        }
    }
    Ok(GateVerdict::Passed(results))
}

fn append_gate_log(path: &Path, gate_name: &str, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create gate log dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open gate log {}", path.display()))?;
    write!(file, "##### gate {gate_name}\n{body}\n")
        .with_context(|| format!("write gate log {}", path.display()))
}
