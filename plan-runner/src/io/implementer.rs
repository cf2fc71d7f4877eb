//! Implementer abstraction: the collaborator that edits a workspace.
//!
//! The [`Implementer`] trait decouples the engine from the actual agent
//! backend. [`CommandImplementer`] spawns a configured command; tests use
//! scripted implementers that edit files directly.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::ImplementerReport;
use crate::error::EngineError;
use crate::io::process::run_command;

pub const IMPLEMENTER_OUTPUT_SCHEMA: &str =
    include_str!("../../schemas/implementer_output.schema.json");

/// Parameters for one implementer invocation.
#[derive(Debug, Clone)]
pub struct ImplementRequest {
    pub unit_id: String,
    pub attempt: u32,
    /// Workspace the implementer edits.
    pub workdir: PathBuf,
    pub prompt: String,
    /// Directory holding the rendered context files.
    pub context_dir: PathBuf,
    /// JSON Schema the report must follow.
    pub schema_path: PathBuf,
    /// Where the implementer writes its JSON report.
    pub output_path: PathBuf,
    pub log_path: PathBuf,
    /// Remaining attempt budget.
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Implementer: Send + Sync {
    fn execute(&self, request: &ImplementRequest) -> Result<ImplementerReport>;
}

/// Implementer that runs an external command in the workspace.
pub struct CommandImplementer {
    command: Vec<String>,
}

impl CommandImplementer {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

/// Substitute per-attempt placeholders in command arguments.
pub fn expand_placeholders(args: &[String], request: &ImplementRequest) -> Vec<String> {
    let output = request.output_path.display().to_string();
    let schema = request.schema_path.display().to_string();
    let context = request.context_dir.display().to_string();
    args.iter()
        .map(|arg| {
            arg.replace("{output}", &output)
                .replace("{schema}", &schema)
                .replace("{unit}", &request.unit_id)
                .replace("{context}", &context)
        })
        .collect()
}

impl Implementer for CommandImplementer {
    #[instrument(skip_all, fields(unit = %request.unit_id, attempt = request.attempt, timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &ImplementRequest) -> Result<ImplementerReport> {
        let args = expand_placeholders(&self.command, request);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("implementer command is empty"))?;
        info!(program = %program, workdir = %request.workdir.display(), "starting implementer");

        ensure_schema(&request.schema_path)?;
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        if request.output_path.exists() {
            fs::remove_file(&request.output_path).with_context(|| {
                format!("remove stale report {}", request.output_path.display())
            })?;
        }

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .current_dir(&request.workdir)
            .env("PLAN_RUNNER_UNIT", &request.unit_id)
            .env("PLAN_RUNNER_ATTEMPT", request.attempt.to_string())
            .env("PLAN_RUNNER_CONTEXT", &request.context_dir);

        let output = run_command(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            Some(&request.log_path),
        )
        .with_context(|| format!("run implementer {program}"))?;

        fs::write(&request.log_path, output.render_log("implementer"))
            .with_context(|| format!("write implementer log {}", request.log_path.display()))?;

        if output.timed_out {
            warn!("implementer timed out");
            return Err(EngineError::Timeout {
                operation: "implementer".to_string(),
                after: request.timeout,
            }
            .into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "implementer failed");
            return Err(anyhow!(
                "implementer exited with status {:?}: {}",
                output.status.code(),
                output.tail(500)
            ));
        }

        let report = read_report(&request.output_path)?;
        debug!(done = report.done, files = report.files_touched.len(), "implementer report");
        Ok(report)
    }
}

fn ensure_schema(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create schema dir {}", parent.display()))?;
    }
    fs::write(path, IMPLEMENTER_OUTPUT_SCHEMA)
        .with_context(|| format!("write output schema {}", path.display()))
}

/// Parse the implementer's JSON report.
pub fn read_report(path: &Path) -> Result<ImplementerReport> {
    if !path.exists() {
        return Err(anyhow!("missing implementer report {}", path.display()));
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read implementer report {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(root: &Path, timeout: Duration) -> ImplementRequest {
        ImplementRequest {
            unit_id: "unit-a".to_string(),
            attempt: 1,
            workdir: root.to_path_buf(),
            prompt: "do the work".to_string(),
            context_dir: root.join("context"),
            schema_path: root.join("schema.json"),
            output_path: root.join("logs").join("report.json"),
            log_path: root.join("logs").join("implementer.log"),
            timeout,
            output_limit_bytes: 10_000,
        }
    }

    fn sh(script: &str) -> CommandImplementer {
        CommandImplementer::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[test]
    fn placeholders_are_expanded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), Duration::from_secs(1));
        let args = expand_placeholders(
            &["--out={output}".to_string(), "{unit}".to_string(), "plain".to_string()],
            &req,
        );
        assert_eq!(args[0], format!("--out={}", req.output_path.display()));
        assert_eq!(args[1], "unit-a");
        assert_eq!(args[2], "plain");
    }

    #[test]
    fn reads_report_written_by_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), Duration::from_secs(10));
        let implementer = CommandImplementer::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"cat > prompt.txt; printf '{"done":true,"filesTouched":["prompt.txt"],"summary":"ok"}' > "$0""#
                .to_string(),
            "{output}".to_string(),
        ]);

        let report = implementer.execute(&req).expect("execute");
        assert!(report.done);
        assert_eq!(report.files_touched, vec!["prompt.txt"]);
        assert_eq!(
            fs::read_to_string(temp.path().join("prompt.txt")).expect("prompt"),
            "do the work"
        );
        assert!(req.schema_path.is_file());
        assert!(req.log_path.is_file());
    }

    #[test]
    fn missing_report_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), Duration::from_secs(10));
        let err = sh("true").execute(&req).unwrap_err();
        assert!(err.to_string().contains("missing implementer report"));
    }

    #[test]
    fn timeout_is_typed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), Duration::from_millis(100));
        let err = sh("exec sleep 5").execute(&req).unwrap_err();
        assert!(EngineError::is_timeout(&err));
    }
}
