//! `.runner/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::plan::template_plan;
use crate::io::config::{RunnerConfig, write_config};
use crate::io::implementer::IMPLEMENTER_OUTPUT_SCHEMA;
use crate::io::plan_store::{PLAN_SCHEMA, write_plan};

/// All canonical paths within `.runner/` for a project root.
#[derive(Debug, Clone)]
pub struct RunnerPaths {
    pub root: PathBuf,
    pub runner_dir: PathBuf,
    pub plan_path: PathBuf,
    pub plan_schema_path: PathBuf,
    pub implementer_schema_path: PathBuf,
    pub config_path: PathBuf,
    pub ledger_path: PathBuf,
    pub context_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl RunnerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runner_dir = root.join(".runner");
        Self {
            plan_path: runner_dir.join("plan.json"),
            plan_schema_path: runner_dir.join("plan.schema.json"),
            implementer_schema_path: runner_dir.join("implementer_output.schema.json"),
            config_path: runner_dir.join("config.toml"),
            ledger_path: runner_dir.join("ledger.jsonl"),
            context_dir: runner_dir.join("context"),
            workspaces_dir: runner_dir.join("workspaces"),
            logs_dir: runner_dir.join("logs"),
            gitignore_path: runner_dir.join(".gitignore"),
            runner_dir,
            root,
        }
    }

    /// Use a plan document other than `.runner/plan.json`.
    pub fn with_plan_path(mut self, plan_path: impl Into<PathBuf>) -> Self {
        self.plan_path = plan_path.into();
        self
    }
}

/// Options for `init_runner`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Rewrite runner-owned scaffolding. An existing plan and ledger are kept.
    pub force: bool,
}

const RUNNER_GITIGNORE: &str = "context/\nworkspaces/\nlogs/\n*.tmp\n";

/// Create `.runner/` scaffolding in `root`.
///
/// Fails if `.runner/` already exists unless `options.force` is set.
pub fn init_runner(root: &Path, options: &InitOptions) -> Result<RunnerPaths> {
    let paths = RunnerPaths::new(root);
    if paths.runner_dir.exists() && !paths.runner_dir.is_dir() {
        return Err(anyhow!("init: .runner exists but is not a directory"));
    }
    if paths.runner_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: .runner already exists (use --force to overwrite)"
        ));
    }

    for dir in [
        &paths.runner_dir,
        &paths.context_dir,
        &paths.workspaces_dir,
        &paths.logs_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    write_file(&paths.gitignore_path, RUNNER_GITIGNORE)?;
    write_file(&paths.plan_schema_path, PLAN_SCHEMA)?;
    write_file(&paths.implementer_schema_path, IMPLEMENTER_OUTPUT_SCHEMA)?;
    write_config(&paths.config_path, &RunnerConfig::default())?;
    if !paths.plan_path.exists() {
        write_plan(&paths.plan_path, &template_plan())?;
    }
    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::io::plan_store::load_plan;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_runner(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.context_dir.is_dir());
        assert!(paths.workspaces_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
        assert!(paths.plan_schema_path.is_file());
        assert!(paths.implementer_schema_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            RUNNER_GITIGNORE
        );
        assert_eq!(load_plan(&paths.plan_path).expect("plan"), template_plan());
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            RunnerConfig::default()
        );
    }

    #[test]
    fn init_without_force_refuses_existing_runner_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_runner(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_runner(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn force_rewrites_scaffolding_but_keeps_plan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_runner(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "max_workers = 9\n").expect("custom config");
        let mut plan = template_plan();
        plan.units[0].title = "Custom".to_string();
        write_plan(&paths.plan_path, &plan).expect("custom plan");

        init_runner(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(load_config(&paths.config_path).expect("config").max_workers, 2);
        assert_eq!(load_plan(&paths.plan_path).expect("plan").units[0].title, "Custom");
    }
}
