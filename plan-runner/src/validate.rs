//! Validation of the `.runner/` layout, config and plan.

use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::core::plan::Plan;
use crate::core::selector::eligible_units;
use crate::io::config::load_config;
use crate::io::init::RunnerPaths;
use crate::io::plan_store::load_plan;

/// High-level validation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub plan_id: String,
    pub units: usize,
    pub eligible: usize,
}

/// Validate `.runner/` layout, config and the plan document.
pub fn validate_runner(paths: &RunnerPaths) -> Result<ValidateOutcome> {
    ensure_dir(&paths.runner_dir)?;
    ensure_file(&paths.gitignore_path)?;
    ensure_file(&paths.config_path)?;
    ensure_file(&paths.plan_path)?;
    ensure_gitignore(&paths.gitignore_path)?;

    load_config(&paths.config_path).with_context(|| "load config.toml")?;
    let plan = load_plan(&paths.plan_path)?;
    Ok(summarize(&plan))
}

fn summarize(plan: &Plan) -> ValidateOutcome {
    ValidateOutcome {
        plan_id: plan.id.clone(),
        units: plan.units.len(),
        eligible: eligible_units(plan).len(),
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing directory {} (run `plan-runner init`)", path.display()));
    }
    if !path.is_dir() {
        return Err(anyhow!("expected directory {}", path.display()));
    }
    Ok(())
}

fn ensure_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing file {}", path.display()));
    }
    if !path.is_file() {
        return Err(anyhow!("expected file {}", path.display()));
    }
    Ok(())
}

fn ensure_gitignore(path: &Path) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    for required in ["context/", "workspaces/", "logs/"] {
        if !contents.lines().any(|line| line.trim() == required) {
            return Err(anyhow!("missing '{}' in {}", required, path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::io::init::{InitOptions, init_runner};
    use std::fs;

    #[test]
    fn fresh_init_validates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_runner(temp.path(), &InitOptions { force: false }).expect("init");
        let outcome = validate_runner(&paths).expect("validate");
        assert_eq!(
            outcome,
            ValidateOutcome {
                plan_id: "plan".to_string(),
                units: 1,
                eligible: 1,
            }
        );
    }

    #[test]
    fn missing_layout_points_at_init() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = validate_runner(&RunnerPaths::new(temp.path())).unwrap_err();
        assert!(err.to_string().contains("plan-runner init"));
    }

    #[test]
    fn gitignore_must_cover_runner_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_runner(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.gitignore_path, "context/\n").expect("gitignore");
        let err = validate_runner(&paths).unwrap_err();
        assert!(err.to_string().contains("workspaces/"));
    }

    #[test]
    fn malformed_plan_is_typed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_runner(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(
            &paths.plan_path,
            r#"{"units": [{"id": "a", "title": "A", "dependencies": ["a"]}]}"#,
        )
        .expect("plan");
        let err = validate_runner(&paths).unwrap_err();
        assert!(EngineError::is_malformed_plan(&err));
    }
}
