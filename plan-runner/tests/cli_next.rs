//! CLI tests for `plan-runner next`, `validate` and `batches`.
//!
//! Spawns the binary and verifies exit codes and output for ready, complete,
//! blocked and invalid plans.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use plan_runner::core::types::UnitStatus;
use plan_runner::exit_codes;
use plan_runner::io::init::{InitOptions, RunnerPaths, init_runner};
use plan_runner::io::plan_store::write_plan;
use plan_runner::test_support::{plan_of, unit, unit_with_deps, unit_with_scope};

fn plan_runner(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_plan-runner"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn plan-runner")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn next_prints_the_template_unit_after_init() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = plan_runner(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));

    let output = plan_runner(temp.path(), &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout(&output).trim(), "example");
}

#[test]
fn next_exits_complete_when_every_unit_is_done() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_runner(temp.path(), &InitOptions { force: false }).expect("init");
    let mut plan = plan_of(vec![unit("a", 0)]);
    plan.units[0].status = UnitStatus::Done;
    write_plan(&paths.plan_path, &plan).expect("write plan");

    let output = plan_runner(temp.path(), &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::COMPLETE));
}

#[test]
fn next_exits_blocked_behind_a_failed_dependency() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_runner(temp.path(), &InitOptions { force: false }).expect("init");
    let mut plan = plan_of(vec![unit("a", 0), unit_with_deps("b", 0, &["a"])]);
    plan.units[0].status = UnitStatus::Failed;
    write_plan(&paths.plan_path, &plan).expect("write plan");

    let output = plan_runner(temp.path(), &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("b (failed ancestors: a)"));
}

#[test]
fn malformed_plan_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_runner(temp.path(), &InitOptions { force: false }).expect("init");
    fs::write(&paths.plan_path, "{ not json").expect("write plan");

    for command in ["next", "validate", "batches"] {
        let output = plan_runner(temp.path(), &[command]);
        assert_eq!(
            output.status.code(),
            Some(exit_codes::INVALID),
            "{command} should reject the plan"
        );
    }
}

#[test]
fn alternate_plan_path_is_honored() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_runner(temp.path(), &InitOptions { force: false }).expect("init");
    let alt = temp.path().join("plans").join("alt.json");
    write_plan(
        &alt,
        &plan_of(vec![
            unit_with_scope("a", 0, &["src/a"]),
            unit_with_scope("b", 0, &["src/a/b.rs"]),
            unit_with_scope("c", 0, &["docs"]),
        ]),
    )
    .expect("write plan");

    let output = plan_runner(temp.path(), &["--plan", "plans/alt.json", "batches"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout(&output), "1: a, c\n2: b\n");

    // The default plan is untouched and still selects the template unit.
    let default = plan_runner(temp.path(), &["next"]);
    assert_eq!(stdout(&default).trim(), "example");
    assert!(RunnerPaths::new(temp.path()).plan_path.exists());
}
