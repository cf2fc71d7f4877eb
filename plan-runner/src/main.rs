//! Autonomous plan runner.
//!
//! Runs a plan (`.runner/plan.json`) of scoped, dependency-ordered units:
//! each unit is implemented in its own workspace, verified by quality gates
//! and merged onto the integration branch in a deterministic order.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use plan_runner::cancel::CancelToken;
use plan_runner::coordinator::{RunReport, RunStop, run_plan};
use plan_runner::engine::{Engine, Services};
use plan_runner::exit_codes;
use plan_runner::io::config::load_config;
use plan_runner::io::context::describe_entry;
use plan_runner::io::gates::CommandGateRunner;
use plan_runner::io::implementer::CommandImplementer;
use plan_runner::io::init::{InitOptions, RunnerPaths, init_runner};
use plan_runner::io::ledger::Ledger;
use plan_runner::io::plan_store::{PlanStore, load_plan};
use plan_runner::io::vcs::GitWorktrees;
use plan_runner::logging;
use plan_runner::select::{SelectOutcome, batches_from_path, select_from_path};
use plan_runner::validate::validate_runner;

#[derive(Parser)]
#[command(
    name = "plan-runner",
    version,
    about = "Run a plan of scoped units through an implementer, quality gates and ordered merges"
)]
struct Cli {
    /// Plan document to use instead of `.runner/plan.json`.
    #[arg(long, global = true)]
    plan: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.runner/` with config, schemas, a plan template and .gitignore.
    Init {
        /// Rewrite scaffolding files. An existing plan is kept.
        #[arg(short, long)]
        force: bool,
    },
    /// Check layout, config and plan (schema, dependencies, cycles, scopes).
    Validate,
    /// Print the id of the unit a run would start next.
    Next,
    /// Print the conflict-free groups of the currently eligible units.
    Batches,
    /// Run the plan until it is complete, blocked or interrupted.
    Run {
        /// Override `max_workers` from config.toml.
        #[arg(long)]
        workers: Option<usize>,
        /// Override `max_attempts` from config.toml.
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Print every unit's status and attempt count.
    Status,
    /// Print recent ledger entries.
    Ledger {
        /// Only entries for this unit.
        #[arg(long)]
        unit: Option<String>,
        /// Number of entries to show.
        #[arg(short = 'n', default_value_t = 20)]
        count: usize,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = env::current_dir().context("resolve current directory")?;
    let paths = runner_paths(&root, cli.plan.as_deref());
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Validate => cmd_validate(&paths),
        Command::Next => cmd_next(&paths),
        Command::Batches => cmd_batches(&paths),
        Command::Run {
            workers,
            max_attempts,
        } => cmd_run(&paths, workers, max_attempts),
        Command::Status => cmd_status(&paths),
        Command::Ledger { unit, count } => cmd_ledger(&paths, unit.as_deref(), count),
    }
}

fn runner_paths(root: &Path, plan: Option<&Path>) -> RunnerPaths {
    let paths = RunnerPaths::new(root);
    match plan {
        Some(plan) => paths.with_plan_path(root.join(plan)),
        None => paths,
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_runner(root, &InitOptions { force })?;
    println!("initialized {}", paths.runner_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(paths: &RunnerPaths) -> Result<i32> {
    let outcome = validate_runner(paths)?;
    println!(
        "ok: plan '{}' with {} unit(s), {} eligible",
        outcome.plan_id, outcome.units, outcome.eligible
    );
    Ok(exit_codes::OK)
}

fn cmd_next(paths: &RunnerPaths) -> Result<i32> {
    match select_from_path(&paths.plan_path)? {
        SelectOutcome::Complete => {
            eprintln!("plan complete");
            Ok(exit_codes::COMPLETE)
        }
        SelectOutcome::Ready(id) => {
            println!("{id}");
            Ok(exit_codes::OK)
        }
        SelectOutcome::Waiting { running } => {
            eprintln!("no eligible unit while running: {}", running.join(", "));
            Ok(exit_codes::BLOCKED)
        }
        SelectOutcome::Blocked(blocked) => {
            eprintln!("blocked:");
            for unit in blocked {
                eprintln!(
                    "  {} (failed ancestors: {})",
                    unit.id,
                    unit.failed_ancestors.join(", ")
                );
            }
            Ok(exit_codes::BLOCKED)
        }
    }
}

fn cmd_batches(paths: &RunnerPaths) -> Result<i32> {
    for (index, group) in batches_from_path(&paths.plan_path)?.iter().enumerate() {
        println!("{}: {}", index + 1, group.join(", "));
    }
    Ok(exit_codes::OK)
}

fn cmd_run(paths: &RunnerPaths, workers: Option<usize>, max_attempts: Option<u32>) -> Result<i32> {
    let mut cfg = load_config(&paths.config_path)?;
    if let Some(workers) = workers {
        cfg.max_workers = workers;
    }
    if let Some(max_attempts) = max_attempts {
        cfg.max_attempts = max_attempts;
    }
    cfg.validate().context("invalid run options")?;

    let store = PlanStore::open(&paths.plan_path)?;
    let plan = store.snapshot()?;
    let vcs = GitWorktrees::new(&paths.root, &paths.workspaces_dir, &plan.id);
    let branch = vcs.prepare(plan.branch.as_deref())?;
    eprintln!("integrating onto '{branch}'");

    let ledger = Ledger::new(&paths.ledger_path);
    let implementer = CommandImplementer::new(cfg.implementer.command.clone());
    let skills = cfg.skills.selector();
    let services = Services {
        store: &store,
        ledger: &ledger,
        vcs: &vcs,
        implementer: &implementer,
        gates: &CommandGateRunner,
        skills: skills.as_ref(),
    };
    let engine = Engine::new(services, &cfg, paths)?;

    let cancel = CancelToken::new();
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("interrupt received, stopping after the current step");
        token.cancel();
    })
    .context("install Ctrl-C handler")?;

    let report = run_plan(&engine, &cancel, &|event| println!("{event}"))?;
    print_report(&report);
    Ok(match report.stop {
        RunStop::Complete => exit_codes::OK,
        RunStop::Blocked => exit_codes::BLOCKED,
        RunStop::Cancelled => exit_codes::CANCELLED,
    })
}

fn print_report(report: &RunReport) {
    let stop = match report.stop {
        RunStop::Complete => "complete",
        RunStop::Blocked => "blocked",
        RunStop::Cancelled => "cancelled",
    };
    println!("run {stop}");
    println!("  done: {}", report.done.join(", "));
    println!("  failed: {}", report.failed.join(", "));
    println!("  pending: {}", report.pending.join(", "));
    for unit in &report.blocked {
        println!(
            "  blocked: {} (failed ancestors: {})",
            unit.id,
            unit.failed_ancestors.join(", ")
        );
    }
}

fn cmd_status(paths: &RunnerPaths) -> Result<i32> {
    let plan = load_plan(&paths.plan_path)?;
    let cfg = load_config(&paths.config_path)?;
    for unit in &plan.units {
        println!(
            "{:<8} {} ({}/{} attempts)",
            unit.status.as_str(),
            unit.id,
            unit.attempts,
            cfg.max_attempts
        );
    }
    if plan.complete {
        println!("plan complete");
    }
    Ok(exit_codes::OK)
}

fn cmd_ledger(paths: &RunnerPaths, unit: Option<&str>, count: usize) -> Result<i32> {
    let ledger = Ledger::new(&paths.ledger_path);
    let entries = match unit {
        Some(unit) => ledger.recent_for(unit, count)?,
        None => ledger.recent_global(count)?,
    };
    for entry in &entries {
        println!("{}", describe_entry(entry));
    }
    Ok(exit_codes::OK)
}
