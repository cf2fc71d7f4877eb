//! Test-only fixtures and scripted collaborators.
//!
//! Compiled for unit tests and for integration tests through the
//! `test-support` feature.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::core::plan::{Plan, Unit};
use crate::core::types::{GateResult, ImplementerReport, UnitStatus};
use crate::error::EngineError;
use crate::io::config::GateConfig;
use crate::io::gates::{GateRequest, GateRunner};
use crate::io::git::Git;
use crate::io::implementer::{ImplementRequest, Implementer};
use crate::io::vcs::{ApplyOutcome, ChangeSet, VersionControl, Workspace, escape_component};

/// Create a pending unit with default fields, no dependencies and no scope.
pub fn unit(id: &str, priority: i64) -> Unit {
    Unit {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        acceptance_criteria: Vec::new(),
        priority,
        dependencies: Vec::new(),
        file_scope: Vec::new(),
        status: UnitStatus::Pending,
        attempts: 0,
        notes: Vec::new(),
    }
}

pub fn unit_with_deps(id: &str, priority: i64, deps: &[&str]) -> Unit {
    Unit {
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        ..unit(id, priority)
    }
}

pub fn unit_with_scope(id: &str, priority: i64, scope: &[&str]) -> Unit {
    Unit {
        file_scope: scope.iter().map(|s| s.to_string()).collect(),
        ..unit(id, priority)
    }
}

pub fn plan_of(units: Vec<Unit>) -> Plan {
    let mut plan = Plan {
        id: "test-plan".to_string(),
        branch: None,
        complete: false,
        units,
    };
    plan.refresh_complete();
    plan
}

/// One scripted implementer response.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    /// Write files into the workspace and report done.
    Write(Vec<(String, String)>),
    /// Report `done = false` without touching anything.
    Incomplete,
    /// Fail like a crashed agent.
    Crash(String),
    /// Fail with a typed timeout.
    Timeout,
}

impl ScriptedAttempt {
    pub fn write(files: &[(&str, &str)]) -> Self {
        ScriptedAttempt::Write(
            files
                .iter()
                .map(|(path, contents)| (path.to_string(), contents.to_string()))
                .collect(),
        )
    }

    pub fn crash(message: &str) -> Self {
        ScriptedAttempt::Crash(message.to_string())
    }
}

/// Implementer that replays per-unit scripts and records what it saw.
#[derive(Default)]
pub struct ScriptedImplementer {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedAttempt>>>,
    delay: Duration,
    cancel_on_execute: Option<CancelToken>,
    running: Mutex<Vec<String>>,
    concurrent: Mutex<Vec<(String, String)>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedImplementer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses for `unit_id`, consumed one per attempt.
    pub fn script(self, unit_id: &str, attempts: Vec<ScriptedAttempt>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(unit_id.to_string())
            .or_default()
            .extend(attempts);
        self
    }

    /// Sleep inside every call so concurrent attempts overlap in time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Trip `token` as soon as any attempt starts.
    pub fn cancel_on_execute(mut self, token: CancelToken) -> Self {
        self.cancel_on_execute = Some(token);
        self
    }

    /// Prompts received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    /// Pairs of units whose attempts were in flight at the same time.
    pub fn concurrent_pairs(&self) -> Vec<(String, String)> {
        self.concurrent.lock().expect("concurrent lock").clone()
    }

    fn enter(&self, unit_id: &str) -> Result<()> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| anyhow!("running lock poisoned"))?;
        let mut concurrent = self
            .concurrent
            .lock()
            .map_err(|_| anyhow!("concurrent lock poisoned"))?;
        for other in &*running {
            concurrent.push((other.clone(), unit_id.to_string()));
        }
        running.push(unit_id.to_string());
        Ok(())
    }

    fn leave(&self, unit_id: &str) {
        if let Ok(mut running) = self.running.lock() {
            running.retain(|id| id != unit_id);
        }
    }

    fn perform(&self, request: &ImplementRequest) -> Result<ImplementerReport> {
        let next = self
            .scripts
            .lock()
            .map_err(|_| anyhow!("scripts lock poisoned"))?
            .get_mut(&request.unit_id)
            .and_then(VecDeque::pop_front);
        let Some(attempt) = next else {
            return Err(anyhow!("no scripted attempt left for unit {}", request.unit_id));
        };
        match attempt {
            ScriptedAttempt::Write(files) => {
                for (path, contents) in &files {
                    let target = request.workdir.join(path);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&target, contents)?;
                }
                let touched: Vec<String> = files.into_iter().map(|(path, _)| path).collect();
                Ok(ImplementerReport {
                    done: true,
                    summary: format!("wrote {}", touched.join(", ")),
                    files_touched: touched,
                })
            }
            ScriptedAttempt::Incomplete => Ok(ImplementerReport {
                done: false,
                files_touched: Vec::new(),
                summary: "ran out of ideas".to_string(),
            }),
            ScriptedAttempt::Crash(message) => Err(anyhow!(message)),
            ScriptedAttempt::Timeout => Err(EngineError::Timeout {
                operation: "implementer".to_string(),
                after: request.timeout,
            }
            .into()),
        }
    }
}

impl Implementer for ScriptedImplementer {
    fn execute(&self, request: &ImplementRequest) -> Result<ImplementerReport> {
        self.prompts
            .lock()
            .map_err(|_| anyhow!("prompts lock poisoned"))?
            .push(request.prompt.clone());
        if let Some(token) = &self.cancel_on_execute {
            token.cancel();
        }
        self.enter(&request.unit_id)?;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let result = self.perform(request);
        self.leave(&request.unit_id);
        result
    }
}

/// Gate runner that answers from a queue of pass/fail verdicts.
pub struct ScriptedGateRunner {
    verdicts: Mutex<VecDeque<bool>>,
    fallback: bool,
    calls: Mutex<usize>,
}

impl ScriptedGateRunner {
    /// Answer `verdicts` in order, then pass.
    pub fn sequence(verdicts: Vec<bool>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            fallback: true,
            calls: Mutex::new(0),
        }
    }

    pub fn always(passed: bool) -> Self {
        Self {
            verdicts: Mutex::new(VecDeque::new()),
            fallback: passed,
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("calls lock")
    }
}

impl GateRunner for ScriptedGateRunner {
    fn run(&self, gate: &GateConfig, _request: &GateRequest) -> Result<GateResult> {
        *self.calls.lock().map_err(|_| anyhow!("calls lock poisoned"))? += 1;
        let passed = self
            .verdicts
            .lock()
            .map_err(|_| anyhow!("verdicts lock poisoned"))?
            .pop_front()
            .unwrap_or(self.fallback);
        if passed {
            Ok(GateResult::pass(&gate.name, "scripted pass"))
        } else {
            Ok(GateResult::fail(&gate.name, "scripted failure"))
        }
    }
}

type Snapshot = BTreeMap<String, String>;

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: HashMap<String, Snapshot>,
    tip: String,
    next_commit: u64,
    /// Commits per workspace name, oldest first.
    heads: HashMap<String, Vec<String>>,
    /// Unit ids in merge order.
    history: Vec<String>,
    forced_conflicts: HashMap<String, u32>,
}

impl MemoryState {
    fn snapshot(&self, commit: &str) -> Result<&Snapshot> {
        self.snapshots
            .get(commit)
            .ok_or_else(|| anyhow!("unknown commit {commit}"))
    }

    fn store(&mut self, snapshot: Snapshot) -> String {
        self.next_commit += 1;
        let id = format!("c{}", self.next_commit);
        self.snapshots.insert(id.clone(), snapshot);
        id
    }
}

/// Version control over plain directories: workspaces are temp dirs, commits
/// are whole-tree snapshots and integration is a three-way file comparison.
pub struct MemoryVcs {
    dir: TempDir,
    state: Mutex<MemoryState>,
}

impl MemoryVcs {
    pub fn new() -> Result<Self> {
        let mut state = MemoryState::default();
        state.snapshots.insert("c0".to_string(), Snapshot::new());
        state.tip = "c0".to_string();
        Ok(Self {
            dir: tempfile::tempdir().context("create memory vcs dir")?,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory vcs lock poisoned"))
    }

    /// Reject the next `times` replays of `unit_id`'s change sets.
    pub fn force_conflict(&self, unit_id: &str, times: u32) {
        self.lock()
            .expect("memory vcs lock")
            .forced_conflicts
            .insert(unit_id.to_string(), times);
    }

    /// Unit ids in the order they were integrated.
    pub fn history(&self) -> Vec<String> {
        self.lock().expect("memory vcs lock").history.clone()
    }

    /// File contents at the integration tip.
    pub fn tip_files(&self) -> Snapshot {
        let state = self.lock().expect("memory vcs lock");
        state
            .snapshot(&state.tip)
            .cloned()
            .expect("tip snapshot")
    }
}

fn read_tree(root: &Path) -> Result<Snapshot> {
    let mut files = Snapshot::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("relativize {}", path.display()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            files.insert(relative, contents);
        }
    }
    Ok(files)
}

fn changed_paths(before: &Snapshot, after: &Snapshot) -> Vec<String> {
    before
        .keys()
        .chain(after.keys())
        .filter(|path| before.get(*path) != after.get(*path))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl VersionControl for MemoryVcs {
    fn tip(&self) -> Result<String> {
        Ok(self.lock()?.tip.clone())
    }

    fn create_workspace(&self, name: &str, at: &str) -> Result<Workspace> {
        let mut state = self.lock()?;
        let files = state.snapshot(at)?.clone();
        let path = self.dir.path().join(escape_component(name));
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        for (relative, contents) in &files {
            let target = path.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, contents)?;
        }
        state.heads.insert(name.to_string(), Vec::new());
        Ok(Workspace {
            name: name.to_string(),
            path,
            base: at.to_string(),
            branch: format!("memory/{name}"),
        })
    }

    fn touched_paths(&self, workspace: &Workspace) -> Result<Vec<String>> {
        let current = read_tree(&workspace.path)?;
        let state = self.lock()?;
        Ok(changed_paths(state.snapshot(&workspace.base)?, &current))
    }

    fn commit(&self, workspace: &Workspace, _message: &str) -> Result<Option<String>> {
        let current = read_tree(&workspace.path)?;
        let mut state = self.lock()?;
        let last = state
            .heads
            .get(&workspace.name)
            .and_then(|commits| commits.last())
            .cloned()
            .unwrap_or_else(|| workspace.base.clone());
        if state.snapshot(&last)? == &current {
            return Ok(None);
        }
        let id = state.store(current);
        state
            .heads
            .entry(workspace.name.clone())
            .or_default()
            .push(id.clone());
        Ok(Some(id))
    }

    fn change_set(&self, unit_id: &str, workspace: &Workspace) -> Result<ChangeSet> {
        let state = self.lock()?;
        let commits = state
            .heads
            .get(&workspace.name)
            .cloned()
            .unwrap_or_default();
        let head = commits.last().unwrap_or(&workspace.base);
        let files = changed_paths(state.snapshot(&workspace.base)?, state.snapshot(head)?);
        Ok(ChangeSet {
            unit_id: unit_id.to_string(),
            base: workspace.base.clone(),
            commits,
            files,
        })
    }

    fn apply(&self, change_set: &ChangeSet, onto: &str) -> Result<ApplyOutcome> {
        let mut state = self.lock()?;
        if state.tip != onto {
            return Err(EngineError::TipMoved {
                expected: onto.to_string(),
                found: state.tip.clone(),
            }
            .into());
        }
        let Some(head) = change_set.commits.last() else {
            return Ok(ApplyOutcome::Applied {
                tip: state.tip.clone(),
            });
        };
        if let Some(remaining) = state.forced_conflicts.get_mut(&change_set.unit_id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Ok(ApplyOutcome::Conflict {
                paths: change_set.files.clone(),
            });
        }

        let base = state.snapshot(&change_set.base)?;
        let head = state.snapshot(head)?;
        let tip = state.snapshot(&state.tip)?;
        let conflicts: Vec<String> = change_set
            .files
            .iter()
            .filter(|path| tip.get(*path) != base.get(*path))
            .cloned()
            .collect();
        if !conflicts.is_empty() {
            return Ok(ApplyOutcome::Conflict { paths: conflicts });
        }

        let mut merged = tip.clone();
        for path in &change_set.files {
            match head.get(path) {
                Some(contents) => merged.insert(path.clone(), contents.clone()),
                None => merged.remove(path),
            };
        }
        let id = state.store(merged);
        state.tip = id.clone();
        state.history.push(change_set.unit_id.clone());
        Ok(ApplyOutcome::Applied { tip: id })
    }

    fn remove_workspace(&self, workspace: &Workspace) -> Result<()> {
        if workspace.path.exists() {
            fs::remove_dir_all(&workspace.path)
                .with_context(|| format!("remove workspace {}", workspace.path.display()))?;
        }
        self.lock()?.heads.remove(&workspace.name);
        Ok(())
    }
}

/// A throwaway git repository on `main` with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create repo dir")?;
        let repo = Self { dir };
        repo.git_cmd(&["init", "--quiet"])?;
        repo.git_cmd(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.git_cmd(&["config", "user.name", "Plan Runner Tests"])?;
        repo.git_cmd(&["config", "user.email", "tests@example.com"])?;
        repo.git_cmd(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# test repo\n")?;
        repo.commit_all("initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<()> {
        let target = self.path().join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, contents).with_context(|| format!("write {}", target.display()))
    }

    pub fn read(&self, relative: &str) -> Result<String> {
        let target = self.path().join(relative);
        fs::read_to_string(&target).with_context(|| format!("read {}", target.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        let git = self.git();
        git.add_all()?;
        if !git.commit_staged(message)? {
            return Err(anyhow!("nothing to commit for '{message}'"));
        }
        Ok(())
    }

    /// Commit subjects on HEAD, newest first.
    pub fn log_subjects(&self) -> Result<Vec<String>> {
        let out = self.git_cmd(&["log", "--format=%s"])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    fn git_cmd(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
