//! Version-control collaborator: isolated workspaces and change integration.
//!
//! The engine and merge resolver only see [`VersionControl`]. [`GitWorktrees`]
//! gives every attempt its own `git worktree` on a throwaway branch and
//! integrates finished work by cherry-picking onto the integration branch.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::io::git::Git;

/// Runner-owned files that may be dirty in the repository root.
pub const RUNNER_PREFIX: &str = ".runner/";

/// An isolated checkout for one unit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub name: String,
    pub path: PathBuf,
    /// Integration tip the workspace was created from.
    pub base: String,
    pub branch: String,
}

/// Commits one attempt produced on top of its base, and the files they touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub unit_id: String,
    pub base: String,
    pub commits: Vec<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { tip: String },
    /// The replay was aborted; the integration tip is unchanged.
    Conflict { paths: Vec<String> },
}

pub trait VersionControl: Send + Sync {
    /// Current integration tip.
    fn tip(&self) -> Result<String>;

    fn create_workspace(&self, name: &str, at: &str) -> Result<Workspace>;

    /// Every path that differs from the workspace base, committed or not.
    fn touched_paths(&self, workspace: &Workspace) -> Result<Vec<String>>;

    /// Commit all pending changes. Returns the new commit, or `None` if there
    /// was nothing to commit.
    fn commit(&self, workspace: &Workspace, message: &str) -> Result<Option<String>>;

    fn change_set(&self, unit_id: &str, workspace: &Workspace) -> Result<ChangeSet>;

    /// Replay `change_set` on the integration tip, which must equal `onto`.
    fn apply(&self, change_set: &ChangeSet, onto: &str) -> Result<ApplyOutcome>;

    fn remove_workspace(&self, workspace: &Workspace) -> Result<()>;
}

/// `git worktree` workspaces under `.runner/workspaces/`, integrated with
/// `git cherry-pick` in the repository root.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    root: Git,
    workspaces_dir: PathBuf,
    branch_prefix: String,
    /// Serializes commands that write the shared `.git` directory.
    admin: Arc<Mutex<()>>,
}

impl GitWorktrees {
    pub fn new(root: &Path, workspaces_dir: &Path, plan_id: &str) -> Self {
        Self {
            root: Git::new(root),
            workspaces_dir: workspaces_dir.to_path_buf(),
            branch_prefix: format!("plan-runner/{}", sanitize_branch_name(plan_id)),
            admin: Arc::new(Mutex::new(())),
        }
    }

    fn admin(&self) -> Result<MutexGuard<'_, ()>> {
        self.admin
            .lock()
            .map_err(|_| anyhow!("git admin lock poisoned"))
    }

    /// Check the root is usable as an integration checkout and switch to the
    /// plan's branch when one is named. Returns the integration branch.
    #[instrument(skip_all, fields(target = ?branch))]
    pub fn prepare(&self, branch: Option<&str>) -> Result<String> {
        let current = self.root.current_branch()?;
        self.root
            .ensure_clean_except_prefixes(&[RUNNER_PREFIX])
            .context("repository root must be clean before a run")?;
        let Some(target) = branch else {
            return Ok(current);
        };
        if target != current {
            if self.root.branch_exists(target)? {
                self.root.checkout_branch(target)?;
            } else {
                self.root.checkout_new_branch(target)?;
            }
            info!(from = %current, to = %target, "switched integration branch");
        }
        Ok(target.to_string())
    }
}

impl VersionControl for GitWorktrees {
    fn tip(&self) -> Result<String> {
        self.root.head_sha()
    }

    #[instrument(skip(self))]
    fn create_workspace(&self, name: &str, at: &str) -> Result<Workspace> {
        let key = escape_component(name);
        let branch = format!("{}/{}", self.branch_prefix, key);
        let path = self.workspaces_dir.join(&key);
        let _admin = self.admin()?;
        fs::create_dir_all(&self.workspaces_dir).with_context(|| {
            format!("create workspaces dir {}", self.workspaces_dir.display())
        })?;

        if let Err(err) = self.root.worktree_prune() {
            warn!(err = %err, "failed to prune worktrees");
        }
        if path.exists() {
            warn!(path = %path.display(), "removing stale workspace");
            if self.root.worktree_remove(&path).is_err() {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("remove stale workspace {}", path.display()))?;
            }
        }
        if self.root.branch_exists(&branch)? {
            debug!(branch = %branch, "deleting stale workspace branch");
            self.root.delete_branch(&branch)?;
        }

        self.root
            .worktree_add(&path, &branch, at)
            .with_context(|| format!("create workspace {name}"))?;
        debug!(path = %path.display(), branch = %branch, "workspace created");
        Ok(Workspace {
            name: name.to_string(),
            path,
            base: at.to_string(),
            branch,
        })
    }

    fn touched_paths(&self, workspace: &Workspace) -> Result<Vec<String>> {
        let git = Git::new(&workspace.path);
        let mut paths: BTreeSet<String> = git.diff_names(&workspace.base)?.into_iter().collect();
        paths.extend(git.status_porcelain()?.into_iter().map(|entry| entry.path));
        Ok(paths.into_iter().collect())
    }

    #[instrument(skip(self, workspace, message), fields(workspace = %workspace.name))]
    fn commit(&self, workspace: &Workspace, message: &str) -> Result<Option<String>> {
        let git = Git::new(&workspace.path);
        git.add_all()?;
        if !git.commit_staged(message)? {
            return Ok(None);
        }
        Ok(Some(git.head_sha()?))
    }

    fn change_set(&self, unit_id: &str, workspace: &Workspace) -> Result<ChangeSet> {
        let git = Git::new(&workspace.path);
        Ok(ChangeSet {
            unit_id: unit_id.to_string(),
            base: workspace.base.clone(),
            commits: git.commits_since(&workspace.base)?,
            files: git.diff_names(&workspace.base)?,
        })
    }

    #[instrument(skip_all, fields(unit = %change_set.unit_id, commits = change_set.commits.len()))]
    fn apply(&self, change_set: &ChangeSet, onto: &str) -> Result<ApplyOutcome> {
        let found = self.root.head_sha()?;
        if found != onto {
            return Err(EngineError::TipMoved {
                expected: onto.to_string(),
                found,
            }
            .into());
        }
        if change_set.commits.is_empty() {
            return Ok(ApplyOutcome::Applied { tip: found });
        }

        let _admin = self.admin()?;
        let output = self.root.cherry_pick(&change_set.commits)?;
        if output.status.success() {
            let tip = self.root.head_sha()?;
            debug!(tip = %tip, "change set applied");
            return Ok(ApplyOutcome::Applied { tip });
        }

        let paths = self.root.unmerged_paths()?;
        self.root
            .cherry_pick_abort()
            .context("abort conflicting cherry-pick")?;
        if paths.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git cherry-pick failed: {}", stderr.trim()));
        }
        warn!(paths = ?paths, "change set conflicts with integration tip");
        Ok(ApplyOutcome::Conflict { paths })
    }

    #[instrument(skip(self, workspace), fields(workspace = %workspace.name))]
    fn remove_workspace(&self, workspace: &Workspace) -> Result<()> {
        let _admin = self.admin()?;
        if workspace.path.exists() {
            self.root
                .worktree_remove(&workspace.path)
                .with_context(|| format!("remove workspace {}", workspace.name))?;
        } else {
            self.root.worktree_prune()?;
        }
        if let Err(err) = self.root.delete_branch(&workspace.branch) {
            warn!(err = %err, branch = %workspace.branch, "failed to delete workspace branch");
        }
        Ok(())
    }
}

/// Sanitize a string for use as one branch-name component.
pub fn sanitize_branch_name(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "unit".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Escape a string into one path or branch-name component.
///
/// ASCII alphanumerics pass through, as does `-` anywhere but the first
/// position; every other byte becomes `_XX` (uppercase hex). The escape is
/// reversible, so distinct unit ids never share a workspace, branch, context
/// or log directory.
pub fn escape_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (index, byte) in s.bytes().enumerate() {
        if byte.is_ascii_alphanumeric() || (byte == b'-' && index > 0) {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{byte:02X}"));
        }
    }
    out
}
