// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree manager for worker isolation.
//!
//! Each worker gets its own branch checked out in a sibling directory of the
//! main repository, so workers never contend for the working copy.
//!
//! # Directory Structure
//!
//! ```text
//! /project/                   # Main repo
//! ├── .git/
//! ├── src/
//! └── ...
//!
//! /platoon-feat-auth/         # Worker worktree (sibling directory)
//! ├── .git                    # Worktree link file
//! ├── src/
//! └── ...
//! ```
//!
//! Conflicts are classified before anything touches disk: a path already
//! serving another branch, a detached checkout at the target path, a branch
//! checked out elsewhere, and ref-prefix collisions (`feature` vs
//! `feature/sub`) each get their own [`WorktreeError`] variant.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default prefix for worktree directories.
const WORKTREE_PREFIX: &str = "platoon-";

/// Default base branch for new worker branches.
const DEFAULT_BASE_BRANCH: &str = "main";

/// Error type for worktree operations.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git error: {0}")]
    Git(String),

    #[error("invalid branch name: {0:?}")]
    InvalidBranchName(String),

    #[error("path {path:?} already serves branch {existing_branch:?}, not {branch:?}")]
    NameCollision {
        branch: String,
        path: PathBuf,
        existing_branch: String,
    },

    #[error("path {path:?} is a detached worktree and cannot be adopted")]
    CannotAdopt { path: PathBuf },

    #[error("branch {branch:?} is already checked out at {path:?}")]
    BranchInUse { branch: String, path: PathBuf },

    #[error("branch {branch:?} conflicts with existing ref {existing:?}; try {suggestion:?}")]
    RefPrefixConflict {
        branch: String,
        existing: String,
        suggestion: String,
    },
}

/// A worktree known to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// On-disk location of the worktree.
    pub path: PathBuf,
    /// Branch checked out there.
    pub branch: String,
    /// Whether this manager created (or adopted) it.
    pub managed: bool,
    /// When it was registered.
    pub created_at: DateTime<Utc>,
}

/// Options for [`WorktreeManager::remove`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Pass `--force` to `git worktree remove`.
    pub force: bool,
    /// Also delete the branch (best-effort).
    pub delete_branch: bool,
}

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LedgerEntry {
    path: PathBuf,
    head: String,
    branch: Option<String>,
    is_bare: bool,
    is_detached: bool,
}

/// Manages isolated git worktrees for worker agents.
pub struct WorktreeManager {
    /// Path to the main repository root.
    repo_root: PathBuf,
    /// Prefix for worktree directories.
    prefix: String,
    /// Base branch new worker branches fork from.
    base_branch: String,
    /// Registry of worktrees this manager created or adopted.
    registry: Arc<RwLock<HashMap<String, WorktreeInfo>>>,
}

impl WorktreeManager {
    /// Create a new manager rooted at the given repository.
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            prefix: WORKTREE_PREFIX.to_string(),
            base_branch: DEFAULT_BASE_BRANCH.to_string(),
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Set a custom prefix for worktree directories.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the base branch new branches fork from.
    pub fn with_base_branch(mut self, base: impl Into<String>) -> Self {
        self.base_branch = base.into();
        self
    }

    /// Get the path where a worktree would be created for a branch.
    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        worktree_path_for_branch(&self.repo_root, branch, Some(&self.prefix))
    }

    /// Run a git command in the repo root and return stdout.
    async fn git(&self, args: &[&str]) -> Result<String, WorktreeError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(WorktreeError::Git(stderr.trim().to_string()))
        }
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        self.git(&["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .await
            .is_ok()
    }

    /// All local branch names.
    async fn local_branches(&self) -> Result<Vec<String>, WorktreeError> {
        let output = self
            .git(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])
            .await?;
        Ok(output.lines().map(|s| s.to_string()).collect())
    }

    /// Read the repository's worktree ledger.
    async fn ledger(&self) -> Result<Vec<LedgerEntry>, WorktreeError> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&output))
    }

    /// Refuse branch names git cannot create as refs alongside the existing
    /// ones: `feature` is unusable while `feature/sub` exists, and vice versa.
    async fn check_ref_prefix(&self, branch: &str) -> Result<(), WorktreeError> {
        let existing = self.local_branches().await?;
        for other in existing {
            if other == branch {
                continue;
            }
            let branch_is_prefix = other.starts_with(&format!("{branch}/"));
            let other_is_prefix = branch.starts_with(&format!("{other}/"));
            if branch_is_prefix || other_is_prefix {
                return Err(WorktreeError::RefPrefixConflict {
                    branch: branch.to_string(),
                    existing: other,
                    suggestion: format!("{branch}-wt"),
                });
            }
        }
        Ok(())
    }

    /// Create (or adopt) an isolated worktree for a branch.
    ///
    /// Classifies conflicts before touching disk. If the target path is
    /// already this branch's worktree the call is an idempotent success;
    /// the entry is adopted into the registry.
    pub async fn create(&self, branch: &str) -> Result<WorktreeInfo, WorktreeError> {
        if branch.trim().is_empty() {
            return Err(WorktreeError::InvalidBranchName(branch.to_string()));
        }

        // A branch we already manage is an idempotent success.
        if let Some(info) = self.registry.read().await.get(branch) {
            debug!("Worktree for {} already registered at {:?}", branch, info.path);
            return Ok(info.clone());
        }

        let target = self.worktree_path(branch);
        let ledger = self.ledger().await?;

        for entry in &ledger {
            if entry.path == target {
                if entry.is_detached || entry.branch.is_none() {
                    return Err(WorktreeError::CannotAdopt { path: target });
                }
                let existing_branch = entry.branch.clone().unwrap_or_default();
                if existing_branch == branch {
                    // Already our worktree; adopt it.
                    let info = WorktreeInfo {
                        path: target,
                        branch: branch.to_string(),
                        managed: true,
                        created_at: Utc::now(),
                    };
                    self.registry
                        .write()
                        .await
                        .insert(branch.to_string(), info.clone());
                    info!("Adopted existing worktree for {} at {:?}", branch, info.path);
                    return Ok(info);
                }
                return Err(WorktreeError::NameCollision {
                    branch: branch.to_string(),
                    path: target,
                    existing_branch,
                });
            }
            if entry.branch.as_deref() == Some(branch) {
                return Err(WorktreeError::BranchInUse {
                    branch: branch.to_string(),
                    path: entry.path.clone(),
                });
            }
        }

        self.check_ref_prefix(branch).await?;

        let target_str = target.to_string_lossy().to_string();
        if self.branch_exists(branch).await {
            // Branch exists, just attach a worktree to it.
            self.git(&["worktree", "add", &target_str, branch]).await?;
        } else {
            self.git(&[
                "worktree",
                "add",
                "-b",
                branch,
                &target_str,
                &self.base_branch,
            ])
            .await?;
        }

        let info = WorktreeInfo {
            path: target,
            branch: branch.to_string(),
            managed: true,
            created_at: Utc::now(),
        };
        self.registry
            .write()
            .await
            .insert(branch.to_string(), info.clone());
        info!("Created worktree for {} at {:?}", branch, info.path);
        Ok(info)
    }

    /// Remove a worktree.
    ///
    /// If git refuses, falls back to force-deleting the directory and pruning
    /// the ledger. Always deregisters.
    pub async fn remove(&self, branch: &str, options: RemoveOptions) -> Result<(), WorktreeError> {
        let path = match self.registry.read().await.get(branch) {
            Some(info) => info.path.clone(),
            None => self.worktree_path(branch),
        };
        info!("Removing worktree for {} at {:?}", branch, path);

        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if options.force {
            args.push("--force");
        }
        args.push(&path_str);

        if let Err(e) = self.git(&args).await {
            warn!("Failed to remove worktree via git: {}", e);
            // Best effort from here: even if the directory cannot be deleted,
            // the entry must still be deregistered.
            if path.exists() {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!("Failed to delete worktree directory {:?}: {}", path, e);
                }
            }
            let _ = self.git(&["worktree", "prune"]).await;
        }

        if options.delete_branch {
            if let Err(e) = self.git(&["branch", "-D", branch]).await {
                warn!("Failed to delete branch {}: {}", branch, e);
            }
        }

        self.registry.write().await.remove(branch);
        Ok(())
    }

    /// List worktrees this manager created or adopted.
    pub async fn list(&self) -> Vec<WorktreeInfo> {
        self.registry.read().await.values().cloned().collect()
    }

    /// List managed worktrees plus discovered-but-unmanaged ones.
    ///
    /// The main checkout and bare entries are not worktrees and are skipped.
    pub async fn list_all(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let registry = self.registry.read().await;
        let mut result: Vec<WorktreeInfo> = registry.values().cloned().collect();

        for entry in self.ledger().await? {
            if entry.path == self.repo_root || entry.is_bare {
                continue;
            }
            let Some(branch) = entry.branch else { continue };
            if registry.contains_key(&branch) {
                continue;
            }
            result.push(WorktreeInfo {
                path: entry.path,
                branch,
                managed: false,
                created_at: Utc::now(),
            });
        }
        Ok(result)
    }

    /// Remove every managed worktree.
    pub async fn cleanup(&self, delete_branches: bool) -> Result<(), WorktreeError> {
        let branches: Vec<String> = self.registry.read().await.keys().cloned().collect();
        for branch in branches {
            let options = RemoveOptions {
                force: true,
                delete_branch: delete_branches,
            };
            if let Err(e) = self.remove(&branch, options).await {
                warn!("Failed to clean up worktree for {}: {}", branch, e);
            }
        }
        let _ = self.git(&["worktree", "prune"]).await;
        Ok(())
    }

    /// Get `git status --short` for a managed worktree. Best-effort.
    pub async fn get_status(&self, branch: &str) -> Vec<String> {
        let Some(path) = self.managed_path(branch).await else {
            return Vec::new();
        };
        run_lines(&path, &["status", "--short"]).await
    }

    /// Get commits made on a managed worktree since the base branch.
    /// Best-effort.
    pub async fn get_commits(&self, branch: &str) -> Vec<String> {
        let Some(path) = self.managed_path(branch).await else {
            return Vec::new();
        };
        commits_since(&path, &self.base_branch).await
    }

    /// Get files changed in a managed worktree relative to the base branch.
    /// Best-effort.
    pub async fn get_changed_files(&self, branch: &str) -> Vec<String> {
        let Some(path) = self.managed_path(branch).await else {
            return Vec::new();
        };
        changed_files_since(&path, &self.base_branch).await
    }

    async fn managed_path(&self, branch: &str) -> Option<PathBuf> {
        self.registry
            .read()
            .await
            .get(branch)
            .map(|info| info.path.clone())
    }
}

/// Sanitize a branch name for use as a directory name.
pub fn sanitize_branch_name(branch: &str) -> String {
    branch
        .replace('/', "-")
        .replace('\\', "-")
        .replace(':', "-")
        .replace('*', "-")
        .replace('?', "-")
        .replace('"', "-")
        .replace('<', "-")
        .replace('>', "-")
        .replace('|', "-")
        .trim_matches('-')
        .to_string()
}

/// Generate a worktree directory path for a branch.
///
/// Creates a sibling directory to the repository root with the sanitized
/// branch name.
pub fn worktree_path_for_branch(repo_root: &Path, branch: &str, prefix: Option<&str>) -> PathBuf {
    let sanitized = sanitize_branch_name(branch);
    let dir_name = match prefix {
        Some(p) => format!("{}{}", p, sanitized),
        None => sanitized,
    };

    repo_root.parent().unwrap_or(repo_root).join(dir_name)
}

/// Parse `git worktree list --porcelain` output.
fn parse_worktree_list(output: &str) -> Vec<LedgerEntry> {
    let mut entries = Vec::new();
    let mut current = LedgerEntry::default();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if !current.path.as_os_str().is_empty() {
                entries.push(std::mem::take(&mut current));
            }
            current.path = PathBuf::from(path);
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current.branch = Some(branch.to_string());
        } else if line == "bare" {
            current.is_bare = true;
        } else if line == "detached" {
            current.is_detached = true;
        }
    }

    if !current.path.as_os_str().is_empty() {
        entries.push(current);
    }
    entries
}

async fn run_lines(dir: &Path, args: &[&str]) -> Vec<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|s| s.to_string())
            .collect(),
        _ => Vec::new(),
    }
}

/// Commits on HEAD since it diverged from `base`. Best-effort.
pub(crate) async fn commits_since(dir: &Path, base: &str) -> Vec<String> {
    run_lines(dir, &["log", "--oneline", &format!("{base}..HEAD")]).await
}

/// Files changed on HEAD relative to `base`. Best-effort.
pub(crate) async fn changed_files_since(dir: &Path, base: &str) -> Vec<String> {
    run_lines(dir, &["diff", "--name-only", base]).await
}
