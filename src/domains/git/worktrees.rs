use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use git2::{Repository, WorktreePruneOptions};
use log::{debug, info, warn};

use crate::domains::git::branches::{delete_branch, validate_branch_name};
use crate::domains::git::process::{run_git, GitCommandError};

pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Why a worktree creation did not produce a usable checkout. Timeout,
/// plain failure, and signal death are separate variants so callers can
/// retry with a larger budget only when that would actually help.
#[derive(Debug)]
pub enum WorktreeCreateError {
    TimedOut {
        branch: String,
        limit: Duration,
    },
    Failed {
        branch: String,
        exit_code: i32,
        stderr: String,
    },
    Signaled {
        branch: String,
    },
    Spawn {
        message: String,
    },
}

impl fmt::Display for WorktreeCreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorktreeCreateError::TimedOut { branch, limit } => write!(
                f,
                "worktree creation for branch '{branch}' timed out after {}ms",
                limit.as_millis()
            ),
            WorktreeCreateError::Failed {
                branch,
                exit_code,
                stderr,
            } => write!(
                f,
                "worktree creation for branch '{branch}' failed with exit code {exit_code}: {stderr}"
            ),
            WorktreeCreateError::Signaled { branch } => write!(
                f,
                "worktree creation for branch '{branch}' was terminated by a signal"
            ),
            WorktreeCreateError::Spawn { message } => {
                write!(f, "could not start worktree creation: {message}")
            }
        }
    }
}

impl std::error::Error for WorktreeCreateError {}

/// Owns worktree+branch lifecycle for one repository: bounded-time
/// creation, best-effort cleanup of partial state, and teardown after
/// merges.
pub struct WorktreeManager {
    repo_path: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Creates a worktree and its branch in one `git worktree add -b` call,
    /// supervised by the process runner's deadline. Resolves with the
    /// accumulated subprocess output on success.
    pub async fn create_with_timeout(
        &self,
        worktree_path: &Path,
        branch: &str,
        base: Option<&str>,
        limit: Duration,
    ) -> Result<String, WorktreeCreateError> {
        if let Err(err) = validate_branch_name(branch) {
            return Err(WorktreeCreateError::Spawn {
                message: err.to_string(),
            });
        }
        if let Some(parent) = worktree_path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                return Err(WorktreeCreateError::Spawn {
                    message: format!("could not create {}: {err}", parent.display()),
                });
            }
        }

        let path_arg = worktree_path.display().to_string();
        let mut args: Vec<&str> = vec!["worktree", "add", "-b", branch, path_arg.as_str()];
        if let Some(base) = base {
            args.push(base);
        }

        info!(
            "creating worktree at {} on branch '{branch}' (limit {}ms)",
            worktree_path.display(),
            limit.as_millis()
        );

        match run_git(&self.repo_path, &args, limit).await {
            Ok(output) if output.success() => {
                debug!("worktree created at {}", worktree_path.display());
                Ok(format!("{}{}", output.stdout, output.stderr))
            }
            Ok(output) => Err(WorktreeCreateError::Failed {
                branch: branch.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            }),
            Err(GitCommandError::TimedOut { .. }) => Err(WorktreeCreateError::TimedOut {
                branch: branch.to_string(),
                limit,
            }),
            Err(GitCommandError::Signaled { .. }) => Err(WorktreeCreateError::Signaled {
                branch: branch.to_string(),
            }),
            Err(GitCommandError::Spawn { message, .. }) => {
                Err(WorktreeCreateError::Spawn { message })
            }
        }
    }

    /// Best-effort removal of whatever a failed creation left behind:
    /// partial directory, stale worktree registration, and, only when this
    /// manager created it, the branch. Never fails; every target may
    /// legitimately not exist.
    pub fn cleanup_failed_worktree(
        &self,
        worktree_path: &Path,
        branch: &str,
        branch_created_by_us: bool,
    ) {
        info!(
            "cleaning up failed worktree at {} (branch '{branch}')",
            worktree_path.display()
        );

        if worktree_path.exists() {
            if let Err(err) = std::fs::remove_dir_all(worktree_path) {
                warn!(
                    "could not remove partial worktree {}: {err}",
                    worktree_path.display()
                );
            }
        }

        if let Err(err) = self.prune_worktrees() {
            debug!("worktree prune during cleanup failed: {err}");
        }

        if branch_created_by_us {
            // Safe delete only: a branch that accumulated commits is the
            // user's to deal with.
            if let Err(err) = delete_branch(&self.repo_path, branch) {
                debug!("branch '{branch}' not deleted during cleanup: {err}");
            }
        }
    }

    /// Removes a worktree for good: plain `git worktree remove`, then the
    /// forced variant, then direct directory removal plus registration
    /// pruning as the last resort.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        let path_arg = worktree_path.display().to_string();

        let plain = std::process::Command::new("git")
            .args(["worktree", "remove", path_arg.as_str()])
            .current_dir(&self.repo_path)
            .output();
        if matches!(&plain, Ok(output) if output.status.success()) {
            return Ok(());
        }

        debug!(
            "plain worktree remove failed for {}, retrying with --force",
            worktree_path.display()
        );
        let forced = std::process::Command::new("git")
            .args(["worktree", "remove", "--force", path_arg.as_str()])
            .current_dir(&self.repo_path)
            .output();
        if matches!(&forced, Ok(output) if output.status.success()) {
            return Ok(());
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)
                .map_err(|e| anyhow!("failed to remove worktree directory: {e}"))?;
        }
        self.prune_worktrees()?;

        if worktree_path.exists() {
            return Err(anyhow!(
                "worktree still present at {}",
                worktree_path.display()
            ));
        }
        Ok(())
    }

    /// Every checkout of the repository: the primary working directory
    /// first, then each linked worktree.
    pub fn list_worktrees(&self) -> Result<Vec<PathBuf>> {
        let repo = Repository::open(&self.repo_path)?;
        let mut paths = Vec::new();

        if let Some(workdir) = repo.workdir() {
            paths.push(workdir.to_path_buf());
        }

        let worktrees = repo.worktrees()?;
        for name in worktrees.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                paths.push(wt.path().to_path_buf());
            }
        }

        Ok(paths)
    }

    /// Prunes registrations whose checkout directories are gone. Safe to
    /// call against a path that is not a repository at all.
    pub fn prune_worktrees(&self) -> Result<()> {
        let repo = match Repository::open(&self.repo_path) {
            Ok(repo) => repo,
            Err(_) => return Ok(()),
        };
        let worktrees = repo.worktrees()?;
        for name in worktrees.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if wt.validate().is_err() {
                    wt.prune(Some(&mut WorktreePruneOptions::new()))?;
                }
            }
        }
        Ok(())
    }

    /// Removes managed worktrees that no live session references. Paths are
    /// canonicalized before comparison so symlinked temp roots still match.
    pub fn cleanup_orphaned_worktrees(&self, managed_root: &Path, live_paths: &[PathBuf]) {
        let worktrees = match self.list_worktrees() {
            Ok(paths) => paths,
            Err(err) => {
                warn!("could not list worktrees for orphan sweep: {err}");
                return;
            }
        };

        let canonical_root = managed_root
            .canonicalize()
            .unwrap_or_else(|_| managed_root.to_path_buf());
        let live: Vec<PathBuf> = live_paths
            .iter()
            .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
            .collect();

        for worktree in worktrees {
            let canonical = worktree.canonicalize().unwrap_or_else(|_| worktree.clone());
            if !canonical.starts_with(&canonical_root) {
                continue;
            }
            if live.contains(&canonical) {
                continue;
            }
            info!("removing orphaned worktree: {}", worktree.display());
            if let Err(err) = self.remove_worktree(&worktree) {
                warn!(
                    "could not remove orphaned worktree {}: {err}",
                    worktree.display()
                );
            }
        }
    }
}

/// Distinguishes a linked worktree (`.git` is a file pointing at the parent
/// repository) from a primary checkout (`.git` is a directory). A missing
/// marker means "not a repository", not an error.
pub fn is_git_worktree(path: &Path) -> bool {
    let marker = path.join(".git");
    match std::fs::metadata(&marker) {
        Ok(metadata) => metadata.is_file(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::branches::branch_exists;
    use crate::domains::git::process::run_git_sync;
    use tempfile::TempDir;

    fn init_repo(path: &Path) {
        run_git_sync(path, &["init"]).unwrap();
        run_git_sync(path, &["config", "user.email", "test@example.com"]).unwrap();
        run_git_sync(path, &["config", "user.name", "Test User"]).unwrap();
        std::fs::write(path.join("README.md"), "initial\n").unwrap();
        run_git_sync(path, &["add", "README.md"]).unwrap();
        run_git_sync(path, &["commit", "-m", "Initial commit"]).unwrap();
        run_git_sync(path, &["branch", "-M", "main"]).unwrap();
    }

    #[tokio::test]
    async fn creates_worktree_and_branch_pair() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let manager = WorktreeManager::new(tmp.path().to_path_buf());
        let worktree = tmp.path().join(".gleiswerk/worktrees/s1");

        manager
            .create_with_timeout(&worktree, "gleiswerk/s1", Some("main"), DEFAULT_CREATE_TIMEOUT)
            .await
            .unwrap();

        assert!(worktree.exists());
        assert!(is_git_worktree(&worktree));
        assert!(!is_git_worktree(tmp.path()), "primary checkout is not a worktree");
        assert!(branch_exists(tmp.path(), "gleiswerk/s1"));
    }

    #[tokio::test]
    async fn duplicate_branch_reports_exit_failure_not_timeout() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let manager = WorktreeManager::new(tmp.path().to_path_buf());
        run_git_sync(tmp.path(), &["branch", "taken"]).unwrap();

        let err = manager
            .create_with_timeout(
                &tmp.path().join("wt"),
                "taken",
                Some("main"),
                DEFAULT_CREATE_TIMEOUT,
            )
            .await
            .unwrap_err();

        match err {
            WorktreeCreateError::Failed { exit_code, .. } => assert_ne!(exit_code, 0),
            other => panic!("expected exit failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn cleanup_is_safe_when_nothing_exists() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let manager = WorktreeManager::new(tmp.path().to_path_buf());

        // Neither the directory nor the branch was ever created.
        manager.cleanup_failed_worktree(&tmp.path().join("ghost"), "never-created", true);
    }

    #[tokio::test]
    async fn cleanup_removes_partial_directory_and_created_branch() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let manager = WorktreeManager::new(tmp.path().to_path_buf());
        let worktree = tmp.path().join(".gleiswerk/worktrees/s2");

        manager
            .create_with_timeout(&worktree, "gleiswerk/s2", Some("main"), DEFAULT_CREATE_TIMEOUT)
            .await
            .unwrap();

        manager.cleanup_failed_worktree(&worktree, "gleiswerk/s2", true);
        assert!(!worktree.exists());
        assert!(!branch_exists(tmp.path(), "gleiswerk/s2"));
    }

    #[tokio::test]
    async fn remove_worktree_handles_dirty_checkouts() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let manager = WorktreeManager::new(tmp.path().to_path_buf());
        let worktree = tmp.path().join(".gleiswerk/worktrees/s3");

        manager
            .create_with_timeout(&worktree, "gleiswerk/s3", Some("main"), DEFAULT_CREATE_TIMEOUT)
            .await
            .unwrap();
        // A dirty worktree defeats the plain remove and exercises --force.
        std::fs::write(worktree.join("scratch.txt"), "wip\n").unwrap();

        manager.remove_worktree(&worktree).unwrap();
        assert!(!worktree.exists());
    }

    #[tokio::test]
    async fn orphan_sweep_keeps_live_sessions() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        let manager = WorktreeManager::new(tmp.path().to_path_buf());
        let root = tmp.path().join(".gleiswerk/worktrees");
        let live = root.join("alive");
        let orphan = root.join("orphan");

        manager
            .create_with_timeout(&live, "gleiswerk/alive", Some("main"), DEFAULT_CREATE_TIMEOUT)
            .await
            .unwrap();
        manager
            .create_with_timeout(&orphan, "gleiswerk/orphan", Some("main"), DEFAULT_CREATE_TIMEOUT)
            .await
            .unwrap();

        manager.cleanup_orphaned_worktrees(&root, &[live.clone()]);

        assert!(live.exists());
        assert!(!orphan.exists());
    }
}
