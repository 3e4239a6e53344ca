use std::path::Path;

use anyhow::Result;
use git2::{Repository, StatusOptions};

/// In-process check for pending work in a checkout. Opens the worktree
/// repository directly; `discover` could resolve to the parent repository
/// and report the wrong status for linked worktrees.
pub fn has_uncommitted_changes(worktree_path: &Path) -> Result<bool> {
    let repo = Repository::open(worktree_path)?;

    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;

    Ok(!statuses.is_empty())
}

/// A bounded sample of paths with pending changes, for error messages.
pub fn uncommitted_sample_paths(worktree_path: &Path, limit: usize) -> Result<Vec<String>> {
    let repo = Repository::open(worktree_path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;

    let mut out = Vec::new();
    for entry in statuses.iter() {
        if let Some(path) = entry.path() {
            out.push(path.to_string());
            if out.len() >= limit {
                break;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::git::process::run_git_sync;
    use tempfile::TempDir;

    fn init_repo(path: &Path) {
        run_git_sync(path, &["init"]).unwrap();
        run_git_sync(path, &["config", "user.email", "test@example.com"]).unwrap();
        run_git_sync(path, &["config", "user.name", "Test User"]).unwrap();
        std::fs::write(path.join("README.md"), "initial\n").unwrap();
        run_git_sync(path, &["add", "README.md"]).unwrap();
        run_git_sync(path, &["commit", "-m", "Initial commit"]).unwrap();
    }

    #[test]
    fn clean_checkout_has_no_uncommitted_changes() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        assert!(!has_uncommitted_changes(tmp.path()).unwrap());
    }

    #[test]
    fn untracked_files_count_as_uncommitted() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        std::fs::write(tmp.path().join("untracked.txt"), "u\n").unwrap();

        assert!(has_uncommitted_changes(tmp.path()).unwrap());
        let sample = uncommitted_sample_paths(tmp.path(), 3).unwrap();
        assert!(sample.contains(&"untracked.txt".to_string()));
    }
}
