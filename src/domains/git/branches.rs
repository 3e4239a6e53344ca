use std::path::Path;

use anyhow::{anyhow, Result};
use log::debug;

use crate::domains::git::process::run_git_sync;

pub fn branch_exists(repo_path: &Path, branch: &str) -> bool {
    let reference = format!("refs/heads/{branch}");
    std::process::Command::new("git")
        .args(["show-ref", "--verify", "--quiet", &reference])
        .current_dir(repo_path)
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Safe delete: refuses branches with unmerged commits, like `git branch -d`.
pub fn delete_branch(repo_path: &Path, branch: &str) -> Result<()> {
    validate_branch_name(branch)?;
    run_git_sync(repo_path, &["branch", "-d", branch])?;
    debug!("deleted branch '{branch}'");
    Ok(())
}

pub fn force_delete_branch(repo_path: &Path, branch: &str) -> Result<()> {
    validate_branch_name(branch)?;
    run_git_sync(repo_path, &["branch", "-D", branch])?;
    debug!("force-deleted branch '{branch}'");
    Ok(())
}

pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("branch name cannot be empty"));
    }
    if name.contains("..") || name.contains('\0') || name.contains('\\') {
        return Err(anyhow!("invalid branch name '{name}'"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.');
    if !name.chars().all(allowed) {
        return Err(anyhow!("branch name '{name}' contains invalid characters"));
    }
    Ok(())
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
        run_git_sync(path, &["branch", "-M", "main"]).unwrap();
    }

    #[test]
    fn branch_name_validation() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("feature/x").is_ok());
        assert!(validate_branch_name("release-1.2.3").is_ok());
        assert!(validate_branch_name("..bad").is_err());
        assert!(validate_branch_name("bad\\name").is_err());
        assert!(validate_branch_name("").is_err());
    }

    #[test]
    fn existence_and_safe_delete_roundtrip() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        run_git_sync(tmp.path(), &["branch", "scratch"]).unwrap();

        assert!(branch_exists(tmp.path(), "scratch"));
        delete_branch(tmp.path(), "scratch").unwrap();
        assert!(!branch_exists(tmp.path(), "scratch"));
    }

    #[test]
    fn safe_delete_refuses_unmerged_branch() {
        let tmp = TempDir::new().unwrap();
        init_repo(tmp.path());
        run_git_sync(tmp.path(), &["checkout", "-b", "wip"]).unwrap();
        std::fs::write(tmp.path().join("wip.txt"), "wip\n").unwrap();
        run_git_sync(tmp.path(), &["add", "wip.txt"]).unwrap();
        run_git_sync(tmp.path(), &["commit", "-m", "wip"]).unwrap();
        run_git_sync(tmp.path(), &["checkout", "main"]).unwrap();

        assert!(delete_branch(tmp.path(), "wip").is_err());
        force_delete_branch(tmp.path(), "wip").unwrap();
        assert!(!branch_exists(tmp.path(), "wip"));
    }
}
