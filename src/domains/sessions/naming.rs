use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::domains::git::branches::branch_exists;
use crate::domains::sessions::registry::RegistrySnapshot;

pub const DEFAULT_BRANCH_PREFIX: &str = "gleiswerk";

pub fn validate_session_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 100 {
        return false;
    }

    let Some(first_char) = name.chars().next() else {
        return false;
    };
    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return false;
    }

    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

pub fn session_branch_name(prefix: &str, name: &str) -> String {
    format!("{prefix}/{name}")
}

fn is_available(
    repo_path: &Path,
    worktree_root: &Path,
    snapshot: &RegistrySnapshot,
    prefix: &str,
    name: &str,
) -> bool {
    let worktree_path = worktree_root.join(name);
    if worktree_path.exists() {
        return false;
    }
    let nickname_taken = snapshot
        .sessions
        .values()
        .any(|s| s.nickname.as_deref() == Some(name));
    if nickname_taken {
        return false;
    }
    !branch_exists(repo_path, &session_branch_name(prefix, name))
}

/// Allocates a unique `(name, branch, worktree_path)` triple for a new
/// session, probing the worktree directory, the registry, and the branch
/// namespace. Falls back to numbered candidates when the base name and its
/// early variants are taken.
pub fn find_unique_session_name(
    repo_path: &Path,
    worktree_root: &Path,
    snapshot: &RegistrySnapshot,
    prefix: &str,
    base_name: &str,
) -> Result<(String, String, PathBuf)> {
    if !validate_session_name(base_name) {
        return Err(anyhow!("invalid session name '{base_name}'"));
    }

    if is_available(repo_path, worktree_root, snapshot, prefix, base_name) {
        return Ok((
            base_name.to_string(),
            session_branch_name(prefix, base_name),
            worktree_root.join(base_name),
        ));
    }

    for i in 1..=100 {
        let candidate = format!("{base_name}-{i}");
        if is_available(repo_path, worktree_root, snapshot, prefix, &candidate) {
            return Ok((
                candidate.clone(),
                session_branch_name(prefix, &candidate),
                worktree_root.join(&candidate),
            ));
        }
    }

    Err(anyhow!(
        "unable to find a unique session name for '{base_name}' after 100 attempts"
    ))
}
