use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, warn};

use crate::domains::git::process::{run_git, DEFAULT_COMMAND_TIMEOUT};
use crate::shared::cache::GitStateCache;

const QUERY_TIMEOUT: Duration = DEFAULT_COMMAND_TIMEOUT;

/// Current branch of the checkout at `cwd`, memoized under `branch:<path>`.
pub async fn current_branch(cwd: &Path, cache: &GitStateCache) -> Result<String> {
    let key = GitStateCache::key("branch", cwd);
    if let Some(branch) = cache.get(&key) {
        return Ok(branch);
    }

    let output = run_git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"], QUERY_TIMEOUT).await?;
    if !output.success() {
        return Err(anyhow!(
            "could not resolve current branch in {}: {}",
            cwd.display(),
            output.stderr.trim()
        ));
    }

    let branch = output.stdout_trimmed().to_string();
    cache.set(&key, branch.clone());
    Ok(branch)
}

/// Resolves the repository's main branch, memoized under
/// `main_branch:<path>`. Prefers the origin HEAD symref, then the first
/// existing candidate, then the current branch.
pub async fn main_branch(cwd: &Path, candidates: &[String], cache: &GitStateCache) -> Result<String> {
    let key = GitStateCache::key("main_branch", cwd);
    if let Some(branch) = cache.get(&key) {
        return Ok(branch);
    }

    let resolved = detect_main_branch(cwd, candidates).await?;
    cache.set(&key, resolved.clone());
    Ok(resolved)
}

async fn detect_main_branch(cwd: &Path, candidates: &[String]) -> Result<String> {
    let symref = run_git(
        cwd,
        &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
        QUERY_TIMEOUT,
    )
    .await;
    if let Ok(output) = symref {
        if output.success() {
            let name = output.stdout_trimmed();
            let local = name.strip_prefix("origin/").unwrap_or(name);
            if !local.is_empty() {
                debug!("main branch from origin HEAD: {local}");
                return Ok(local.to_string());
            }
        }
    }

    for candidate in candidates {
        if branch_exists_async(cwd, candidate).await {
            return Ok(candidate.clone());
        }
    }

    // Single-branch repositories without a remote: whatever is checked out
    // in the primary repository is the main line.
    let head = run_git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"], QUERY_TIMEOUT).await?;
    if head.success() {
        let branch = head.stdout_trimmed();
        if !branch.is_empty() && branch != "HEAD" {
            return Ok(branch.to_string());
        }
    }

    Err(anyhow!(
        "could not determine main branch in {}",
        cwd.display()
    ))
}

async fn branch_exists_async(cwd: &Path, branch: &str) -> bool {
    let reference = format!("refs/heads/{branch}");
    match run_git(cwd, &["show-ref", "--verify", "--quiet", &reference], QUERY_TIMEOUT).await {
        Ok(output) => output.success(),
        Err(err) => {
            warn!("branch existence probe failed for '{branch}': {err}");
            false
        }
    }
}

/// Commits on HEAD that are not reachable from `base`. Query failures
/// degrade to zero so status surfaces stay responsive when a branch is
/// mid-rewrite.
pub async fn commits_ahead_of(cwd: &Path, base: &str) -> u32 {
    let range = format!("{base}..HEAD");
    match run_git(cwd, &["rev-list", "--count", &range], QUERY_TIMEOUT).await {
        Ok(output) if output.success() => output.stdout_trimmed().parse().unwrap_or(0),
        Ok(output) => {
            debug!(
                "rev-list in {} exited {}: {}",
                cwd.display(),
                output.exit_code,
                output.stderr.trim()
            );
            0
        }
        Err(err) => {
            warn!("commit count query failed in {}: {err}", cwd.display());
            0
        }
    }
}

/// Whether the working tree at `cwd` has any staged, unstaged, or untracked
/// changes. Failures degrade to clean.
pub async fn is_dirty(cwd: &Path) -> bool {
    match run_git(cwd, &["status", "--porcelain"], QUERY_TIMEOUT).await {
        Ok(output) if output.success() => !output.stdout_trimmed().is_empty(),
        Ok(output) => {
            debug!(
                "status in {} exited {}: {}",
                cwd.display(),
                output.exit_code,
                output.stderr.trim()
            );
            false
        }
        Err(err) => {
            warn!("status query failed in {}: {err}", cwd.display());
            false
        }
    }
}

/// Raw porcelain status lines, for surfacing uncommitted changes verbatim
/// in precondition failures.
pub async fn status_lines(cwd: &Path) -> Vec<String> {
    match run_git(cwd, &["status", "--porcelain"], QUERY_TIMEOUT).await {
        Ok(output) if output.success() => output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
