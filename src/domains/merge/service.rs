use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task;
use tokio::time::timeout;

use crate::config::OrchestratorConfig;
use crate::domains::git::branches::{delete_branch, force_delete_branch};
use crate::domains::git::operations::has_uncommitted_changes;
use crate::domains::git::process::{run_git, run_git_sync, DEFAULT_COMMAND_TIMEOUT};
use crate::domains::git::repository::{main_branch, status_lines};
use crate::domains::git::worktrees::WorktreeManager;
use crate::domains::merge::audit::{AuditSink, NoopSink, NotificationSink};
use crate::domains::merge::categorize::{
    build_resolution_plan, categorize_file, resolve_conflict, strategy_for,
};
use crate::domains::merge::types::{
    BlockReason, FileResolution, IntegrationOutcome, MergeAuditRecord, MergeNotification,
    MergeOptions, MergePreview, MergeStrategy, Mergeability, PlannedResolution, SmartMergeReport,
};
use crate::domains::merge::types::{ChangeResult, ChangedFile, CommitSummary};
use crate::domains::sessions::entity::Session;
use crate::domains::sessions::registry::SessionRegistry;
use crate::shared::cache::GitStateCache;

const OPERATION_LABEL: &str = "merge_session";

/// One merge attempt per session at a time, across every engine instance in
/// the process. Exclusion is the whole point, so this table is deliberately
/// process-wide.
static MERGE_LOCKS: Lazy<DashMap<String, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

fn try_acquire_merge_lock(session_id: &str) -> Option<OwnedMutexGuard<()>> {
    let entry = MERGE_LOCKS
        .entry(session_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())));
    let lock = entry.value().clone();
    lock.try_lock_owned().ok()
}

/// Everything the blocking merge work needs, detached from `&self` so it
/// can move into `spawn_blocking`.
#[derive(Clone)]
struct MergeContext {
    repo_path: PathBuf,
    worktree_path: PathBuf,
    session_label: String,
    session_branch: String,
    target_branch: String,
}

struct SmartOutcome {
    merged: bool,
    aborted: bool,
    resolutions: Vec<FileResolution>,
    new_commit: Option<String>,
    worktree_deleted: Option<bool>,
    branch_deleted: Option<bool>,
    error: Option<String>,
}

impl SmartOutcome {
    fn failed(error: String) -> Self {
        Self {
            merged: false,
            aborted: false,
            resolutions: Vec::new(),
            new_commit: None,
            worktree_deleted: None,
            branch_deleted: None,
            error: Some(error),
        }
    }
}

/// Orchestrates a merge attempt end to end: mergeability probing, preview,
/// execution, categorized auto-resolution, and teardown. Owns nothing
/// long-lived; the registry collaborator holds the canonical records.
pub struct MergeEngine {
    repo_path: PathBuf,
    registry: Arc<dyn SessionRegistry>,
    cache: Arc<GitStateCache>,
    notifications: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditSink>,
    config: OrchestratorConfig,
}

impl MergeEngine {
    pub fn new(
        repo_path: PathBuf,
        registry: Arc<dyn SessionRegistry>,
        cache: Arc<GitStateCache>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repo_path,
            registry,
            cache,
            notifications: Arc::new(NoopSink),
            audit: Arc::new(NoopSink),
            config,
        }
    }

    pub fn with_sinks(
        mut self,
        notifications: Arc<dyn NotificationSink>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        self.notifications = notifications;
        self.audit = audit;
        self
    }

    async fn target_branch(&self) -> anyhow::Result<String> {
        main_branch(
            &self.repo_path,
            &self.config.main_branch_candidates,
            &self.cache,
        )
        .await
    }

    fn context_for(&self, session: &Session, target: &str) -> MergeContext {
        MergeContext {
            repo_path: self.repo_path.clone(),
            worktree_path: session.path.clone(),
            session_label: session.display_name().to_string(),
            session_branch: session.branch.clone(),
            target_branch: target.to_string(),
        }
    }

    /// Fails fast on preconditions, then probes with a no-commit/no-ff
    /// dry-run merge that is aborted unconditionally. The repository ends
    /// on the branch it started on, whatever the probe found.
    pub async fn check_mergeability(&self, session: &Session) -> Mergeability {
        if session.is_main {
            return Mergeability::blocked(
                BlockReason::MainSession,
                format!("session '{}' is the main checkout", session.display_name()),
            );
        }
        if session.merged_at.is_some() {
            return Mergeability::blocked(
                BlockReason::AlreadyMerged,
                format!("session '{}' is already merged", session.display_name()),
            );
        }
        if !session.path.exists() {
            return Mergeability::blocked(
                BlockReason::MissingWorktree,
                format!("worktree missing at {}", session.path.display()),
            );
        }

        match has_uncommitted_changes(&session.path) {
            Ok(false) => {}
            Ok(true) => {
                let lines = status_lines(&session.path).await;
                return Mergeability::blocked(BlockReason::UncommittedChanges, lines.join("\n"));
            }
            Err(err) => {
                return Mergeability::blocked(
                    BlockReason::ProbeFailed,
                    format!("status inspection failed: {err}"),
                );
            }
        }

        let target = match self.target_branch().await {
            Ok(target) => target,
            Err(err) => return Mergeability::blocked(BlockReason::ProbeFailed, err.to_string()),
        };

        let commits_ahead = match self.count_commits_ahead(&target, &session.branch).await {
            Ok(count) => count,
            Err(err) => return Mergeability::blocked(BlockReason::ProbeFailed, err),
        };
        if commits_ahead == 0 {
            return Mergeability::blocked(
                BlockReason::NoChanges,
                format!(
                    "branch '{}' has no commits ahead of '{target}'",
                    session.branch
                ),
            );
        }

        self.probe_conflicts(&target, &session.branch, commits_ahead)
            .await
    }

    async fn count_commits_ahead(&self, target: &str, branch: &str) -> Result<u32, String> {
        let range = format!("{target}..{branch}");
        match run_git(
            &self.repo_path,
            &["rev-list", "--count", &range],
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await
        {
            Ok(output) if output.success() => Ok(output.stdout_trimmed().parse().unwrap_or(0)),
            Ok(output) => Err(format!(
                "could not count commits in {range}: {}",
                output.stderr.trim()
            )),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn probe_conflicts(
        &self,
        target: &str,
        branch: &str,
        commits_ahead: u32,
    ) -> Mergeability {
        let repo = self.repo_path.as_path();
        let original = match run_git(
            repo,
            &["rev-parse", "--abbrev-ref", "HEAD"],
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await
        {
            Ok(output) if output.success() => output.stdout_trimmed().to_string(),
            _ => {
                return Mergeability::blocked(
                    BlockReason::ProbeFailed,
                    "could not resolve the current branch before probing",
                );
            }
        };

        if original != target {
            match run_git(repo, &["checkout", target], DEFAULT_COMMAND_TIMEOUT).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    return Mergeability::blocked(
                        BlockReason::ProbeFailed,
                        format!("could not check out '{target}': {}", output.stderr.trim()),
                    );
                }
                Err(err) => {
                    return Mergeability::blocked(BlockReason::ProbeFailed, err.to_string());
                }
            }
        }

        let merge = run_git(
            repo,
            &["merge", "--no-commit", "--no-ff", branch],
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await;

        let probed = match merge {
            Ok(output) => {
                if output.success() {
                    Ok(None)
                } else {
                    let conflicts: Vec<&str> = output
                        .stdout
                        .lines()
                        .filter(|line| line.starts_with("CONFLICT"))
                        .collect();
                    Ok(Some(conflicts.join("\n")))
                }
            }
            Err(err) => Err(err.to_string()),
        };

        // The probe never leaves a merge in progress, whatever it found.
        let _ = run_git(repo, &["merge", "--abort"], DEFAULT_COMMAND_TIMEOUT).await;
        if original != target && original != "HEAD" && !original.is_empty() {
            match run_git(repo, &["checkout", &original], DEFAULT_COMMAND_TIMEOUT).await {
                Ok(output) if output.success() => {}
                _ => error!("{OPERATION_LABEL}: could not restore branch '{original}' after probe"),
            }
        }
        self.cache.invalidate_path(repo);

        match probed {
            Ok(None) => Mergeability::clean(commits_ahead),
            Ok(Some(detail)) => Mergeability::conflicted(commits_ahead, detail),
            Err(err) => Mergeability::blocked(BlockReason::ProbeFailed, err),
        }
    }

    /// Commit and changed-file summary between the target branch and the
    /// session branch. Read-only; the working tree is never touched.
    pub async fn merge_preview(&self, session: &Session) -> anyhow::Result<MergePreview> {
        let target = self.target_branch().await?;

        let log_range = format!("{target}..{}", session.branch);
        let log_output = run_git(
            &self.repo_path,
            &["log", "--oneline", "--no-decorate", &log_range],
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await?;
        if !log_output.success() {
            anyhow::bail!(
                "could not list commits for '{}': {}",
                session.branch,
                log_output.stderr.trim()
            );
        }
        let commits: Vec<CommitSummary> = log_output
            .stdout
            .lines()
            .filter_map(|line| {
                let (hash, subject) = line.split_once(' ')?;
                Some(CommitSummary {
                    hash: hash.to_string(),
                    subject: subject.to_string(),
                })
            })
            .collect();

        let diff_range = format!("{target}...{}", session.branch);
        let diff_output = run_git(
            &self.repo_path,
            &["diff", "--name-status", &diff_range],
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await?;
        if !diff_output.success() {
            anyhow::bail!(
                "could not diff '{}' against '{target}': {}",
                session.branch,
                diff_output.stderr.trim()
            );
        }
        let files: Vec<ChangedFile> = diff_output
            .stdout
            .lines()
            .filter_map(|line| {
                let (status, path) = line.split_once('\t')?;
                let change_type = match status.chars().next()? {
                    'A' => "added",
                    'D' => "deleted",
                    'R' => "renamed",
                    'C' => "copied",
                    _ => "modified",
                };
                Some(ChangedFile {
                    path: path.trim().to_string(),
                    change_type: change_type.to_string(),
                })
            })
            .collect();

        Ok(MergePreview {
            session_branch: session.branch.clone(),
            target_branch: target.clone(),
            commit_count: commits.len(),
            commits,
            file_count: files.len(),
            files,
            default_commit_message: format!(
                "Merge session '{}' into {target}",
                session.display_name()
            ),
        })
    }

    /// Files changed on both sides since the merge-base: the candidates a
    /// conflicted merge will need resolutions for.
    pub async fn conflicting_files(&self, session: &Session) -> anyhow::Result<Vec<String>> {
        let target = self.target_branch().await?;
        let base_output = run_git(
            &self.repo_path,
            &["merge-base", &target, &session.branch],
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await?;
        if !base_output.success() {
            anyhow::bail!(
                "no merge-base between '{target}' and '{}': {}",
                session.branch,
                base_output.stderr.trim()
            );
        }
        let base = base_output.stdout_trimmed().to_string();

        let ours = self.changed_since(&base, &target).await?;
        let theirs = self.changed_since(&base, &session.branch).await?;

        let mut both: Vec<String> = ours.into_iter().filter(|f| theirs.contains(f)).collect();
        both.sort();
        both.dedup();
        Ok(both)
    }

    async fn changed_since(&self, base: &str, tip: &str) -> anyhow::Result<Vec<String>> {
        let range = format!("{base}..{tip}");
        let output = run_git(
            &self.repo_path,
            &["diff", "--name-only", &range],
            DEFAULT_COMMAND_TIMEOUT,
        )
        .await?;
        if !output.success() {
            anyhow::bail!("could not diff {range}: {}", output.stderr.trim());
        }
        Ok(output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Executes the merge and tears the session down. Callers are expected
    /// to have validated mergeability; a conflicting merge aborts cleanly
    /// and reports `conflict: true`.
    pub async fn integrate_session(
        &self,
        session: &Session,
        opts: &MergeOptions,
    ) -> IntegrationOutcome {
        if session.is_main {
            return IntegrationOutcome::failure("refusing to merge the main session", false);
        }
        if session.merged_at.is_some() {
            return IntegrationOutcome::failure(
                format!("session '{}' is already merged", session.display_name()),
                false,
            );
        }
        let Some(_guard) = try_acquire_merge_lock(&session.id) else {
            return IntegrationOutcome::failure(
                format!(
                    "merge already running for session '{}'",
                    session.display_name()
                ),
                false,
            );
        };

        let target = match self.target_branch().await {
            Ok(target) => target,
            Err(err) => return IntegrationOutcome::failure(err.to_string(), false),
        };
        let ctx = self.context_for(session, &target);
        let message = resolve_message(opts, session, &target);

        info!(
            "{OPERATION_LABEL}: merging '{}' into '{target}' ({})",
            ctx.session_branch,
            opts.strategy.as_str()
        );

        let work = {
            let ctx = ctx.clone();
            let opts = opts.clone();
            let message = message.clone();
            task::spawn_blocking(move || perform_integration(&ctx, &opts, &message))
        };

        let mut outcome = match timeout(self.config.merge_timeout(), work).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                IntegrationOutcome::failure(format!("merge task panicked: {join_err}"), false)
            }
            Err(_) => {
                warn!(
                    "{OPERATION_LABEL}: merge of '{}' timed out after {}s",
                    ctx.session_branch, self.config.merge_timeout_secs
                );
                IntegrationOutcome::failure(
                    format!("merge timed out after {}s", self.config.merge_timeout_secs),
                    false,
                )
            }
        };

        if outcome.merged {
            self.finish_merge(session, opts.strategy.as_str(), &message, &mut outcome);
        }
        outcome
    }

    /// Mergeability first; clean sessions delegate to `integrate_session`.
    /// Conflicted sessions get a resolution plan from the files changed on
    /// both sides, and either every file resolves and the merge commits
    /// with an auto-resolved marker, or the whole attempt aborts with the
    /// failures enumerated and no partial commit.
    pub async fn smart_merge(&self, session: &Session, opts: &MergeOptions) -> SmartMergeReport {
        let started_at = Utc::now();

        let check = self.check_mergeability(session).await;
        if let Some(reason) = check.reason {
            if reason != BlockReason::Conflicts {
                return SmartMergeReport::failure(
                    check
                        .detail
                        .unwrap_or_else(|| format!("merge blocked ({})", reason_label(reason))),
                );
            }
        }

        if !check.has_conflicts {
            let integration = self.integrate_session(session, opts).await;
            return SmartMergeReport {
                success: integration.success,
                merged: integration.merged,
                auto_resolved: Vec::new(),
                failed_files: Vec::new(),
                plan: Vec::new(),
                resolutions: Vec::new(),
                aborted: false,
                error: integration.error.clone(),
                integration: Some(integration),
            };
        }

        let files = match self.conflicting_files(session).await {
            Ok(files) => files,
            Err(err) => return SmartMergeReport::failure(err.to_string()),
        };
        let plan = build_resolution_plan(&files);
        info!(
            "{OPERATION_LABEL}: auto-resolving {} conflicting file(s) for '{}'",
            plan.len(),
            session.display_name()
        );

        let Some(_guard) = try_acquire_merge_lock(&session.id) else {
            return SmartMergeReport::failure(format!(
                "merge already running for session '{}'",
                session.display_name()
            ));
        };

        let target = match self.target_branch().await {
            Ok(target) => target,
            Err(err) => return SmartMergeReport::failure(err.to_string()),
        };
        let ctx = self.context_for(session, &target);
        let message = format!(
            "{} [auto-resolved {} conflict(s)]",
            resolve_message(opts, session, &target),
            plan.len()
        );

        let work = {
            let ctx = ctx.clone();
            let opts = opts.clone();
            let plan = plan.clone();
            let message = message.clone();
            task::spawn_blocking(move || perform_smart_merge(&ctx, &opts, &plan, &message))
        };

        let outcome = match timeout(self.config.merge_timeout(), work).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => SmartOutcome::failed(format!("merge task panicked: {join_err}")),
            Err(_) => SmartOutcome::failed(format!(
                "merge timed out after {}s",
                self.config.merge_timeout_secs
            )),
        };

        let auto_resolved: Vec<String> = outcome
            .resolutions
            .iter()
            .filter(|r| r.success)
            .map(|r| r.file.clone())
            .collect();
        let failed_files: Vec<String> = outcome
            .resolutions
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.file.clone())
            .collect();

        let mut integration = None;
        if outcome.merged {
            let mut merged_outcome = IntegrationOutcome {
                success: true,
                merged: true,
                new_commit: outcome.new_commit.clone(),
                conflict: false,
                worktree_deleted: outcome.worktree_deleted,
                branch_deleted: outcome.branch_deleted,
                unregistered: None,
                error: None,
            };
            self.finish_merge(session, opts.strategy.as_str(), &message, &mut merged_outcome);

            let record = MergeAuditRecord {
                session_id: session.id.clone(),
                started_at,
                merged_at: Utc::now(),
                resolutions: plan.clone(),
            };
            if let Err(err) = self.audit.record_merge(&record) {
                warn!("{OPERATION_LABEL}: audit sink failed: {err}");
            }
            integration = Some(merged_outcome);
        }

        SmartMergeReport {
            success: outcome.merged,
            merged: outcome.merged,
            auto_resolved,
            failed_files,
            plan,
            resolutions: outcome.resolutions,
            aborted: outcome.aborted,
            integration,
            error: outcome.error,
        }
    }

    /// Side effects after the repository-level merge landed: notification
    /// record, registry removal, and cache invalidation for every key the
    /// merge made stale. Failures here are soft; the code is merged.
    fn finish_merge(
        &self,
        session: &Session,
        strategy: &str,
        message: &str,
        outcome: &mut IntegrationOutcome,
    ) {
        let notification = MergeNotification {
            timestamp: Utc::now(),
            session_id: session.id.clone(),
            branch: session.branch.clone(),
            strategy: strategy.to_string(),
            message: message.to_string(),
        };
        if let Err(err) = self.notifications.notify_merge(&notification) {
            warn!("{OPERATION_LABEL}: notification sink failed: {err}");
        }

        let unregistered = self
            .registry
            .unregister(&session.id)
            .and_then(|()| self.registry.remove_lock(&session.id));
        outcome.unregistered = Some(match unregistered {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "{OPERATION_LABEL}: could not unregister session '{}': {err}",
                    session.display_name()
                );
                false
            }
        });

        self.cache.invalidate_path(&self.repo_path);
        self.cache.invalidate_path(&session.path);
    }
}

fn reason_label(reason: BlockReason) -> &'static str {
    match reason {
        BlockReason::MainSession => "main_session",
        BlockReason::AlreadyMerged => "already_merged",
        BlockReason::MissingWorktree => "missing_worktree",
        BlockReason::UncommittedChanges => "uncommitted_changes",
        BlockReason::NoChanges => "no_changes",
        BlockReason::Conflicts => "conflicts",
        BlockReason::ProbeFailed => "probe_failed",
        BlockReason::MergeInProgress => "merge_in_progress",
    }
}

fn resolve_message(opts: &MergeOptions, session: &Session, target: &str) -> String {
    opts.message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Merge session '{}' into {target}", session.display_name()))
}

fn perform_integration(
    ctx: &MergeContext,
    opts: &MergeOptions,
    message: &str,
) -> IntegrationOutcome {
    let repo = ctx.repo_path.as_path();

    if let Err(err) = run_git_sync(repo, &["checkout", &ctx.target_branch]) {
        return IntegrationOutcome::failure(
            format!("could not check out '{}': {err}", ctx.target_branch),
            false,
        );
    }
    // Local-only repositories have no upstream; a failed pull is not fatal.
    if let Err(err) = run_git_sync(repo, &["pull", "--ff-only"]) {
        debug!("{OPERATION_LABEL}: fast-forward pull skipped: {err}");
    }

    let merge_result = match opts.strategy {
        MergeStrategy::Squash => run_git_sync(repo, &["merge", "--squash", &ctx.session_branch])
            .and_then(|_| run_git_sync(repo, &["commit", "-m", message])),
        MergeStrategy::Merge => run_git_sync(
            repo,
            &["merge", "--no-ff", &ctx.session_branch, "-m", message],
        ),
    };

    if let Err(err) = merge_result {
        abort_in_progress_merge(repo);
        return IntegrationOutcome::failure(
            format!(
                "merge of '{}' into '{}' failed: {err}",
                ctx.session_branch, ctx.target_branch
            ),
            true,
        );
    }

    let new_commit = run_git_sync(repo, &["rev-parse", "HEAD"]).ok();
    let (worktree_deleted, branch_deleted) = teardown(ctx, opts);

    IntegrationOutcome {
        success: true,
        merged: true,
        new_commit,
        conflict: false,
        worktree_deleted,
        branch_deleted,
        unregistered: None,
        error: None,
    }
}

fn perform_smart_merge(
    ctx: &MergeContext,
    opts: &MergeOptions,
    plan: &[PlannedResolution],
    message: &str,
) -> SmartOutcome {
    let repo = ctx.repo_path.as_path();
    let mut out = SmartOutcome {
        merged: false,
        aborted: false,
        resolutions: Vec::new(),
        new_commit: None,
        worktree_deleted: None,
        branch_deleted: None,
        error: None,
    };

    let original = run_git_sync(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).ok();
    if let Err(err) = run_git_sync(repo, &["checkout", &ctx.target_branch]) {
        out.error = Some(format!("could not check out '{}': {err}", ctx.target_branch));
        return out;
    }
    if let Err(err) = run_git_sync(repo, &["pull", "--ff-only"]) {
        debug!("{OPERATION_LABEL}: fast-forward pull skipped: {err}");
    }

    let started = run_git_sync(
        repo,
        &["merge", "--no-commit", "--no-ff", &ctx.session_branch],
    );

    if let Err(merge_err) = started {
        debug!("{OPERATION_LABEL}: merge reported conflicts, applying plan: {merge_err}");
        for planned in plan {
            out.resolutions.push(resolve_conflict(repo, planned));
        }

        // Conflicted paths the plan missed count as failures too.
        let leftover = run_git_sync(repo, &["diff", "--name-only", "--diff-filter=U"])
            .map(|s| {
                s.lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for file in leftover {
            if !out.resolutions.iter().any(|r| r.file == file) {
                let category = categorize_file(&file);
                out.resolutions.push(FileResolution {
                    file,
                    category,
                    strategy: strategy_for(category),
                    success: false,
                    fallback_applied: false,
                    error: Some("file was not covered by the resolution plan".to_string()),
                });
            }
        }

        if out.resolutions.iter().any(|r| !r.success) {
            abort_in_progress_merge(repo);
            restore_branch(repo, original.as_deref(), &ctx.target_branch);
            out.aborted = true;
            out.error = Some(format!(
                "auto-resolution incomplete for '{}'; merge aborted with no partial commit",
                ctx.session_label
            ));
            return out;
        }

        // Every resolution staged its file; the merge machinery staged the
        // rest. Committing here closes the in-progress merge.
        if let Err(err) = run_git_sync(repo, &["commit", "-m", message]) {
            abort_in_progress_merge(repo);
            restore_branch(repo, original.as_deref(), &ctx.target_branch);
            out.aborted = true;
            out.error = Some(format!("could not commit resolved merge: {err}"));
            return out;
        }
    } else {
        // The dry run predicted conflicts but the real merge applied
        // cleanly; commit the staged result.
        if let Err(err) = run_git_sync(repo, &["commit", "-m", message]) {
            abort_in_progress_merge(repo);
            restore_branch(repo, original.as_deref(), &ctx.target_branch);
            out.aborted = true;
            out.error = Some(format!("could not commit merge: {err}"));
            return out;
        }
    }

    out.merged = true;
    out.new_commit = run_git_sync(repo, &["rev-parse", "HEAD"]).ok();
    let (worktree_deleted, branch_deleted) = teardown(ctx, opts);
    out.worktree_deleted = worktree_deleted;
    out.branch_deleted = branch_deleted;
    out
}

fn teardown(ctx: &MergeContext, opts: &MergeOptions) -> (Option<bool>, Option<bool>) {
    let worktree_deleted = if opts.delete_worktree && ctx.worktree_path != ctx.repo_path {
        let manager = WorktreeManager::new(ctx.repo_path.clone());
        match manager.remove_worktree(&ctx.worktree_path) {
            Ok(()) => Some(true),
            Err(err) => {
                warn!(
                    "{OPERATION_LABEL}: could not delete worktree {}: {err}",
                    ctx.worktree_path.display()
                );
                Some(false)
            }
        }
    } else {
        None
    };

    let branch_deleted = if opts.delete_branch {
        let deleted = delete_branch(&ctx.repo_path, &ctx.session_branch)
            .or_else(|_| force_delete_branch(&ctx.repo_path, &ctx.session_branch));
        match deleted {
            Ok(()) => Some(true),
            Err(err) => {
                warn!(
                    "{OPERATION_LABEL}: could not delete branch '{}': {err}",
                    ctx.session_branch
                );
                Some(false)
            }
        }
    } else {
        None
    };

    (worktree_deleted, branch_deleted)
}

fn abort_in_progress_merge(repo: &Path) {
    // Squash conflicts leave no MERGE_HEAD, so `merge --abort` can itself
    // fail; `reset --merge` covers that shape.
    if run_git_sync(repo, &["merge", "--abort"]).is_err() {
        let _ = run_git_sync(repo, &["reset", "--merge"]);
    }
}

fn restore_branch(repo: &Path, original: Option<&str>, target: &str) {
    if let Some(original) = original {
        if original != target && !original.is_empty() && original != "HEAD" {
            if run_git_sync(repo, &["checkout", original]).is_err() {
                error!("{OPERATION_LABEL}: could not restore branch '{original}' after abort");
            }
        }
    }
}

/// Stage-all plus commit. An empty working tree is success with no hash,
/// not an error.
pub fn commit_changes(worktree: &Path, message: &str) -> ChangeResult {
    match run_git_sync(worktree, &["status", "--porcelain"]) {
        Ok(status) if status.is_empty() => return ChangeResult::ok(None),
        Ok(_) => {}
        Err(err) => return ChangeResult::failed(err.to_string()),
    }
    let committed = run_git_sync(worktree, &["add", "-A"])
        .and_then(|_| run_git_sync(worktree, &["commit", "-m", message]))
        .and_then(|_| run_git_sync(worktree, &["rev-parse", "HEAD"]));
    match committed {
        Ok(hash) => ChangeResult::ok(Some(hash)),
        Err(err) => ChangeResult::failed(err.to_string()),
    }
}

/// Stash including untracked files; nothing to stash is success.
pub fn stash_changes(worktree: &Path) -> ChangeResult {
    match run_git_sync(worktree, &["stash", "push", "-u"]) {
        Ok(_) => ChangeResult::ok(None),
        Err(err) => ChangeResult::failed(err.to_string()),
    }
}

/// Pops the most recent stash; an empty stash is success.
pub fn unstash_changes(worktree: &Path) -> ChangeResult {
    match run_git_sync(worktree, &["stash", "list"]) {
        Ok(list) if list.is_empty() => return ChangeResult::ok(None),
        Ok(_) => {}
        Err(err) => return ChangeResult::failed(err.to_string()),
    }
    match run_git_sync(worktree, &["stash", "pop"]) {
        Ok(_) => ChangeResult::ok(None),
        Err(err) => ChangeResult::failed(err.to_string()),
    }
}

/// Unstages everything, then hard-checks-out tracked paths. Untracked
/// files are left alone.
pub fn discard_changes(worktree: &Path) -> ChangeResult {
    let discarded = run_git_sync(worktree, &["reset"])
        .and_then(|_| run_git_sync(worktree, &["checkout", "--", "."]));
    match discarded {
        Ok(_) => ChangeResult::ok(None),
        Err(err) => ChangeResult::failed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::merge::audit::MemorySink;
    use crate::domains::sessions::registry::InMemoryRegistry;
    use crate::domains::sessions::service::SessionService;
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

    fn commit_file(path: &Path, name: &str, contents: &str, message: &str) {
        let file = path.join(name);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(file, contents).unwrap();
        run_git_sync(path, &["add", name]).unwrap();
        run_git_sync(path, &["commit", "-m", message]).unwrap();
    }

    struct Fixture {
        _tmp: TempDir,
        repo: PathBuf,
        engine: MergeEngine,
        service: SessionService,
        registry: Arc<InMemoryRegistry>,
        sink: Arc<MemorySink>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().to_path_buf();
        init_repo(&repo);
        let registry = Arc::new(InMemoryRegistry::new());
        let cache = Arc::new(GitStateCache::default());
        let config = OrchestratorConfig::default();
        let sink = Arc::new(MemorySink::new());
        let engine = MergeEngine::new(
            repo.clone(),
            registry.clone(),
            cache.clone(),
            config.clone(),
        )
        .with_sinks(sink.clone(), sink.clone());
        let service = SessionService::new(repo.clone(), registry.clone(), cache, config);
        Fixture {
            _tmp: tmp,
            repo,
            engine,
            service,
            registry,
            sink,
        }
    }

    fn current_branch_of(repo: &Path) -> String {
        run_git_sync(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap()
    }

    fn commit_count(repo: &Path, branch: &str) -> u32 {
        run_git_sync(repo, &["rev-list", "--count", branch])
            .unwrap()
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn clean_merge_end_to_end() {
        let f = fixture();
        let session = f.service.create_session("s1", Some("main")).await.unwrap();
        for i in 0..3 {
            commit_file(
                &session.path,
                &format!("feature_{i}.txt"),
                "work\n",
                &format!("feature {i}"),
            );
        }

        let check = f.engine.check_mergeability(&session).await;
        assert!(check.mergeable, "expected mergeable, got {check:?}");
        assert!(!check.has_conflicts);
        assert_eq!(check.commits_ahead, 3);

        let outcome = f
            .engine
            .integrate_session(&session, &MergeOptions::default())
            .await;
        assert!(outcome.success, "integration failed: {:?}", outcome.error);
        assert!(outcome.merged);
        assert_eq!(outcome.worktree_deleted, Some(true));
        assert_eq!(outcome.branch_deleted, Some(true));
        assert_eq!(outcome.unregistered, Some(true));

        assert!(f.repo.join("feature_0.txt").exists());
        assert!(!session.path.exists());
        assert!(f.registry.load().unwrap().sessions.is_empty());
        assert_eq!(f.sink.notifications.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn uncommitted_changes_block_the_merge() {
        let f = fixture();
        let session = f.service.create_session("s2", Some("main")).await.unwrap();
        commit_file(&session.path, "tracked.txt", "v1\n", "add tracked");
        std::fs::write(session.path.join("tracked.txt"), "v2 uncommitted\n").unwrap();

        let check = f.engine.check_mergeability(&session).await;
        assert!(!check.mergeable);
        assert_eq!(check.reason, Some(BlockReason::UncommittedChanges));
        let detail = check.detail.unwrap();
        assert!(detail.contains("tracked.txt"), "raw status lines expected, got: {detail}");
    }

    #[tokio::test]
    async fn zero_commits_ahead_blocks_the_merge() {
        let f = fixture();
        let session = f.service.create_session("s3", Some("main")).await.unwrap();

        let check = f.engine.check_mergeability(&session).await;
        assert!(!check.mergeable);
        assert_eq!(check.reason, Some(BlockReason::NoChanges));
        assert_eq!(check.commits_ahead, 0);
    }

    #[tokio::test]
    async fn main_session_is_never_mergeable() {
        let f = fixture();
        let main = Session::new_main(f.repo.clone(), "main".to_string());

        let check = f.engine.check_mergeability(&main).await;
        assert_eq!(check.reason, Some(BlockReason::MainSession));

        let outcome = f
            .engine
            .integrate_session(&main, &MergeOptions::default())
            .await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn mergeability_probe_leaves_no_trace() {
        let f = fixture();
        let session = f.service.create_session("s4", Some("main")).await.unwrap();
        commit_file(&session.path, "conflict.txt", "session side\n", "session edit");
        commit_file(&f.repo, "conflict.txt", "main side\n", "main edit");

        let branch_before = current_branch_of(&f.repo);
        let check = f.engine.check_mergeability(&session).await;
        assert!(check.has_conflicts);
        assert!(!check.mergeable);

        assert_eq!(current_branch_of(&f.repo), branch_before);
        assert!(
            run_git_sync(&f.repo, &["rev-parse", "-q", "--verify", "MERGE_HEAD"]).is_err(),
            "no in-progress merge may remain after the probe"
        );
        assert!(
            run_git_sync(&f.repo, &["status", "--porcelain"]).unwrap().is_empty(),
            "probe must leave a clean working tree"
        );
    }

    #[tokio::test]
    async fn preview_reports_commits_and_files_read_only() {
        let f = fixture();
        let session = f.service.create_session("s5", Some("main")).await.unwrap();
        commit_file(&session.path, "one.txt", "1\n", "add one");
        commit_file(&session.path, "two.txt", "2\n", "add two");

        let preview = f.engine.merge_preview(&session).await.unwrap();
        assert_eq!(preview.commit_count, 2);
        assert_eq!(preview.file_count, 2);
        assert_eq!(preview.target_branch, "main");
        assert!(preview.files.iter().all(|file| file.change_type == "added"));
        assert!(!f.repo.join("one.txt").exists(), "preview must not mutate the checkout");
    }

    #[tokio::test]
    async fn conflicting_files_is_the_both_sides_intersection() {
        let f = fixture();
        commit_file(&f.repo, "shared.txt", "base\n", "add shared");
        let session = f.service.create_session("s6", Some("main")).await.unwrap();
        commit_file(&session.path, "shared.txt", "session\n", "session edit");
        commit_file(&session.path, "session_only.txt", "s\n", "session only");
        commit_file(&f.repo, "shared.txt", "main\n", "main edit");
        commit_file(&f.repo, "main_only.txt", "m\n", "main only");

        let files = f.engine.conflicting_files(&session).await.unwrap();
        assert_eq!(files, vec!["shared.txt".to_string()]);
    }

    #[tokio::test]
    async fn smart_merge_auto_resolves_categorized_conflicts() {
        let f = fixture();
        commit_file(&f.repo, "docs/CHANGELOG.md", "# Changelog\n- base\n", "base changelog");
        commit_file(&f.repo, "src/app.js", "console.log('base');\n", "base app");

        let session = f.service.create_session("s7", Some("main")).await.unwrap();
        commit_file(
            &session.path,
            "docs/CHANGELOG.md",
            "# Changelog\n- base\n- session entry\n",
            "session changelog",
        );
        commit_file(
            &session.path,
            "src/app.js",
            "console.log('session');\n",
            "session app",
        );

        commit_file(
            &f.repo,
            "docs/CHANGELOG.md",
            "# Changelog\n- base\n- main entry\n",
            "main changelog",
        );
        commit_file(&f.repo, "src/app.js", "console.log('main');\n", "main app");

        let report = f
            .engine
            .smart_merge(&session, &MergeOptions::default())
            .await;
        assert!(report.success, "smart merge failed: {:?}", report.error);
        assert!(report.merged);
        assert!(report.auto_resolved.contains(&"docs/CHANGELOG.md".to_string()));
        assert!(report.auto_resolved.contains(&"src/app.js".to_string()));
        assert!(report.failed_files.is_empty());

        // Union kept both changelog entries; recursive fallback took the
        // incoming source file.
        let changelog = std::fs::read_to_string(f.repo.join("docs/CHANGELOG.md")).unwrap();
        assert!(changelog.contains("- session entry"));
        assert!(changelog.contains("- main entry"));
        let app = std::fs::read_to_string(f.repo.join("src/app.js")).unwrap();
        assert!(app.contains("console.log('session');"));

        let last_message = run_git_sync(&f.repo, &["log", "-1", "--pretty=%B"]).unwrap();
        assert!(last_message.contains("auto-resolved"), "got: {last_message}");

        assert!(f.registry.load().unwrap().sessions.is_empty());
        assert_eq!(f.sink.records.lock().unwrap().len(), 1);
        let record = f.sink.records.lock().unwrap()[0].clone();
        assert_eq!(record.resolutions.len(), 2);
    }

    #[tokio::test]
    async fn smart_merge_delegates_when_clean() {
        let f = fixture();
        let session = f.service.create_session("s8", Some("main")).await.unwrap();
        commit_file(&session.path, "clean.txt", "c\n", "clean work");

        let report = f
            .engine
            .smart_merge(&session, &MergeOptions::default())
            .await;
        assert!(report.success);
        assert!(report.merged);
        assert!(report.plan.is_empty());
        assert!(report.integration.is_some());
    }

    #[tokio::test]
    async fn smart_merge_aborts_whole_attempt_when_one_file_fails() {
        let f = fixture();
        commit_file(&f.repo, "docs/CHANGELOG.md", "# log\n- base\n", "base changelog");
        commit_file(&f.repo, "src/app.js", "base();\n", "base app");

        let session = f.service.create_session("s9", Some("main")).await.unwrap();
        // The session deletes the source file while main edits it: the
        // incoming side has no version to fall back to, so resolution fails.
        commit_file(
            &session.path,
            "docs/CHANGELOG.md",
            "# log\n- base\n- session entry\n",
            "session changelog",
        );
        run_git_sync(&session.path, &["rm", "src/app.js"]).unwrap();
        run_git_sync(&session.path, &["commit", "-m", "drop app"]).unwrap();

        commit_file(
            &f.repo,
            "docs/CHANGELOG.md",
            "# log\n- base\n- main entry\n",
            "main changelog",
        );
        commit_file(&f.repo, "src/app.js", "main();\n", "main app");

        let main_commits_before = commit_count(&f.repo, "main");
        let report = f
            .engine
            .smart_merge(&session, &MergeOptions::default())
            .await;

        assert!(!report.success);
        assert!(report.aborted);
        assert!(report.failed_files.contains(&"src/app.js".to_string()));
        assert!(!report.merged);

        // No partial commit, no merge state, session untouched.
        assert_eq!(commit_count(&f.repo, "main"), main_commits_before);
        assert_eq!(current_branch_of(&f.repo), "main");
        assert!(
            run_git_sync(&f.repo, &["rev-parse", "-q", "--verify", "MERGE_HEAD"]).is_err()
        );
        assert!(session.path.exists());
        assert!(!f.registry.load().unwrap().sessions.is_empty());
        assert!(f.sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_merge_attempts_on_one_session_fail_fast() {
        let f = fixture();
        let session = f.service.create_session("s10", Some("main")).await.unwrap();
        commit_file(&session.path, "work.txt", "w\n", "work");

        let _held = try_acquire_merge_lock(&session.id).unwrap();
        let outcome = f
            .engine
            .integrate_session(&session, &MergeOptions::default())
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("already running"));
    }

    #[tokio::test]
    async fn merge_commit_strategy_keeps_branch_history() {
        let f = fixture();
        let session = f.service.create_session("s11", Some("main")).await.unwrap();
        commit_file(&session.path, "a.txt", "a\n", "session commit a");
        commit_file(&session.path, "b.txt", "b\n", "session commit b");

        let opts = MergeOptions {
            strategy: MergeStrategy::Merge,
            ..MergeOptions::default()
        };
        let outcome = f.engine.integrate_session(&session, &opts).await;
        assert!(outcome.success, "merge failed: {:?}", outcome.error);

        // A merge commit has two parents.
        let parents = run_git_sync(&f.repo, &["rev-list", "--parents", "-1", "HEAD"]).unwrap();
        assert_eq!(parents.split_whitespace().count(), 3);
    }

    #[tokio::test]
    async fn change_helpers_treat_empty_states_as_success() {
        let f = fixture();
        let session = f.service.create_session("s12", Some("main")).await.unwrap();

        // Nothing to commit, nothing to stash, nothing to pop.
        let committed = commit_changes(&session.path, "noop");
        assert!(committed.success);
        assert!(committed.commit.is_none());
        assert!(stash_changes(&session.path).success);
        assert!(unstash_changes(&session.path).success);

        // Real content round-trips through all three helpers.
        std::fs::write(session.path.join("wip.txt"), "wip\n").unwrap();
        assert!(stash_changes(&session.path).success);
        assert!(!session.path.join("wip.txt").exists());
        assert!(unstash_changes(&session.path).success);
        assert!(session.path.join("wip.txt").exists());

        let committed = commit_changes(&session.path, "add wip");
        assert!(committed.success);
        assert!(committed.commit.is_some());

        std::fs::write(session.path.join("wip.txt"), "dirty again\n").unwrap();
        assert!(discard_changes(&session.path).success);
        assert_eq!(
            std::fs::read_to_string(session.path.join("wip.txt")).unwrap(),
            "wip\n"
        );
    }
}
