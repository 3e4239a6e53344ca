use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a session's commits land on the target branch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Squash,
    Merge,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Squash => "squash",
            MergeStrategy::Merge => "merge",
        }
    }
}

/// Machine-checkable reason a merge cannot proceed right now.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    MainSession,
    AlreadyMerged,
    MissingWorktree,
    UncommittedChanges,
    NoChanges,
    Conflicts,
    ProbeFailed,
    MergeInProgress,
}

/// Outcome of the mergeability probe. `has_conflicts` is only meaningful
/// when the dry run actually ran (no earlier precondition failed).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mergeability {
    pub mergeable: bool,
    pub has_conflicts: bool,
    pub commits_ahead: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BlockReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Mergeability {
    pub fn blocked(reason: BlockReason, detail: impl Into<String>) -> Self {
        Self {
            mergeable: false,
            has_conflicts: false,
            commits_ahead: 0,
            reason: Some(reason),
            detail: Some(detail.into()),
        }
    }

    pub fn clean(commits_ahead: u32) -> Self {
        Self {
            mergeable: true,
            has_conflicts: false,
            commits_ahead,
            reason: None,
            detail: None,
        }
    }

    pub fn conflicted(commits_ahead: u32, detail: impl Into<String>) -> Self {
        Self {
            mergeable: false,
            has_conflicts: true,
            commits_ahead,
            reason: Some(BlockReason::Conflicts),
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub hash: String,
    pub subject: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedFile {
    pub path: String,
    pub change_type: String,
}

/// Read-only summary of what a merge would bring in.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePreview {
    pub session_branch: String,
    pub target_branch: String,
    pub commits: Vec<CommitSummary>,
    pub commit_count: usize,
    pub files: Vec<ChangedFile>,
    pub file_count: usize,
    pub default_commit_message: String,
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub delete_branch: bool,
    pub delete_worktree: bool,
    pub message: Option<String>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Squash,
            delete_branch: true,
            delete_worktree: true,
            message: None,
        }
    }
}

/// Result of `integrate_session`. Teardown steps report independently so a
/// partial teardown after a successful merge is still observable; a failed
/// deletion never turns an already-merged session into an overall failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationOutcome {
    pub success: bool,
    pub merged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_commit: Option<String>,
    pub conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unregistered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IntegrationOutcome {
    pub fn failure(error: impl Into<String>, conflict: bool) -> Self {
        Self {
            success: false,
            merged: false,
            new_commit: None,
            conflict,
            worktree_deleted: None,
            branch_deleted: None,
            unregistered: None,
            error: Some(error.into()),
        }
    }
}

/// Conflict-file classification, in categorization priority order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Docs,
    Test,
    Schema,
    Config,
    Source,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Docs => "docs",
            FileCategory::Test => "test",
            FileCategory::Schema => "schema",
            FileCategory::Config => "config",
            FileCategory::Source => "source",
        }
    }
}

/// Per-category resolution policy applied during a smart merge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep both sides' lines; additive content never silently drops.
    Union,
    /// Incoming branch wins.
    Theirs,
    /// Target branch wins.
    Ours,
    /// Defer to the three-way driver; falls back to the incoming version.
    Recursive,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Union => "union",
            ResolutionStrategy::Theirs => "theirs",
            ResolutionStrategy::Ours => "ours",
            ResolutionStrategy::Recursive => "recursive",
        }
    }
}

/// One entry of a conflict resolution plan, produced from the set of files
/// changed on both sides since the merge-base and consumed immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedResolution {
    pub file: String,
    pub category: FileCategory,
    pub strategy: ResolutionStrategy,
    pub description: String,
}

/// Per-file application result; never partial or silent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResolution {
    pub file: String,
    pub category: FileCategory,
    pub strategy: ResolutionStrategy,
    pub success: bool,
    /// True when the incoming version was taken because the configured
    /// strategy could not complete.
    pub fallback_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartMergeReport {
    pub success: bool,
    pub merged: bool,
    pub auto_resolved: Vec<String>,
    pub failed_files: Vec<String>,
    pub plan: Vec<PlannedResolution>,
    pub resolutions: Vec<FileResolution>,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration: Option<IntegrationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SmartMergeReport {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            merged: false,
            auto_resolved: Vec::new(),
            failed_files: Vec::new(),
            plan: Vec::new(),
            resolutions: Vec::new(),
            aborted: false,
            integration: None,
            error: Some(error.into()),
        }
    }
}

/// Record of the most recent merge, polled by other sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeNotification {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub branch: String,
    pub strategy: String,
    pub message: String,
}

/// Bounded audit entry for a smart merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeAuditRecord {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub merged_at: DateTime<Utc>,
    pub resolutions: Vec<PlannedResolution>,
}

/// Result shape of the standalone change helpers (commit/stash/discard).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChangeResult {
    pub fn ok(commit: Option<String>) -> Self {
        Self {
            success: true,
            commit,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            commit: None,
            error: Some(error.into()),
        }
    }
}
