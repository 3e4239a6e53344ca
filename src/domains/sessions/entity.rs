use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of parallel work bound to a worktree+branch pair. The registry
/// collaborator owns the canonical record; everything else about a session
/// (its phase in particular) is derived from live repository state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Worktree path, or the repository path for the main session.
    pub path: PathBuf,
    pub branch: String,
    pub nickname: Option<String>,
    /// Exactly one session is the primary checkout; it is never deleted
    /// and never merged.
    pub is_main: bool,
    pub thread_type: ThreadType,
    pub created_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
    /// Present once the session's branch has been merged back; terminal.
    pub merged_at: Option<DateTime<Utc>>,
    /// External work-item reference, display-only.
    pub story: Option<String>,
}

impl Session {
    pub fn new_worktree(path: PathBuf, branch: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path,
            branch,
            nickname: None,
            is_main: false,
            thread_type: ThreadType::Base,
            created_at: Utc::now(),
            last_active: None,
            merged_at: None,
            story: None,
        }
    }

    pub fn new_main(path: PathBuf, branch: String) -> Self {
        Self {
            is_main: true,
            ..Self::new_worktree(path, branch)
        }
    }

    /// A session only counts as live while its checkout is on disk.
    pub fn is_live(&self) -> bool {
        self.path.exists()
    }

    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.id)
    }
}

/// Collaboration pattern of a session. Transitions between thread types are
/// sanctioned by the state machine in `transitions`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ThreadType {
    Base,
    Parallel,
    Chained,
    Fusion,
    Big,
    Long,
}

impl ThreadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadType::Base => "base",
            ThreadType::Parallel => "parallel",
            ThreadType::Chained => "chained",
            ThreadType::Fusion => "fusion",
            ThreadType::Big => "big",
            ThreadType::Long => "long",
        }
    }
}

impl FromStr for ThreadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(ThreadType::Base),
            "parallel" => Ok(ThreadType::Parallel),
            "chained" => Ok(ThreadType::Chained),
            "fusion" => Ok(ThreadType::Fusion),
            "big" => Ok(ThreadType::Big),
            "long" => Ok(ThreadType::Long),
            _ => Err(format!("Invalid thread type: {s}")),
        }
    }
}

impl std::fmt::Display for ThreadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kanban-style phase, derived from repository state and never stored as
/// ground truth.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Todo,
    Coding,
    Review,
    Merged,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Todo => "todo",
            Phase::Coding => "coding",
            Phase::Review => "review",
            Phase::Merged => "merged",
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Phase::Todo),
            "coding" => Ok(Phase::Coding),
            "review" => Ok(Phase::Review),
            "merged" => Ok(Phase::Merged),
            _ => Err(format!("Invalid phase: {s}")),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status used by the status machine instantiation; the surrounding
/// task feature lives outside this crate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ready,
    InProgress,
    InReview,
    Blocked,
    Completed,
    Archived,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::InReview => "in_review",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
