use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use log::{debug, warn};

use crate::domains::git::repository::{commits_ahead_of, is_dirty, main_branch};
use crate::domains::sessions::entity::{Phase, Session};
use crate::shared::cache::GitStateCache;

/// Pure phase rule: no commits ahead means the session has not started,
/// regardless of scratch files in the tree.
pub fn determine_phase(commits_ahead: u32, dirty: bool) -> Phase {
    if commits_ahead == 0 {
        Phase::Todo
    } else if dirty {
        Phase::Coding
    } else {
        Phase::Review
    }
}

/// Derives session phases from live repository state. Results are memoized
/// under `phase:<worktree>` with the cache's short TTL; phases are never
/// written anywhere else.
pub struct PhaseDetector {
    cache: Arc<GitStateCache>,
    main_branch_candidates: Vec<String>,
}

impl PhaseDetector {
    pub fn new(cache: Arc<GitStateCache>, main_branch_candidates: Vec<String>) -> Self {
        Self {
            cache,
            main_branch_candidates,
        }
    }

    pub async fn phase_of(&self, session: &Session) -> Phase {
        if session.merged_at.is_some() || session.is_main {
            return Phase::Merged;
        }
        if !session.path.exists() {
            return Phase::Todo;
        }

        let key = GitStateCache::key("phase", &session.path);
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(phase) = Phase::from_str(&cached) {
                return phase;
            }
        }

        let phase = match self.derive(session).await {
            Ok(phase) => phase,
            Err(err) => {
                // An error mid-derivation means the checkout is in some
                // intermediate state; assume active work.
                warn!(
                    "phase derivation failed for session '{}': {err}",
                    session.display_name()
                );
                Phase::Coding
            }
        };

        self.cache.set(&key, phase.as_str().to_string());
        phase
    }

    async fn derive(&self, session: &Session) -> Result<Phase> {
        let base = main_branch(&session.path, &self.main_branch_candidates, &self.cache).await?;
        let commits_ahead = commits_ahead_of(&session.path, &base).await;
        let dirty = is_dirty(&session.path).await;
        debug!(
            "session '{}': {commits_ahead} commit(s) ahead of {base}, dirty={dirty}",
            session.display_name()
        );
        Ok(determine_phase(commits_ahead, dirty))
    }

    /// Fan-out/fan-in phase derivation for a batch of sessions. Each
    /// worktree is an independent checkout, so the queries run concurrently;
    /// output order always matches input order.
    pub async fn phases_for(&self, sessions: Vec<Session>) -> Vec<(Session, Phase)> {
        let lookups = sessions.into_iter().map(|session| async move {
            let phase = self.phase_of(&session).await;
            (session, phase)
        });
        join_all(lookups).await
    }
}
