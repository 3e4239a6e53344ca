use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{info, warn};

use crate::config::OrchestratorConfig;
use crate::domains::git::worktrees::WorktreeManager;
use crate::domains::sessions::entity::{Phase, Session, ThreadType};
use crate::domains::sessions::naming::find_unique_session_name;
use crate::domains::sessions::phases::PhaseDetector;
use crate::domains::sessions::registry::SessionRegistry;
use crate::domains::sessions::transitions::{thread_type_machine, transition_thread_type};
use crate::shared::cache::GitStateCache;
use crate::shared::state_machine::{StateMachine, TransitionOutcome};

/// Front door for session lifecycle outside of merging: creation with
/// bounded-time worktree provisioning, thread-type transitions, and
/// phase-annotated listings.
pub struct SessionService {
    repo_path: PathBuf,
    registry: Arc<dyn SessionRegistry>,
    cache: Arc<GitStateCache>,
    worktrees: WorktreeManager,
    detector: PhaseDetector,
    thread_types: StateMachine<ThreadType>,
    config: OrchestratorConfig,
}

impl SessionService {
    pub fn new(
        repo_path: PathBuf,
        registry: Arc<dyn SessionRegistry>,
        cache: Arc<GitStateCache>,
        config: OrchestratorConfig,
    ) -> Self {
        let worktrees = WorktreeManager::new(repo_path.clone());
        let detector = PhaseDetector::new(cache.clone(), config.main_branch_candidates.clone());
        Self {
            repo_path,
            registry,
            cache,
            worktrees,
            detector,
            thread_types: thread_type_machine(),
            config,
        }
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub fn detector(&self) -> &PhaseDetector {
        &self.detector
    }

    /// Creates a session: allocates a unique name/branch/worktree triple,
    /// provisions the worktree under the configured deadline, and registers
    /// the record. Any provisioning failure tears down partial state before
    /// surfacing the error.
    pub async fn create_session(&self, name_hint: &str, base: Option<&str>) -> Result<Session> {
        let snapshot = self.registry.load()?;
        let worktree_root = self.config.worktree_root(&self.repo_path);
        let (name, branch, worktree_path) = find_unique_session_name(
            &self.repo_path,
            &worktree_root,
            &snapshot,
            &self.config.branch_prefix,
            name_hint,
        )?;

        info!("creating session '{name}' on branch '{branch}'");
        let created = self
            .worktrees
            .create_with_timeout(
                &worktree_path,
                &branch,
                base,
                self.config.worktree_timeout(),
            )
            .await;

        if let Err(err) = created {
            self.worktrees
                .cleanup_failed_worktree(&worktree_path, &branch, true);
            return Err(anyhow!(err)).context(format!("could not create session '{name}'"));
        }

        let mut session = Session::new_worktree(worktree_path, branch);
        session.nickname = Some(name);
        session.last_active = Some(Utc::now());

        let mut snapshot = self.registry.load()?;
        snapshot.sessions.insert(session.id.clone(), session.clone());
        self.registry.save(&snapshot)?;

        Ok(session)
    }

    /// Moves a session to a new thread type if the machine sanctions it,
    /// persisting the record on success.
    pub fn change_thread_type(
        &self,
        session_id: &str,
        to: ThreadType,
        force: bool,
    ) -> Result<TransitionOutcome<ThreadType>> {
        let mut snapshot = self.registry.load()?;
        let session = snapshot
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("session '{session_id}' not found"))?;

        let outcome = transition_thread_type(&self.thread_types, session, to, force);
        if outcome.success && !outcome.noop {
            session.last_active = Some(Utc::now());
            self.registry.save(&snapshot)?;
        }
        Ok(outcome)
    }

    /// Every registered session annotated with its derived phase, in
    /// registry iteration order stabilized by creation time.
    pub async fn sessions_with_phases(&self) -> Result<Vec<(Session, Phase)>> {
        let snapshot = self.registry.load()?;
        let mut sessions: Vec<Session> = snapshot.sessions.into_values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(self.detector.phases_for(sessions).await)
    }

    /// Removes managed worktrees no registered session points at, then
    /// drops stale phase cache entries for whatever was removed.
    pub fn sweep_orphaned_worktrees(&self) -> Result<()> {
        let snapshot = self.registry.load()?;
        let live: Vec<PathBuf> = snapshot
            .sessions
            .values()
            .filter(|s| !s.is_main)
            .map(|s| s.path.clone())
            .collect();
        let root = self.config.worktree_root(&self.repo_path);
        self.worktrees.cleanup_orphaned_worktrees(&root, &live);
        self.cache.invalidate(None);
        Ok(())
    }

    /// Marks activity on a session; failures to persist are logged, not
    /// surfaced, since this is bookkeeping.
    pub fn touch(&self, session_id: &str) {
        let result = (|| -> Result<()> {
            let mut snapshot = self.registry.load()?;
            if let Some(session) = snapshot.sessions.get_mut(session_id) {
                session.last_active = Some(Utc::now());
                self.registry.save(&snapshot)?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            warn!("could not record activity for session '{session_id}': {err}");
        }
    }
}
