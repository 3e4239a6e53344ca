use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::domains::sessions::entity::Session;

/// Snapshot of the canonical session records, exchanged whole with the
/// registry collaborator (last-write-wins).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub sessions: HashMap<String, Session>,
}

impl RegistrySnapshot {
    pub fn main_session(&self) -> Option<&Session> {
        self.sessions.values().find(|s| s.is_main)
    }

    pub fn worktree_sessions(&self) -> Vec<&Session> {
        self.sessions.values().filter(|s| !s.is_main).collect()
    }
}

/// Narrow contract to the external session store. This crate never assumes
/// multi-writer coordination beyond what the implementation provides.
pub trait SessionRegistry: Send + Sync {
    fn load(&self) -> Result<RegistrySnapshot>;
    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()>;
    fn remove_lock(&self, session_id: &str) -> Result<()>;
    fn unregister(&self, session_id: &str) -> Result<()>;
}

/// Registry backed by process memory, for tests and embedders without a
/// store of their own.
#[derive(Default)]
pub struct InMemoryRegistry {
    snapshot: Mutex<RegistrySnapshot>,
    locks: Mutex<HashSet<String>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        let mut guard = self.snapshot.lock().expect("registry mutex poisoned");
        guard.sessions.insert(session.id.clone(), session);
    }

    pub fn acquire_lock(&self, session_id: &str) {
        let mut locks = self.locks.lock().expect("registry mutex poisoned");
        locks.insert(session_id.to_string());
    }

    pub fn has_lock(&self, session_id: &str) -> bool {
        let locks = self.locks.lock().expect("registry mutex poisoned");
        locks.contains(session_id)
    }
}

impl SessionRegistry for InMemoryRegistry {
    fn load(&self) -> Result<RegistrySnapshot> {
        Ok(self.snapshot.lock().expect("registry mutex poisoned").clone())
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        *self.snapshot.lock().expect("registry mutex poisoned") = snapshot.clone();
        Ok(())
    }

    fn remove_lock(&self, session_id: &str) -> Result<()> {
        let mut locks = self.locks.lock().expect("registry mutex poisoned");
        locks.remove(session_id);
        Ok(())
    }

    fn unregister(&self, session_id: &str) -> Result<()> {
        let mut guard = self.snapshot.lock().expect("registry mutex poisoned");
        guard.sessions.remove(session_id);
        Ok(())
    }
}
