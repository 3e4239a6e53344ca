use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables for one orchestrator instance, threaded explicitly through the
/// services that need them. Loadable from a TOML file; every field has a
/// default so partial files work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory under the repository root holding managed worktrees.
    pub worktree_dir: String,
    /// Prefix for session branches (`<prefix>/<session-name>`).
    pub branch_prefix: String,
    /// Candidates tried when origin has no HEAD symref.
    pub main_branch_candidates: Vec<String>,
    pub cache_ttl_secs: u64,
    pub worktree_timeout_secs: u64,
    pub merge_timeout_secs: u64,
    /// Most recent merge records kept in the audit log.
    pub audit_log_cap: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worktree_dir: ".gleiswerk/worktrees".to_string(),
            branch_prefix: "gleiswerk".to_string(),
            main_branch_candidates: vec!["main".to_string(), "master".to_string()],
            cache_ttl_secs: 10,
            worktree_timeout_secs: 120,
            merge_timeout_secs: 180,
            audit_log_cap: 50,
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config at {}", path.display()))
    }

    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("falling back to default config: {err}");
                Self::default()
            }
        }
    }

    pub fn worktree_root(&self, repo_path: &Path) -> PathBuf {
        repo_path.join(&self.worktree_dir)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn worktree_timeout(&self) -> Duration {
        Duration::from_secs(self.worktree_timeout_secs)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }
}
