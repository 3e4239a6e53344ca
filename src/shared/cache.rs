use std::path::Path;
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Short-TTL read-through cache in front of expensive repository queries
/// (current branch, main-branch detection, phase). Keys follow the
/// `"<kind>:<path>"` convention; one cache instance is shared by every
/// component that reads repository state, and components that mutate that
/// state invalidate the affected keys.
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
    ttl: Duration,
}

/// Cache instance used for git-derived strings (branch names, phases).
pub type GitStateCache = TtlCache<String>;

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn key(kind: &str, path: &Path) -> String {
        format!("{kind}:{}", path.display())
    }

    /// Returns the cached value, or `None` on miss or expiry. Expired
    /// entries are removed on the way out so the map does not accumulate
    /// stale state between reads.
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                if entry.stored_at.elapsed() < self.ttl {
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn set(&self, key: &str, value: V) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Clears one key, or the whole cache when no key is given.
    pub fn invalidate(&self, key: Option<&str>) {
        match key {
            Some(key) => {
                self.entries.remove(key);
            }
            None => self.entries.clear(),
        }
    }

    /// Drops every entry whose key refers to `path`, regardless of kind.
    /// Used after merges and worktree teardown, which change more than one
    /// memoized answer at once.
    pub fn invalidate_path(&self, path: &Path) {
        let suffix = format!(":{}", path.display());
        self.entries.retain(|key, _| !key.ends_with(&suffix));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn returns_stored_value_before_expiry() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60));
        cache.set("branch:/repo", "main".to_string());
        assert_eq!(cache.get("branch:/repo"), Some("main".to_string()));
    }

    #[test]
    fn expires_and_removes_stale_entries() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_millis(20));
        cache.set("phase:/repo", "coding".to_string());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("phase:/repo"), None);
        assert!(cache.is_empty(), "stale entry should be deleted on read");
    }

    #[test]
    fn missing_key_is_none() {
        let cache: TtlCache<String> = TtlCache::default();
        assert_eq!(cache.get("branch:/nowhere"), None);
    }

    #[test]
    fn invalidate_single_key_keeps_others() {
        let cache: TtlCache<String> = TtlCache::default();
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        cache.invalidate(Some("a"));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some("2".to_string()));
    }

    #[test]
    fn invalidate_all_clears_everything() {
        let cache: TtlCache<String> = TtlCache::default();
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        cache.invalidate(None);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_path_drops_every_kind_for_that_path() {
        let cache: TtlCache<String> = TtlCache::default();
        let repo = PathBuf::from("/repo");
        let other = PathBuf::from("/other");
        cache.set(&TtlCache::<String>::key("branch", &repo), "main".into());
        cache.set(&TtlCache::<String>::key("phase", &repo), "review".into());
        cache.set(&TtlCache::<String>::key("phase", &other), "todo".into());
        cache.invalidate_path(&repo);
        assert_eq!(cache.get(&TtlCache::<String>::key("branch", &repo)), None);
        assert_eq!(cache.get(&TtlCache::<String>::key("phase", &repo)), None);
        assert_eq!(
            cache.get(&TtlCache::<String>::key("phase", &other)),
            Some("todo".to_string())
        );
    }
}
