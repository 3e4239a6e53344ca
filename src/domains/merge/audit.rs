use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::debug;

use crate::domains::merge::types::{MergeAuditRecord, MergeNotification};

/// Side channel announcing the most recent merge to other processes.
/// Injectable so tests can assert on what would have been written; the
/// engine swallows sink failures.
pub trait NotificationSink: Send + Sync {
    fn notify_merge(&self, notification: &MergeNotification) -> Result<()>;
}

/// Bounded log of merge records with their resolution plans.
pub trait AuditSink: Send + Sync {
    fn record_merge(&self, record: &MergeAuditRecord) -> Result<()>;
}

/// Default sink: does nothing, reports success.
#[derive(Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify_merge(&self, _notification: &MergeNotification) -> Result<()> {
        Ok(())
    }
}

impl AuditSink for NoopSink {
    fn record_merge(&self, _record: &MergeAuditRecord) -> Result<()> {
        Ok(())
    }
}

/// Writes the latest merge notification as a single JSON record at a
/// well-known path, for other sessions to poll.
pub struct FileNotificationSink {
    path: PathBuf,
}

impl FileNotificationSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl NotificationSink for FileNotificationSink {
    fn notify_merge(&self, notification: &MergeNotification) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("could not create {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(notification)?;
        std::fs::write(&self.path, body)
            .with_context(|| format!("could not write {}", self.path.display()))?;
        debug!("merge notification written to {}", self.path.display());
        Ok(())
    }
}

/// JSON-array audit log capped at the most recent `cap` merges.
pub struct FileAuditLog {
    path: PathBuf,
    cap: usize,
}

impl FileAuditLog {
    pub fn new(path: PathBuf, cap: usize) -> Self {
        Self { path, cap }
    }

    fn read_records(&self) -> Vec<MergeAuditRecord> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }
}

impl AuditSink for FileAuditLog {
    fn record_merge(&self, record: &MergeAuditRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("could not create {}", parent.display()))?;
        }
        let mut records = self.read_records();
        records.push(record.clone());
        if records.len() > self.cap {
            let drop_count = records.len() - self.cap;
            records.drain(..drop_count);
        }
        let body = serde_json::to_string_pretty(&records)?;
        std::fs::write(&self.path, body)
            .with_context(|| format!("could not write {}", self.path.display()))?;
        Ok(())
    }
}

/// Records everything in memory; the test double for both sinks.
#[derive(Default)]
pub struct MemorySink {
    pub notifications: Mutex<Vec<MergeNotification>>,
    pub records: Mutex<Vec<MergeAuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationSink for MemorySink {
    fn notify_merge(&self, notification: &MergeNotification) -> Result<()> {
        self.notifications
            .lock()
            .expect("sink mutex poisoned")
            .push(notification.clone());
        Ok(())
    }
}

impl AuditSink for MemorySink {
    fn record_merge(&self, record: &MergeAuditRecord) -> Result<()> {
        self.records
            .lock()
            .expect("sink mutex poisoned")
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: &str) -> MergeAuditRecord {
        MergeAuditRecord {
            session_id: id.to_string(),
            started_at: Utc::now(),
            merged_at: Utc::now(),
            resolutions: Vec::new(),
        }
    }

    #[test]
    fn notification_file_holds_latest_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".gleiswerk/merge-notification.json");
        let sink = FileNotificationSink::new(path.clone());

        for (id, branch) in [("s1", "gleiswerk/one"), ("s2", "gleiswerk/two")] {
            sink.notify_merge(&MergeNotification {
                timestamp: Utc::now(),
                session_id: id.to_string(),
                branch: branch.to_string(),
                strategy: "squash".to_string(),
                message: "merged".to_string(),
            })
            .unwrap();
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        let latest: MergeNotification = serde_json::from_str(&raw).unwrap();
        assert_eq!(latest.session_id, "s2");
        assert_eq!(latest.branch, "gleiswerk/two");
    }

    #[test]
    fn audit_log_keeps_only_most_recent_records() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("merge-audit.json");
        let log = FileAuditLog::new(path.clone(), 50);

        for i in 0..55 {
            log.record_merge(&record(&format!("s{i}"))).unwrap();
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        let records: Vec<MergeAuditRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(records.len(), 50);
        assert_eq!(records[0].session_id, "s5");
        assert_eq!(records[49].session_id, "s54");
    }

    #[test]
    fn corrupt_audit_log_starts_over_instead_of_failing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("merge-audit.json");
        std::fs::write(&path, "not json").unwrap();
        let log = FileAuditLog::new(path.clone(), 50);

        log.record_merge(&record("fresh")).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let records: Vec<MergeAuditRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn memory_sink_captures_for_assertions() {
        let sink = MemorySink::new();
        sink.record_merge(&record("s1")).unwrap();
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }
}
