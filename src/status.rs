//! # Operation Status
//!
//! Transient records tracking an in-flight backup/restore/verify, plus the
//! crash-recoverable persisted state the orchestrator consults on startup
//! (`status/operations.json`) and the append-only completed-operation log
//! (`status/history.jsonl`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Backup,
    Restore,
    Check,
    Prune,
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

impl StatusLevel {
    pub fn is_terminal(self) -> bool {
        matches!(self, StatusLevel::Success | StatusLevel::Warning | StatusLevel::Error | StatusLevel::Critical)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation_id: String,
    pub operation_type: OperationType,
    pub level: StatusLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub repository_id: Option<String>,
    pub progress_percent: Option<f64>,
    pub files_processed: Option<u64>,
    pub total_files: Option<u64>,
    pub bytes_processed: Option<u64>,
    pub total_bytes: Option<u64>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl OperationStatus {
    pub fn start(operation_id: impl Into<String>, operation_type: OperationType, repository_id: Option<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            operation_type,
            level: StatusLevel::Info,
            message: "started".to_string(),
            timestamp: Utc::now(),
            repository_id,
            progress_percent: Some(0.0),
            files_processed: None,
            total_files: None,
            bytes_processed: None,
            total_bytes: None,
            estimated_completion: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Progress updates must be non-decreasing in percent within a single
    /// operation — callers that violate this are treated as a bug and the
    /// update is rejected rather than silently accepted.
    pub fn update_progress(&mut self, percent: f64, files_processed: u64, total_files: u64) -> bool {
        if let Some(current) = self.progress_percent {
            if percent < current {
                return false;
            }
        }
        self.progress_percent = Some(percent);
        self.files_processed = Some(files_processed);
        self.total_files = Some(total_files);
        self.timestamp = Utc::now();
        true
    }

    pub fn complete(&mut self, level: StatusLevel, message: impl Into<String>) {
        self.level = level;
        self.message = message.into();
        self.progress_percent = Some(100.0);
        self.timestamp = Utc::now();
    }
}

/// Tracks in-progress operations (crash-recovery snapshot) and appends
/// completed ones to the history log.
pub struct OperationStatusStore {
    operations_path: PathBuf,
    history_path: PathBuf,
    in_progress: BTreeMap<String, OperationStatus>,
}

impl OperationStatusStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        Self {
            operations_path: config_dir.join("status").join("operations.json"),
            history_path: config_dir.join("status").join("history.jsonl"),
            in_progress: BTreeMap::new(),
        }
    }

    /// Loads any in-progress operations left behind by a crashed process.
    pub fn load(&mut self) -> std::io::Result<()> {
        if !self.operations_path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&self.operations_path)?;
        self.in_progress = serde_json::from_str(&content).unwrap_or_default();
        Ok(())
    }

    fn persist_operations(&self) -> std::io::Result<()> {
        if let Some(parent) = self.operations_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(&self.in_progress)?;
        let tmp = self.operations_path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.operations_path)?;
        Ok(())
    }

    pub fn track(&mut self, status: OperationStatus) -> std::io::Result<()> {
        self.in_progress.insert(status.operation_id.clone(), status);
        self.persist_operations()
    }

    pub fn get(&self, operation_id: &str) -> Option<&OperationStatus> {
        self.in_progress.get(operation_id)
    }

    /// Moves a completed operation out of the crash-recovery snapshot and
    /// into the append-only history log.
    pub fn archive(&mut self, operation_id: &str) -> std::io::Result<()> {
        if let Some(status) = self.in_progress.remove(operation_id) {
            self.persist_operations()?;

            if let Some(parent) = self.history_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let line = serde_json::to_string(&status)?;
            let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.history_path)?;
            use std::io::Write;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    pub fn history(&self, repository_id: Option<&str>, limit: usize) -> std::io::Result<Vec<OperationStatus>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.history_path)?;
        let mut entries: Vec<OperationStatus> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|s: &OperationStatus| {
                repository_id.is_none() || s.repository_id.as_deref() == repository_id
            })
            .collect();
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotonic() {
        let mut status = OperationStatus::start("op1", OperationType::Backup, None);
        assert!(status.update_progress(10.0, 1, 10));
        assert!(status.update_progress(50.0, 5, 10));
        assert!(!status.update_progress(20.0, 2, 10));
        assert_eq!(status.progress_percent, Some(50.0));
    }

    #[test]
    fn archive_moves_from_in_progress_to_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OperationStatusStore::new(dir.path());
        let mut status = OperationStatus::start("op1", OperationType::Backup, Some("repo1".to_string()));
        status.complete(StatusLevel::Success, "done");
        store.track(status).unwrap();
        assert!(store.get("op1").is_some());

        store.archive("op1").unwrap();
        assert!(store.get("op1").is_none());

        let history = store.history(Some("repo1"), 10).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn history_respects_limit_and_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = OperationStatusStore::new(dir.path());
        for i in 0..3 {
            let mut status = OperationStatus::start(format!("op{i}"), OperationType::Backup, None);
            status.complete(StatusLevel::Success, "done");
            store.track(status).unwrap();
            store.archive(&format!("op{i}")).unwrap();
        }
        let history = store.history(None, 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].operation_id, "op2");
    }
}
