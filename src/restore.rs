//! # Restore Service
//!
//! Resolves a snapshot via [`crate::snapshot::SnapshotService`], checks
//! target-directory space and conflicts, then drives
//! [`crate::repository::Repository::restore`] to stream the engine's own
//! restore. Unlike the orchestrator, restore failures are reported inside
//! [`RestoreResult`] rather than as `Err` — callers collect errors/warnings
//! from one value instead of matching on a `Result`.

use crate::error::RestoreError;
use crate::repository::{EngineEvent, Repository};
use crate::security::SecurityService;
use crate::snapshot::{Snapshot, SnapshotService};
use crate::status::{OperationStatus, OperationStatusStore, OperationType, StatusLevel};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolution {
    #[default]
    Overwrite,
    Skip,
    Prompt,
    Rename,
}

type ProgressCallback = Box<dyn FnMut(&str, u64, u64)>;

/// Builder-style restore options, mirroring the repository's own
/// include/exclude vocabulary rather than file-selection patterns — a
/// restore targets what's already in a snapshot, not the filesystem.
#[derive(Default)]
pub struct RestoreOptions {
    pub target_path: Option<PathBuf>,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub conflict_resolution: ConflictResolution,
    pub verify_after_restore: bool,
    pub dry_run: bool,
    progress_callback: Option<ProgressCallback>,
}

impl RestoreOptions {
    pub fn new() -> Self {
        Self { verify_after_restore: true, ..Default::default() }
    }

    pub fn with_target_path(mut self, target_path: impl Into<PathBuf>) -> Self {
        self.target_path = Some(target_path.into());
        self
    }

    pub fn with_include_paths(mut self, paths: Vec<String>) -> Self {
        self.include_paths = paths;
        self
    }

    pub fn with_exclude_paths(mut self, paths: Vec<String>) -> Self {
        self.exclude_paths = paths;
        self
    }

    pub fn with_conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify_after_restore = verify;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_progress_callback(mut self, callback: impl FnMut(&str, u64, u64) + 'static) -> Self {
        self.progress_callback = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreResult {
    pub success: bool,
    pub snapshot_id: String,
    pub target_path: Option<PathBuf>,
    pub files_restored: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub bytes_restored: u64,
    pub duration_seconds: f64,
    pub verification_passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl RestoreResult {
    fn failed(snapshot_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self { snapshot_id: snapshot_id.into(), errors: vec![error.into()], ..Default::default() }
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.success = false;
        self.errors.push(error.into());
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

pub struct RestoreService {
    security: SecurityService,
    status: OperationStatusStore,
}

impl RestoreService {
    pub fn new(config_dir: impl Into<PathBuf> + Clone) -> Self {
        Self { security: SecurityService::new(config_dir.clone()), status: OperationStatusStore::new(config_dir) }
    }

    pub fn restore_latest_snapshot(
        &mut self,
        repository: &Repository,
        snapshots: &mut SnapshotService,
        options: RestoreOptions,
    ) -> RestoreResult {
        match snapshots.get_latest_snapshot(repository, None) {
            Ok(Some(snapshot)) => self.restore_resolved(repository, snapshot, options),
            Ok(None) => RestoreResult::failed("", "no snapshots found in repository"),
            Err(e) => RestoreResult::failed("", e.to_string()),
        }
    }

    pub fn restore_snapshot(
        &mut self,
        repository: &Repository,
        snapshots: &mut SnapshotService,
        snapshot_id: &str,
        options: RestoreOptions,
    ) -> RestoreResult {
        let snapshot = match snapshots.get_snapshot_by_id(repository, snapshot_id) {
            Ok(s) => s,
            Err(e) => return RestoreResult::failed(snapshot_id, e.to_string()),
        };
        self.restore_resolved(repository, snapshot, options)
    }

    fn restore_resolved(
        &mut self,
        repository: &Repository,
        snapshot: Snapshot,
        mut options: RestoreOptions,
    ) -> RestoreResult {
        let started = Instant::now();
        let mut result = RestoreResult { snapshot_id: snapshot.id.clone(), success: true, ..Default::default() };

        let Some(mut target) = options.target_path.clone() else {
            result.add_error("target path is required");
            return result;
        };

        self.prepare_target(&target, &options, &mut result);

        if let ConflictResolution::Rename = options.conflict_resolution {
            if target.exists() {
                target = target.with_file_name(format!(
                    "{}-{}",
                    target.file_name().and_then(|n| n.to_str()).unwrap_or("restore"),
                    Utc::now().format("%Y%m%dT%H%M%S"),
                ));
            }
        }
        result.target_path = Some(target.clone());

        if let Err(e) = check_free_space(&target, snapshot.stats.total_size) {
            result.add_error(e.to_string());
            return result;
        }

        if options.dry_run {
            result.duration_seconds = started.elapsed().as_secs_f64();
            return result;
        }

        if let Err(e) = std::fs::create_dir_all(&target) {
            result.add_error(format!("failed to create target directory: {e}"));
            return result;
        }

        let operation_id = uuid::Uuid::new_v4().to_string();
        let mut op_status =
            OperationStatus::start(operation_id.clone(), OperationType::Restore, Some(repository.id().to_string()));
        let _ = self.status.track(op_status.clone());

        let total_files = snapshot.stats.total_files.max(1);
        let mut files_done = 0u64;
        let run_result = repository.restore(
            &snapshot.id,
            &target,
            &options.include_paths,
            &options.exclude_paths,
            |event| {
                if let EngineEvent::Status(s) = event {
                    files_done = s.files_done;
                    op_status.update_progress(s.percent_done * 100.0, s.files_done, s.total_files);
                    if let Some(cb) = options.progress_callback.as_mut() {
                        cb("restoring", s.files_done, total_files);
                    }
                }
            },
        );

        match run_result {
            Ok(()) => {
                result.files_restored = files_done;
                result.bytes_restored = snapshot.stats.total_size;
                op_status.complete(StatusLevel::Success, "restore completed");
                self.security.audit_restore_operation(repository, true, &snapshot.id);
            }
            Err(e) => {
                op_status.complete(StatusLevel::Error, e.to_string());
                self.security.audit_restore_operation(repository, false, &snapshot.id);
                result.files_failed = total_files - files_done;
                result.add_error(e.to_string());
            }
        }
        let _ = self.status.archive(&operation_id);

        if result.success && options.verify_after_restore {
            match repository.verify_backup_comprehensive(Some(&snapshot.id)) {
                Ok(report) => {
                    result.verification_passed = report.success;
                    for warning in report.warnings {
                        result.add_warning(warning);
                    }
                }
                Err(e) => {
                    result.verification_passed = false;
                    result.add_warning(format!("verification failed: {e}"));
                }
            }
        }

        result.duration_seconds = started.elapsed().as_secs_f64();
        result
    }

    /// Applies conflict-resolution policy against an existing, non-empty
    /// target directory. Does not touch the filesystem for `dry_run`.
    fn prepare_target(&self, target: &std::path::Path, options: &RestoreOptions, result: &mut RestoreResult) {
        let exists_and_nonempty = target.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false);

        if !exists_and_nonempty {
            return;
        }

        match options.conflict_resolution {
            ConflictResolution::Overwrite | ConflictResolution::Rename => {}
            ConflictResolution::Skip => {
                result.add_warning("target directory is not empty; continuing per skip policy");
            }
            ConflictResolution::Prompt => {
                result.add_warning("prompt conflict resolution requires an interactive callback; downgraded to skip");
            }
        }
    }
}

fn check_free_space(target: &std::path::Path, needed: u64) -> Result<(), RestoreError> {
    let probe = target.ancestors().find(|p| p.exists()).unwrap_or(target);
    let available = fs4::available_space(probe).unwrap_or(u64::MAX);
    if available < needed {
        return Err(RestoreError::InsufficientSpace { needed, available });
    }
    Ok(())
}

/// Compares two snapshots and returns the differences between them.
pub fn diff_snapshots(older: &Snapshot, newer: &Snapshot) -> SnapshotDiff {
    let mut diff = SnapshotDiff::default();

    for path in newer.paths.difference(&older.paths) {
        diff.added.push(path.clone());
    }
    for path in older.paths.difference(&newer.paths) {
        diff.removed.push(path.clone());
    }

    diff
}

/// Path-level differences between two snapshots. The engine doesn't expose
/// per-file hashes to this layer, so "modified" can't be distinguished from
/// "added"/"removed" without re-reading file contents — this only reports
/// what's present in one snapshot's path set and not the other.
#[derive(Debug, Default)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    pub fn print_summary(&self) {
        use colored::Colorize;
        if !self.has_changes() {
            eprintln!("  No changes.");
            return;
        }
        if !self.added.is_empty() {
            eprintln!("  {} {} paths added", "+".green(), self.added.len());
        }
        if !self.removed.is_empty() {
            eprintln!("  {} {} paths removed", "-".red(), self.removed.len());
        }
    }
}

/// Prints a colored summary of a completed restore.
pub fn print_restore_summary(result: &RestoreResult) {
    use colored::Colorize;
    eprintln!();
    if result.success {
        eprintln!("  {} Restore complete", "✓".green());
    } else {
        eprintln!("  {} Restore failed", "✗".red());
    }
    eprintln!("    Snapshot:    {}", result.snapshot_id.bold());
    if let Some(target) = &result.target_path {
        eprintln!("    Target:      {}", target.display());
    }
    eprintln!(
        "    Files:       {} restored, {} skipped, {} failed",
        result.files_restored, result.files_skipped, result.files_failed,
    );
    eprintln!("    Data:        {}", crate::backup::format_size(result.bytes_restored));
    eprintln!("    Duration:    {:.2}s", result.duration_seconds);
    if result.success {
        eprintln!("    Verified:    {}", result.verification_passed);
    }
    for warning in &result.warnings {
        eprintln!("    {} {}", "warn:".yellow(), warning);
    }
    for error in &result.errors {
        eprintln!("    {} {}", "error:".red(), error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotStats;
    use std::collections::BTreeSet;

    fn snap(id: &str, paths: &[&str]) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            timestamp: Utc::now(),
            paths: paths.iter().map(|s| s.to_string()).collect(),
            tags: BTreeSet::new(),
            stats: SnapshotStats::default(),
        }
    }

    #[test]
    fn diff_reports_added_and_removed_paths() {
        let older = snap("s1", &["/a", "/b"]);
        let newer = snap("s2", &["/b", "/c"]);
        let diff = diff_snapshots(&older, &newer);
        assert_eq!(diff.added, vec!["/c".to_string()]);
        assert_eq!(diff.removed, vec!["/a".to_string()]);
    }

    #[test]
    fn missing_target_path_is_an_error() {
        let mut result = RestoreResult { snapshot_id: "abc".to_string(), success: true, ..Default::default() };
        result.add_error("target path is required");
        assert!(!result.success);
        assert_eq!(result.errors[0], "target path is required");
    }

    #[test]
    fn default_conflict_resolution_is_overwrite() {
        assert_eq!(RestoreOptions::new().conflict_resolution, ConflictResolution::Overwrite);
    }
}
