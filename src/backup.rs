//! # Backup Orchestrator
//!
//! Plans a backup from a repository and one or more file selections, applies
//! retry/backoff, invokes the snapshot engine through
//! [`crate::repository::Repository::backup_target`], and records status and
//! audit events. Progress bars and colored status lines are kept from the
//! teacher's CLI texture; the actual data-moving work belongs entirely to
//! the external engine — this module never reads file bytes itself.
//!
//! ## Algorithm
//!
//! 1. Resolve repository and targets (caller's responsibility; this module
//!    operates on already-resolved values).
//! 2. Require an effective password.
//! 3. Emit `backup_started` audit and an `info` operation status.
//! 4. Build the selection's engine args and invoke `backup_target`.
//! 5. Consume streaming status/summary events, updating progress.
//! 6. On success: audit + optional post-backup verification.
//! 7. On failure: classify, audit `backup_failed`, propagate.

use crate::error::{BackupError, RepositoryError, Result, TimeLockerError};
use crate::repository::{EngineEvent, Repository};
use crate::security::SecurityService;
use crate::selection::{FileSelection, SelectionEstimate};
use crate::status::{OperationStatus, OperationStatusStore, OperationType, StatusLevel};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation token, checked between engine status events.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct BackupResult {
    pub status: BackupStatus,
    pub repository_name: String,
    pub target_names: Vec<String>,
    pub snapshot_id: Option<String>,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub data_added: u64,
    pub duration: Duration,
    pub errors: Vec<String>,
}

/// A single named target: its file selection plus per-target tags. Ad-hoc
/// targets (not drawn from configuration) get a synthetic name by the
/// caller; this type doesn't distinguish the two.
pub struct BackupTarget {
    pub name: String,
    pub selection: FileSelection,
    pub tags: Vec<String>,
}

/// Describes one backup invocation.
pub struct BackupRequest {
    pub targets: Vec<BackupTarget>,
    pub tags: Vec<String>,
    pub dry_run: bool,
    pub verify_after_backup: bool,
}

pub struct BackupOrchestrator {
    security: SecurityService,
    status: OperationStatusStore,
}

impl BackupOrchestrator {
    pub fn new(config_dir: impl Into<PathBuf> + Clone) -> Self {
        Self {
            security: SecurityService::new(config_dir.clone()),
            status: OperationStatusStore::new(config_dir),
        }
    }

    pub fn execute_backup(
        &mut self,
        repository: &Repository,
        request: &BackupRequest,
        cancel: &CancellationToken,
    ) -> Result<BackupResult> {
        let target_names: Vec<String> = request.targets.iter().map(|t| t.name.clone()).collect();

        if repository.password()?.is_none() {
            return Err(BackupError::PasswordMissing(repository.id().to_string()).into());
        }

        let operation_id = uuid::Uuid::new_v4().to_string();
        let mut op_status =
            OperationStatus::start(operation_id.clone(), OperationType::Backup, Some(repository.id().to_string()));
        let _ = self.status.track(op_status.clone());
        self.security
            .audit_backup_operation(repository, "backup_started", Some(&target_names), true);

        if request.dry_run {
            op_status.complete(StatusLevel::Success, "dry run: no engine invocation");
            let _ = self.status.archive(&operation_id);
            return Ok(BackupResult {
                status: BackupStatus::Success,
                repository_name: repository.id().to_string(),
                target_names,
                snapshot_id: None,
                files_new: 0,
                files_changed: 0,
                files_unmodified: 0,
                data_added: 0,
                duration: Duration::from_secs(0),
                errors: Vec::new(),
            });
        }

        let mut tags = request.tags.clone();
        for target in &request.targets {
            target.selection.validate()?;
            tags.extend(target.tags.iter().cloned());
        }
        tags.sort();
        tags.dedup();

        let mut args = Vec::new();
        for target in &request.targets {
            args.extend(target.selection.to_engine_args());
        }

        let pb = create_progress_bar(&target_names);
        let mut stray_lines = Vec::new();
        let mut cancelled = false;
        let start = Instant::now();

        let run_result = repository.backup_target(&args, &tags, |event| {
            if cancel.is_cancelled() {
                cancelled = true;
                return;
            }
            match event {
                EngineEvent::Status(s) => {
                    pb.set_length(s.total_files.max(1));
                    pb.set_position(s.files_done);
                    op_status.update_progress(s.percent_done * 100.0, s.files_done, s.total_files);
                }
                EngineEvent::Other(raw) => {
                    if !raw.trim().is_empty() {
                        stray_lines.push(raw);
                    }
                }
                EngineEvent::Summary(_) => {}
            }
        });

        let duration = start.elapsed();

        if cancelled {
            pb.finish_and_clear();
            op_status.complete(StatusLevel::Warning, "cancelled");
            let _ = self.status.archive(&operation_id);
            self.security
                .audit_backup_operation(repository, "backup_cancelled", Some(&target_names), false);
            return Ok(BackupResult {
                status: BackupStatus::Warning,
                repository_name: repository.id().to_string(),
                target_names,
                snapshot_id: None,
                files_new: 0,
                files_changed: 0,
                files_unmodified: 0,
                data_added: 0,
                duration,
                errors: stray_lines,
            });
        }

        match run_result {
            Ok(summary) => {
                pb.finish_with_message("done");
                op_status.complete(StatusLevel::Success, "backup completed");
                let _ = self.status.archive(&operation_id);
                self.security
                    .audit_backup_operation(repository, "backup_completed", Some(&target_names), true);

                let mut status = BackupStatus::Success;
                if request.verify_after_backup {
                    let verified = self
                        .verify_backup_integrity(repository, summary.snapshot_id.as_deref())
                        .unwrap_or(false);
                    if !verified {
                        status = BackupStatus::Warning;
                        stray_lines.push("post-backup verification failed".to_string());
                    }
                }

                Ok(BackupResult {
                    status,
                    repository_name: repository.id().to_string(),
                    target_names,
                    snapshot_id: summary.snapshot_id,
                    files_new: summary.files_new,
                    files_changed: summary.files_changed,
                    files_unmodified: summary.files_unmodified,
                    data_added: summary.data_added,
                    duration,
                    errors: stray_lines,
                })
            }
            Err(e) => {
                pb.finish_and_clear();
                op_status.complete(StatusLevel::Error, e.to_string());
                let _ = self.status.archive(&operation_id);
                self.security
                    .audit_backup_operation(repository, "backup_failed", Some(&target_names), false);
                Err(e)
            }
        }
    }

    pub fn create_full_backup(
        &mut self,
        repository: &Repository,
        targets: Vec<BackupTarget>,
        tags: Vec<String>,
    ) -> Result<BackupResult> {
        let mut full_tags = tags;
        full_tags.push("full".to_string());
        let request = BackupRequest { targets, tags: full_tags, dry_run: false, verify_after_backup: true };
        self.execute_backup(repository, &request, &CancellationToken::new())
    }

    pub fn create_incremental_backup(
        &mut self,
        repository: &Repository,
        targets: Vec<BackupTarget>,
        parent_snapshot_id: Option<&str>,
        tags: Vec<String>,
    ) -> Result<BackupResult> {
        let mut incremental_tags = tags;
        incremental_tags.push("incremental".to_string());
        if let Some(parent) = parent_snapshot_id {
            incremental_tags.push(format!("parent:{parent}"));
        }
        let request =
            BackupRequest { targets, tags: incremental_tags, dry_run: false, verify_after_backup: true };
        self.execute_backup(repository, &request, &CancellationToken::new())
    }

    /// Retries only on non-terminal errors; wrong-password or
    /// not-initialized failures are terminal and surfaced on the first
    /// attempt. Sleeps `retry_delay * 2^(attempt-1)` between attempts.
    pub fn execute_backup_with_retry(
        &mut self,
        repository: &Repository,
        request: &BackupRequest,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<BackupResult> {
        let cancel = CancellationToken::new();
        let mut last_error: Option<TimeLockerError> = None;

        for attempt in 1..=(max_retries + 1) {
            match self.execute_backup(repository, request, &cancel) {
                Ok(result) => return Ok(result),
                Err(e) if is_terminal(&e) => return Err(e),
                Err(e) => {
                    if attempt > max_retries {
                        let stderr = e.to_string();
                        return Err(BackupError::RetriesExhausted {
                            attempts: attempt,
                            last_error: stderr.clone(),
                            source: Box::new(BackupError::Engine(crate::error::EngineExecutionError {
                                code: None,
                                stderr,
                            })),
                        }
                        .into());
                    }
                    let backoff = retry_delay * 2u32.pow(attempt - 1);
                    tracing::warn!(attempt, max_retries, error = %e, delay_secs = backoff.as_secs_f64(), "backup attempt failed, retrying");
                    std::thread::sleep(backoff);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(TimeLockerError::Cancelled))
    }

    /// Delegates to `verify_backup_comprehensive`; per spec this is
    /// equivalent to "verify_backup if available, else check" since the
    /// engine contract only exposes the comprehensive verification path.
    pub fn verify_backup_integrity(&self, repository: &Repository, snapshot_id: Option<&str>) -> Result<bool> {
        Ok(repository.verify_backup_comprehensive(snapshot_id)?.success)
    }

    pub fn estimate_backup_size(&self, targets: &mut [BackupTarget]) -> Result<SelectionEstimate> {
        let mut total = SelectionEstimate::default();
        for target in targets {
            let estimate = target.selection.estimate_size()?;
            total.total_size += estimate.total_size;
            total.file_count += estimate.file_count;
            total.directory_count += estimate.directory_count;
        }
        Ok(total)
    }

    pub fn get_backup_history(&self, repository_id: Option<&str>, limit: usize) -> Result<Vec<OperationStatus>> {
        Ok(self.status.history(repository_id, limit)?)
    }
}

/// Wrong password, missing repository, and credential errors are not worth
/// retrying — the next attempt would fail identically.
fn is_terminal(error: &TimeLockerError) -> bool {
    matches!(
        error,
        TimeLockerError::Backup(BackupError::PasswordMissing(_))
            | TimeLockerError::Repository(RepositoryError::NotInitialized(_))
            | TimeLockerError::Repository(RepositoryError::PasswordMissing)
            | TimeLockerError::Credential(_)
    )
}

fn create_progress_bar(target_names: &[String]) -> ProgressBar {
    let label = target_names.join(",");
    let pb = ProgressBar::new(1);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!("  {{spinner:.green}} {label} [{{bar:30.cyan/dim}}] {{pos}}/{{len}} {{msg}}"))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸─"),
    );
    pb
}

/// Formats a byte count as a human-readable size string.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}

/// Prints a colored summary of a completed backup.
pub fn print_backup_summary(result: &BackupResult) {
    use colored::Colorize;
    eprintln!();
    match result.status {
        BackupStatus::Success => eprintln!("  {} Backup complete", "✓".green()),
        BackupStatus::Warning => eprintln!("  {} Backup completed with warnings", "!".yellow()),
        BackupStatus::Error => eprintln!("  {} Backup failed", "✗".red()),
    }
    if let Some(id) = &result.snapshot_id {
        eprintln!("    Snapshot:    {}", id.bold());
    }
    eprintln!(
        "    Files:       {} new, {} changed, {} unmodified",
        result.files_new, result.files_changed, result.files_unmodified,
    );
    eprintln!("    Data added:  {}", format_size(result.data_added));
    eprintln!("    Duration:    {:.2}s", result.duration.as_secs_f64());
    for line in &result.errors {
        eprintln!("    {} {}", "warn:".yellow(), line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_starts_uncancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        let err = TimeLockerError::Backup(BackupError::PasswordMissing("r1".to_string()));
        assert!(is_terminal(&err));
        let err = TimeLockerError::Cancelled;
        assert!(!is_terminal(&err));
    }

    #[test]
    fn format_size_steps_units() {
        assert_eq!(format_size(512), "512.0 B");
        assert_eq!(format_size(2048), "2.0 KiB");
    }
}
