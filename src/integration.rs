//! # Integration Service
//!
//! The single facade CLI and importer collaborators go through — never the
//! credential store or security service directly, so that operations which
//! touch secrets or the audit trail can't accidentally bypass either one.
//! Constructed once per process and held by the caller for its lifetime;
//! there is no process-wide singleton here, only an owned handle.

use crate::backup::{BackupOrchestrator, BackupRequest, BackupResult, BackupTarget};
use crate::config::{BackupTargetConfig, Config, RepositoryConfig};
use crate::credential::CredentialStore;
use crate::error::{RepositoryError, Result, SecurityError, TimeLockerError};
use crate::importer::{self, ImportResult};
use crate::repository::{Repository, RepositoryKind, VerificationReport};
use crate::restore::{RestoreOptions, RestoreResult, RestoreService};
use crate::retention::RetentionPolicy;
use crate::security::SecurityService;
use crate::selection::{FileSelection, SelectionType};
use crate::snapshot::{Snapshot, SnapshotFilter, SnapshotService};
use crate::status::OperationStatus;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Maps an error to the process exit code the CLI surface reports.
pub fn exit_code(error: &TimeLockerError) -> i32 {
    match error {
        TimeLockerError::Config(_) => 2,
        TimeLockerError::Repository(RepositoryError::NotInitialized(_)) => 3,
        TimeLockerError::Repository(RepositoryError::EngineNotFound(_))
        | TimeLockerError::Repository(RepositoryError::EngineVersionTooOld { .. }) => 5,
        TimeLockerError::Credential(_) => 4,
        TimeLockerError::Security(SecurityError::LockdownActive { .. }) => 6,
        TimeLockerError::Cancelled => 7,
        _ => 1,
    }
}

pub struct IntegrationService {
    config: Config,
    config_dir: PathBuf,
    credentials: Arc<Mutex<CredentialStore>>,
    security: SecurityService,
    orchestrator: BackupOrchestrator,
    restore_service: RestoreService,
    snapshots: SnapshotService,
}

impl IntegrationService {
    pub fn new(config: Config) -> Result<Self> {
        let config_dir = config.settings.config_dir.clone();
        let credentials = CredentialStore::open(
            config_dir.join("credentials"),
            config.security.max_failed_attempts,
            config.security.lockout_duration,
            config.security.credential_timeout,
        )?;

        Ok(Self {
            security: SecurityService::new(&config_dir),
            orchestrator: BackupOrchestrator::new(&config_dir),
            restore_service: RestoreService::new(&config_dir),
            snapshots: SnapshotService::new(Duration::from_secs(30)),
            credentials: Arc::new(Mutex::new(credentials)),
            config,
            config_dir,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save_config(&self, path: &std::path::Path) -> Result<()> {
        crate::config::save_config(&self.config, path)
    }

    fn check_lockdown(&self) -> Result<()> {
        if self.security.is_lockdown_active() {
            return Err(SecurityError::LockdownActive { reason: "see emergency_lockdown.marker".to_string() }.into());
        }
        Ok(())
    }

    pub fn create_credential_store(&self, master_password: &str) -> Result<()> {
        self.credentials.lock().expect("credential store mutex poisoned").create(master_password)
    }

    pub fn unlock_credentials(&self, master_password: &str) -> Result<()> {
        self.credentials.lock().expect("credential store mutex poisoned").unlock(master_password)
    }

    pub fn lock_credentials(&self) {
        self.credentials.lock().expect("credential store mutex poisoned").lock();
    }

    pub fn store_repository_password(&self, repository_name: &str, password: &str) -> Result<()> {
        let result =
            self.credentials.lock().expect("credential store mutex poisoned").store_repository_password(repository_name, password);
        self.security.audit_credential_access(repository_name, "store_repository_password", result.is_ok());
        result
    }

    pub fn emergency_lockdown(&self, reason: &str) {
        self.security.emergency_lockdown(reason);
    }

    pub fn clear_lockdown(&self) -> std::io::Result<()> {
        self.security.clear_lockdown()
    }

    /// Builds a live [`Repository`] handle for a configured repository name,
    /// pulling backend-specific secrets (access keys, account keys) from the
    /// credential store's backend-credentials map rather than the plaintext
    /// configuration document.
    pub fn build_repository(&self, repository_name: &str) -> Result<Repository> {
        let cfg = crate::config::resolve_repository(&self.config, repository_name)?;
        let kind = self.repository_kind_from_config(repository_name, cfg)?;
        Ok(Repository::new(repository_name, kind).with_credential_store(self.credentials.clone()))
    }

    fn repository_kind_from_config(&self, repository_name: &str, cfg: &RepositoryConfig) -> Result<RepositoryKind> {
        let backend_secret = |field: &str| -> String {
            self.credentials
                .lock()
                .expect("credential store mutex poisoned")
                .get_backend_credentials(repository_name)
                .ok()
                .and_then(|m| m.get(field).cloned())
                .unwrap_or_default()
        };

        Ok(match cfg.kind.as_str() {
            "local" => RepositoryKind::Local { path: PathBuf::from(cfg.location.trim_start_matches("file://")) },
            "s3" => RepositoryKind::S3 {
                bucket: cfg.bucket.clone().unwrap_or_default(),
                prefix: cfg.prefix.clone().unwrap_or_default(),
                region: cfg.region.clone().unwrap_or_default(),
                access_key_id: backend_secret("access_key_id"),
                secret_access_key: backend_secret("secret_access_key"),
            },
            "b2" => RepositoryKind::B2 {
                bucket: cfg.bucket.clone().unwrap_or_default(),
                prefix: cfg.prefix.clone().unwrap_or_default(),
                account_id: cfg.account_id.clone().unwrap_or_default(),
                account_key: backend_secret("account_key"),
            },
            "sftp" => RepositoryKind::Sftp {
                user: cfg.user.clone().unwrap_or_default(),
                host: cfg.host.clone().unwrap_or_default(),
                path: cfg.location.clone(),
            },
            other => {
                return Err(crate::error::ConfigError::Validation {
                    message: format!("unknown repository kind '{other}' for repository '{repository_name}'"),
                }
                .into())
            }
        })
    }

    /// Initializes a configured repository's storage with the engine's
    /// `init` subcommand, optionally persisting `password` into the
    /// credential store under the same name once init succeeds.
    pub fn initialize_repository(&self, repository_name: &str, password: &str) -> Result<()> {
        self.check_lockdown()?;
        let mut repository = self.build_repository(repository_name)?;
        repository.initialize_repository(password, Some(&self.credentials))
    }

    fn build_selection(&self, target_config: &BackupTargetConfig) -> FileSelection {
        let mut selection = FileSelection::new();
        for path in &target_config.paths {
            selection.add_path(path.clone());
        }
        for pattern in &target_config.include_patterns {
            selection.add_pattern(pattern.clone(), SelectionType::Include);
        }
        for pattern in &target_config.exclude_patterns {
            selection.add_pattern(pattern.clone(), SelectionType::Exclude);
        }
        selection
    }

    pub fn run_backup(&mut self, repository_name: &str, target_names: &[String], tags: Vec<String>, dry_run: bool) -> Result<BackupResult> {
        self.check_lockdown()?;
        let repository = self.build_repository(repository_name)?;

        let mut targets = Vec::new();
        for name in target_names {
            let target_config = crate::config::resolve_target(&self.config, name)?;
            targets.push(BackupTarget { name: name.clone(), selection: self.build_selection(target_config), tags: Vec::new() });
        }

        let request = BackupRequest { targets, tags, dry_run, verify_after_backup: self.config.settings.verify_after_backup };
        self.orchestrator.execute_backup_with_retry(
            &repository,
            &request,
            self.config.settings.max_retries,
            Duration::from_secs_f64(self.config.settings.retry_delay_secs),
        )
    }

    pub fn run_restore(&mut self, repository_name: &str, snapshot_id: &str, options: RestoreOptions) -> Result<RestoreResult> {
        self.check_lockdown()?;
        let repository = self.build_repository(repository_name)?;
        Ok(self.restore_service.restore_snapshot(&repository, &mut self.snapshots, snapshot_id, options))
    }

    pub fn run_restore_latest(&mut self, repository_name: &str, options: RestoreOptions) -> Result<RestoreResult> {
        self.check_lockdown()?;
        let repository = self.build_repository(repository_name)?;
        Ok(self.restore_service.restore_latest_snapshot(&repository, &mut self.snapshots, options))
    }

    pub fn list_snapshots(&mut self, repository_name: &str, filter: Option<&SnapshotFilter>) -> Result<Vec<Snapshot>> {
        let repository = self.build_repository(repository_name)?;
        self.snapshots.list_snapshots(&repository, filter, false)
    }

    pub fn diff_snapshots(&mut self, repository_name: &str, older_id: &str, newer_id: &str) -> Result<crate::restore::SnapshotDiff> {
        let repository = self.build_repository(repository_name)?;
        let older = self.snapshots.get_snapshot_by_id(&repository, older_id)?;
        let newer = self.snapshots.get_snapshot_by_id(&repository, newer_id)?;
        Ok(crate::restore::diff_snapshots(&older, &newer))
    }

    pub fn prune(&self, repository_name: &str, policy: &RetentionPolicy, dry_run: bool) -> Result<()> {
        self.check_lockdown()?;
        policy.validate()?;
        let repository = self.build_repository(repository_name)?;
        repository.apply_retention_policy(policy, !dry_run)
    }

    pub fn verify(&self, repository_name: &str, snapshot_id: Option<&str>) -> Result<VerificationReport> {
        let repository = self.build_repository(repository_name)?;
        let report = repository.verify_backup_comprehensive(snapshot_id)?;
        self.security.audit_integrity_check(&repository, "comprehensive", report.success);
        Ok(report)
    }

    pub fn backup_history(&self, repository_id: Option<&str>, limit: usize) -> Result<Vec<OperationStatus>> {
        self.orchestrator.get_backup_history(repository_id, limit)
    }

    /// Imports a Timeshift configuration and, on success, merges the
    /// resulting repository/backup-target entries into the current
    /// configuration document (caller still has to persist it).
    pub fn import_timeshift(
        &mut self,
        config_path: Option<&std::path::Path>,
        repository_name: &str,
        target_name: &str,
        manual_repository_path: Option<&str>,
    ) -> ImportResult {
        let result = importer::import_timeshift_config(config_path, repository_name, target_name, manual_repository_path);
        if result.success {
            if let Some(repo) = result.repository.clone() {
                self.config.repositories.insert(result.repository_name.clone(), repo);
            }
            if let Some(target) = result.backup_target.clone() {
                self.config.backup_targets.insert(result.target_name.clone(), target);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CredentialError, SecurityError as SecErr};

    #[test]
    fn exit_code_maps_credential_errors_to_four() {
        let err = TimeLockerError::Credential(CredentialError::WrongPassword);
        assert_eq!(exit_code(&err), 4);
    }

    #[test]
    fn exit_code_maps_lockdown_to_six() {
        let err = TimeLockerError::Security(SecErr::LockdownActive { reason: "x".to_string() });
        assert_eq!(exit_code(&err), 6);
    }

    #[test]
    fn exit_code_maps_cancelled_to_seven() {
        assert_eq!(exit_code(&TimeLockerError::Cancelled), 7);
    }

    #[test]
    fn exit_code_defaults_to_one() {
        assert_eq!(exit_code(&TimeLockerError::SnapshotNotFound("x".to_string())), 1);
    }
}
