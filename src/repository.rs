//! # Repository Abstraction
//!
//! Models a storage location managed by the snapshot engine as a tagged
//! variant over backend kind, never as an inheritance hierarchy (§9 Design
//! Notes). Each variant knows how to project itself into the engine's
//! environment/URI conventions; everything else (command assembly, JSON
//! streaming, retries) is shared.
//!
//! The engine itself is treated as an opaque I/O boundary: this module
//! spawns it, reads its structured output, and never inspects pack files or
//! on-disk layout directly.

use crate::command::{CommandBuilder, CommandDefinition, Parameter, ParameterStyle, RunOutcome, SynopsisValue};
use crate::credential::CredentialStore;
use crate::error::{RepositoryError, Result, TimeLockerError};
use crate::retention::RetentionPolicy;
use crate::snapshot::{Snapshot, SnapshotStats};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Engine executable verification gives up after this long (spec §5).
const ENGINE_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read-data verification scan budget before it degrades to a
/// warning rather than a failure (spec §5).
const READ_DATA_SCAN_TIMEOUT: Duration = Duration::from_secs(300);

/// The environment variable the engine reads its repository password from,
/// absent a more specific password-providing flag.
const PASSWORD_ENV: &str = "RESTIC_PASSWORD";
/// The environment variable carrying the repository URI.
const REPOSITORY_ENV: &str = "RESTIC_REPOSITORY";
/// Fallback ambient env var for a password the user has exported themselves.
const AMBIENT_PASSWORD_ENV: &str = "TIMELOCKER_REPOSITORY_PASSWORD";

const MIN_ENGINE_VERSION: (u32, u32, u32) = (0, 14, 0);

/// Backend-specific data for a repository.
#[derive(Debug, Clone)]
pub enum RepositoryKind {
    Local {
        path: PathBuf,
    },
    S3 {
        bucket: String,
        prefix: String,
        region: String,
        access_key_id: String,
        secret_access_key: String,
    },
    B2 {
        bucket: String,
        prefix: String,
        account_id: String,
        account_key: String,
    },
    Sftp {
        user: String,
        host: String,
        path: String,
    },
}

/// A repository: a storage location managed by the engine, uniquely
/// identified by its URI.
pub struct Repository {
    id: String,
    kind: RepositoryKind,
    explicit_password: Option<String>,
    credential_store: Option<Arc<Mutex<CredentialStore>>>,
    cached_env: OnceLock<BTreeMap<String, String>>,
}

impl Repository {
    pub fn new(id: impl Into<String>, kind: RepositoryKind) -> Self {
        Self {
            id: id.into(),
            kind,
            explicit_password: None,
            credential_store: None,
            cached_env: OnceLock::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.explicit_password = Some(password.into());
        self
    }

    pub fn with_credential_store(mut self, store: Arc<Mutex<CredentialStore>>) -> Self {
        self.credential_store = Some(store);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Canonical URI for this repository's backend kind.
    pub fn uri(&self) -> String {
        match &self.kind {
            RepositoryKind::Local { path } => format!("file://{}", path.display()),
            RepositoryKind::S3 { region, bucket, prefix, .. } => {
                format!("s3:{region}.amazonaws.com/{bucket}/{prefix}")
            }
            RepositoryKind::B2 { bucket, prefix, .. } => format!("b2:{bucket}/{prefix}"),
            RepositoryKind::Sftp { user, host, path } => format!("sftp:{user}@{host}:{path}"),
        }
    }

    /// Backend-specific environment variables the engine expects.
    pub fn backend_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        match &self.kind {
            RepositoryKind::Local { .. } => {}
            RepositoryKind::S3 { region, access_key_id, secret_access_key, .. } => {
                env.insert("AWS_ACCESS_KEY_ID".to_string(), access_key_id.clone());
                env.insert("AWS_SECRET_ACCESS_KEY".to_string(), secret_access_key.clone());
                env.insert("AWS_DEFAULT_REGION".to_string(), region.clone());
            }
            RepositoryKind::B2 { account_id, account_key, .. } => {
                env.insert("B2_ACCOUNT_ID".to_string(), account_id.clone());
                env.insert("B2_ACCOUNT_KEY".to_string(), account_key.clone());
            }
            RepositoryKind::Sftp { .. } => {}
        }
        env
    }

    /// Resolves the effective password: explicit > credential store > ambient
    /// env var. Returns `None` if every source is absent.
    pub fn password(&self) -> Result<Option<String>> {
        if let Some(p) = &self.explicit_password {
            return Ok(Some(p.clone()));
        }
        if let Some(store) = &self.credential_store {
            let mut guard = store.lock().expect("credential store mutex poisoned");
            match guard.get_repository_password(&self.id) {
                Ok(password) => return Ok(Some(password)),
                Err(TimeLockerError::Credential(crate::error::CredentialError::NotFound(_))) => {}
                Err(e) => return Err(e),
            }
        }
        if let Ok(env_password) = std::env::var(AMBIENT_PASSWORD_ENV) {
            return Ok(Some(env_password));
        }
        Ok(None)
    }

    /// Cached merge of `backend_env` with the password/repository env vars.
    /// Computed once per instance; callers must obtain a fresh handle after
    /// credential rotation (§9 Open Question, resolved: no cache
    /// invalidation on rotation).
    pub fn to_env(&self) -> Result<BTreeMap<String, String>> {
        if let Some(env) = self.cached_env.get() {
            return Ok(env.clone());
        }

        let mut env = self.backend_env();
        env.insert(REPOSITORY_ENV.to_string(), self.uri());
        if let Some(password) = self.password()? {
            env.insert(PASSWORD_ENV.to_string(), password);
        }

        let _ = self.cached_env.set(env.clone());
        Ok(env)
    }

    fn builder(&self) -> CommandBuilder {
        CommandBuilder::new(engine_definition())
    }

    fn synopsis(pairs: &[(&str, &str)]) -> BTreeMap<String, SynopsisValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), SynopsisValue::Single(v.to_string()))).collect()
    }

    /// Runs the engine once with no repository context, to check presence
    /// and version. Gives up after [`ENGINE_VERIFY_TIMEOUT`] (spec §5);
    /// a stuck or hung executable is treated the same as a missing one.
    pub fn verify_engine_executable(&self, min_version: Option<(u32, u32, u32)>) -> Result<()> {
        let def = CommandDefinition::new("restic").with_subcommand(CommandDefinition::new("version"));
        let mut builder = CommandBuilder::new(def);
        builder
            .command("version")
            .map_err(|_| RepositoryError::EngineNotFound("restic".to_string()))?;

        let mut stdout = String::new();
        let outcome = builder
            .run_iter_with_timeout(
                |line| {
                    stdout.push_str(line);
                    stdout.push('\n');
                },
                &BTreeMap::new(),
                &BTreeMap::new(),
                ENGINE_VERIFY_TIMEOUT,
            )
            .map_err(|_| RepositoryError::EngineNotFound("restic".to_string()))?;

        if matches!(outcome, RunOutcome::TimedOut) {
            return Err(RepositoryError::EngineNotFound("restic".to_string()).into());
        }

        let found = parse_engine_version(&stdout).unwrap_or((0, 0, 0));
        let required = min_version.unwrap_or(MIN_ENGINE_VERSION);

        if found < required {
            return Err(RepositoryError::EngineVersionTooOld {
                found: format!("{}.{}.{}", found.0, found.1, found.2),
                required: format!("{}.{}.{}", required.0, required.1, required.2),
            }
            .into());
        }

        Ok(())
    }

    /// Idempotent: if already initialized, returns success without
    /// invoking the engine's `init` subcommand. `password` temporarily
    /// overrides whatever password source this handle would otherwise
    /// resolve, for the duration of the `init` call only — the original
    /// source is restored on every exit path, success or error. When
    /// `credential_manager` is given and already unlocked, the password is
    /// also stored there under this repository's id; an absent or locked
    /// manager just skips that step rather than failing the init.
    pub fn initialize_repository(
        &mut self,
        password: &str,
        credential_manager: Option<&Arc<Mutex<CredentialStore>>>,
    ) -> Result<()> {
        if self.is_repository_initialized() {
            return Ok(());
        }

        if let RepositoryKind::Local { path } = &self.kind {
            std::fs::create_dir_all(path).map_err(TimeLockerError::Io)?;
        }

        let original_password = self.explicit_password.take();
        self.explicit_password = Some(password.to_string());
        self.cached_env = OnceLock::new();

        let result = (|| -> Result<()> {
            let env = self.to_env()?;
            let mut builder = self.builder();
            builder.command("init")?;
            builder.run(|_| {}, &env, &BTreeMap::new())?;
            Ok(())
        })();

        self.explicit_password = original_password;
        self.cached_env = OnceLock::new();

        result?;

        if let Some(manager) = credential_manager {
            let mut guard = manager.lock().expect("credential store mutex poisoned");
            if !guard.is_locked() {
                let _ = guard.store_repository_password(&self.id, password);
            }
        }

        Ok(())
    }

    /// Backend-specific existence check; for local, presence of a `config`
    /// file under the path.
    pub fn is_repository_initialized(&self) -> bool {
        match &self.kind {
            RepositoryKind::Local { path } => path.join("config").exists(),
            _ => false,
        }
    }

    pub fn get_repository_info(&self) -> RepositoryInfo {
        let initialized = self.is_repository_initialized();
        let (writable, size_bytes) = match &self.kind {
            RepositoryKind::Local { path } => {
                let writable = path
                    .metadata()
                    .map(|m| !m.permissions().readonly())
                    .unwrap_or(false);
                let size = directory_size(path).unwrap_or(0);
                (writable, size)
            }
            _ => (true, 0),
        };

        let config_snippet = match &self.kind {
            RepositoryKind::Local { path } => std::fs::read_to_string(path.join("config"))
                .unwrap_or_else(|_| String::new()),
            _ => String::new(),
        };

        RepositoryInfo {
            location: self.uri(),
            kind: self.kind_name().to_string(),
            repository_id: self.id.clone(),
            initialized,
            writable,
            size_bytes,
            config_snippet,
        }
    }

    fn kind_name(&self) -> &'static str {
        match &self.kind {
            RepositoryKind::Local { .. } => "local",
            RepositoryKind::S3 { .. } => "s3",
            RepositoryKind::B2 { .. } => "b2",
            RepositoryKind::Sftp { .. } => "sftp",
        }
    }

    pub fn validate_repository_health(&self) -> RepositoryHealth {
        let mut issues = Vec::new();

        let directory_exists = match &self.kind {
            RepositoryKind::Local { path } => path.exists(),
            _ => true,
        };
        if !directory_exists {
            issues.push("repository location does not exist".to_string());
        }

        let directory_writable = match &self.kind {
            RepositoryKind::Local { path } => path
                .metadata()
                .map(|m| !m.permissions().readonly())
                .unwrap_or(false),
            _ => true,
        };
        if !directory_writable {
            issues.push("repository location is not writable".to_string());
        }

        let repository_initialized = self.is_repository_initialized();
        if !repository_initialized {
            issues.push("repository is not initialized".to_string());
        }

        let password_available = self.password().ok().flatten().is_some();
        if !password_available {
            issues.push("no password is available for this repository".to_string());
        }

        let engine_accessible = self.verify_engine_executable(None).is_ok();
        if !engine_accessible {
            issues.push("snapshot engine executable is not accessible".to_string());
        }

        RepositoryHealth {
            healthy: issues.is_empty(),
            issues,
            checks: HealthChecks {
                directory_exists,
                directory_writable,
                repository_initialized,
                password_available,
                engine_accessible,
            },
        }
    }

    /// Invokes `backup` with the given positional include/exclude args
    /// (already projected by [`crate::selection::FileSelection::
    /// to_engine_args`] — include roots followed by `--exclude <pattern>`
    /// pairs) and tags, streaming progress through `on_line`. Every include
    /// root reaches the engine as its own `FILE` positional and every
    /// exclude reaches it as its own `--exclude` flag occurrence.
    pub fn backup_target(
        &self,
        selection_args: &[String],
        tags: &[String],
        mut on_line: impl FnMut(EngineEvent),
    ) -> Result<BackupSummary> {
        tracing::debug!(repository = %self.id, tags = ?tags, "starting backup");
        let env = self.to_env()?;
        let mut builder = self.builder();
        builder.flag("json")?;
        builder.command("backup")?;
        if !tags.is_empty() {
            builder.param_list("tag", tags.to_vec())?;
        }

        let (files, excludes) = split_selection_args(selection_args);
        if !excludes.is_empty() {
            builder.param_list("exclude", excludes)?;
        }

        let mut synopsis = BTreeMap::new();
        if !files.is_empty() {
            synopsis.insert("FILE".to_string(), SynopsisValue::Multiple(files));
        }

        let mut summary = BackupSummary::default();
        builder.run(
            |line| {
                let event = parse_engine_line(line);
                if let EngineEvent::Summary(ref s) = event {
                    summary = s.clone();
                }
                on_line(event);
            },
            &env,
            &synopsis,
        )?;
        Ok(summary)
    }

    /// Lists snapshots, optionally filtered by tag at the engine level.
    pub fn snapshots(&self, tags: Option<&[String]>) -> Result<Vec<Snapshot>> {
        let env = self.to_env()?;
        let mut builder = self.builder();
        builder.flag("json")?;
        builder.command("snapshots")?;
        if let Some(tags) = tags {
            if !tags.is_empty() {
                builder.param_list("tag", tags.to_vec())?;
            }
        }

        let output = builder.run(|_| {}, &env, &BTreeMap::new())?;
        parse_snapshot_listing(&output)
    }

    pub fn restore(
        &self,
        snapshot_id: &str,
        target: &Path,
        include: &[String],
        exclude: &[String],
        mut on_line: impl FnMut(EngineEvent),
    ) -> Result<()> {
        tracing::debug!(repository = %self.id, snapshot = snapshot_id, target = %target.display(), "starting restore");
        let env = self.to_env()?;
        let mut builder = self.builder();
        builder.flag("json")?;
        builder.command("restore")?;
        builder.param("target", target.to_string_lossy().into_owned())?;
        if !include.is_empty() {
            builder.param_list("include", include.to_vec())?;
        }
        if !exclude.is_empty() {
            builder.param_list("exclude", exclude.to_vec())?;
        }

        let synopsis = Self::synopsis(&[("snapshotID", snapshot_id)]);
        builder.run(|line| on_line(parse_engine_line(line)), &env, &synopsis)?;
        Ok(())
    }

    pub fn check(&self) -> Result<bool> {
        let env = self.to_env()?;
        let mut builder = self.builder();
        builder.command("check")?;
        Ok(builder.run(|_| {}, &env, &BTreeMap::new()).is_ok())
    }

    /// Runs `check --read-data` for one snapshot, bounded by `timeout`. A
    /// timeout is reported distinctly from an actual failure (spec §5): the
    /// scan may simply be slow against a large repository, not broken.
    pub fn verify_snapshot_read_data(&self, snapshot_id: &str, timeout: Duration) -> Result<ReadDataOutcome> {
        let env = self.to_env()?;
        let mut builder = self.builder();
        builder.command("check")?;
        builder.flag("read-data")?;
        let synopsis = Self::synopsis(&[("snapshotID", snapshot_id)]);
        match builder.run_iter_with_timeout(|_| {}, &env, &synopsis, timeout) {
            Ok(RunOutcome::Completed(_)) => Ok(ReadDataOutcome::Passed),
            Ok(RunOutcome::TimedOut) => Ok(ReadDataOutcome::TimedOut),
            Err(_) => Ok(ReadDataOutcome::Failed),
        }
    }

    pub fn stats(&self) -> Result<serde_json::Value> {
        let env = self.to_env()?;
        let mut builder = self.builder();
        builder.flag("json")?;
        builder.command("stats")?;
        let output = builder.run(|_| {}, &env, &BTreeMap::new())?;
        serde_json::from_str(output.lines().last().unwrap_or("{}"))
            .map_err(|e| TimeLockerError::Other(anyhow::anyhow!("failed to parse stats output: {e}")))
    }

    pub fn forget_snapshot(&self, snapshot_id: &str, prune: bool) -> Result<()> {
        let env = self.to_env()?;
        let mut builder = self.builder();
        builder.command("forget")?;
        if prune {
            builder.flag("prune")?;
        }
        let synopsis = Self::synopsis(&[("snapshotID", snapshot_id)]);
        builder.run(|_| {}, &env, &synopsis)?;
        Ok(())
    }

    pub fn prune_data(&self) -> Result<()> {
        let env = self.to_env()?;
        let mut builder = self.builder();
        builder.command("prune")?;
        builder.run(|_| {}, &env, &BTreeMap::new())?;
        Ok(())
    }

    /// Retention policy must be valid (at least one field set) before it is
    /// turned into `forget` flags.
    pub fn apply_retention_policy(&self, policy: &RetentionPolicy, prune: bool) -> Result<()> {
        policy.validate()?;

        let env = self.to_env()?;
        let mut builder = self.builder();
        builder.command("forget")?;
        if let Some(n) = policy.keep_last {
            builder.param("keep-last", n.to_string())?;
        }
        if let Some(n) = policy.keep_hourly {
            builder.param("keep-hourly", n.to_string())?;
        }
        if let Some(n) = policy.keep_daily {
            builder.param("keep-daily", n.to_string())?;
        }
        if let Some(n) = policy.keep_weekly {
            builder.param("keep-weekly", n.to_string())?;
        }
        if let Some(n) = policy.keep_monthly {
            builder.param("keep-monthly", n.to_string())?;
        }
        if let Some(n) = policy.keep_yearly {
            builder.param("keep-yearly", n.to_string())?;
        }
        if let Some(within) = &policy.keep_within {
            builder.param("keep-within", within.clone())?;
        }
        if !policy.keep_tags.is_empty() {
            builder.param_list("keep-tag", policy.keep_tags.clone())?;
        }
        if prune {
            builder.flag("prune")?;
        }

        builder.run(|_| {}, &env, &BTreeMap::new())?;
        Ok(())
    }

    /// Four independent checks: repository structure, statistics, per-snapshot
    /// integrity, and listing consistency. Only the first check's failure
    /// fails the whole verification; the rest degrade to warnings.
    pub fn verify_backup_comprehensive(&self, snapshot_id: Option<&str>) -> Result<VerificationReport> {
        let mut report = VerificationReport::default();

        let structure_ok = self.check()?;
        report.checks.push(CheckResult {
            name: "repository_structure".to_string(),
            passed: structure_ok,
        });
        if !structure_ok {
            report.success = false;
            return Ok(report);
        }

        match self.stats() {
            Ok(_) => report.checks.push(CheckResult { name: "statistics".to_string(), passed: true }),
            Err(_) => report.checks.push(CheckResult { name: "statistics".to_string(), passed: false }),
        }

        if let Some(id) = snapshot_id {
            match self.verify_snapshot_read_data(id, READ_DATA_SCAN_TIMEOUT) {
                Ok(ReadDataOutcome::Passed) => {
                    report.checks.push(CheckResult { name: "snapshot_integrity".to_string(), passed: true })
                }
                Ok(ReadDataOutcome::Failed) | Err(_) => {
                    report.checks.push(CheckResult { name: "snapshot_integrity".to_string(), passed: false })
                }
                Ok(ReadDataOutcome::TimedOut) => report.warnings.push(format!(
                    "read-data verification for snapshot {id} timed out after {}s",
                    READ_DATA_SCAN_TIMEOUT.as_secs()
                )),
            }
        }

        match self.snapshots(None) {
            Ok(_) => report.checks.push(CheckResult { name: "listing_consistency".to_string(), passed: true }),
            Err(_) => report.checks.push(CheckResult { name: "listing_consistency".to_string(), passed: false }),
        }

        report.success = true;
        Ok(report)
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryInfo {
    pub location: String,
    pub kind: String,
    pub repository_id: String,
    pub initialized: bool,
    pub writable: bool,
    pub size_bytes: u64,
    pub config_snippet: String,
}

#[derive(Debug, Clone, Default)]
pub struct HealthChecks {
    pub directory_exists: bool,
    pub directory_writable: bool,
    pub repository_initialized: bool,
    pub password_available: bool,
    pub engine_accessible: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RepositoryHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub success: bool,
    pub checks: Vec<CheckResult>,
    pub warnings: Vec<String>,
}

/// Result of a bounded `check --read-data` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDataOutcome {
    Passed,
    Failed,
    TimedOut,
}

/// A single line of engine output, tagged by the contract's `message_type`.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Status(StatusEvent),
    Summary(BackupSummary),
    Other(String),
}

#[derive(Debug, Clone, Default)]
pub struct StatusEvent {
    pub percent_done: f64,
    pub total_files: u64,
    pub files_done: u64,
    pub total_bytes: u64,
    pub bytes_done: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BackupSummary {
    pub snapshot_id: Option<String>,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub data_added: u64,
}

/// Parses a raw JSON line into a tagged [`EngineEvent`], ignoring unknown
/// fields and tolerating malformed or non-JSON lines as `Other`.
pub fn parse_engine_line(line: &str) -> EngineEvent {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return EngineEvent::Other(line.to_string());
    };

    match value.get("message_type").and_then(|v| v.as_str()) {
        Some("status") => EngineEvent::Status(StatusEvent {
            percent_done: value.get("percent_done").and_then(|v| v.as_f64()).unwrap_or(0.0),
            total_files: value.get("total_files").and_then(|v| v.as_u64()).unwrap_or(0),
            files_done: value.get("files_done").and_then(|v| v.as_u64()).unwrap_or(0),
            total_bytes: value.get("total_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
            bytes_done: value.get("bytes_done").and_then(|v| v.as_u64()).unwrap_or(0),
        }),
        Some("summary") => EngineEvent::Summary(BackupSummary {
            snapshot_id: value.get("snapshot_id").and_then(|v| v.as_str()).map(String::from),
            files_new: value.get("files_new").and_then(|v| v.as_u64()).unwrap_or(0),
            files_changed: value.get("files_changed").and_then(|v| v.as_u64()).unwrap_or(0),
            files_unmodified: value.get("files_unmodified").and_then(|v| v.as_u64()).unwrap_or(0),
            data_added: value.get("data_added").and_then(|v| v.as_u64()).unwrap_or(0),
        }),
        _ => EngineEvent::Other(line.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    id: String,
    time: DateTime<Utc>,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

fn parse_snapshot_listing(output: &str) -> Result<Vec<Snapshot>> {
    let json_line = output
        .lines()
        .find(|l| l.trim_start().starts_with('['))
        .unwrap_or("[]");

    let raw: Vec<RawSnapshot> = serde_json::from_str(json_line)
        .map_err(|e| TimeLockerError::Other(anyhow::anyhow!("failed to parse snapshot listing: {e}")))?;

    Ok(raw
        .into_iter()
        .map(|r| Snapshot {
            id: r.id,
            timestamp: r.time,
            paths: r.paths.into_iter().collect::<BTreeSet<_>>(),
            tags: r.tags.into_iter().collect::<BTreeSet<_>>(),
            stats: SnapshotStats::default(),
        })
        .collect())
}

/// Splits a flat `FileSelection::to_engine_args()` fragment back into the
/// include-root positionals and the `--exclude` values interleaved after
/// them, so each can be routed to its own place in the engine invocation
/// (positionals vs. a repeated flag) instead of being passed through as one
/// opaque arg list.
fn split_selection_args(selection_args: &[String]) -> (Vec<String>, Vec<String>) {
    let mut files = Vec::new();
    let mut excludes = Vec::new();
    let mut args = selection_args.iter();
    while let Some(arg) = args.next() {
        if arg == "--exclude" {
            if let Some(pattern) = args.next() {
                excludes.push(pattern.clone());
            }
        } else {
            files.push(arg.clone());
        }
    }
    (files, excludes)
}

fn parse_engine_version(version_output: &str) -> Option<(u32, u32, u32)> {
    let version_token = version_output.split_whitespace().nth(1)?;
    let mut parts = version_token.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}

fn directory_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if let Ok(metadata) = entry.metadata() {
            if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

/// The full catalog of recognized engine subcommands, with parameter
/// schemas for the ones the core actually drives.
pub fn engine_definition() -> CommandDefinition {
    CommandDefinition::new("restic")
        .with_parameter(Parameter::new("json", ParameterStyle::DoubleDash))
        .with_parameter(
            Parameter::new("repo", ParameterStyle::DoubleDash).with_short("r", ParameterStyle::SingleDash),
        )
        .with_parameter(Parameter::new("password-file", ParameterStyle::DoubleDash))
        .with_parameter(Parameter::new("cache-dir", ParameterStyle::DoubleDash))
        .with_parameter(Parameter::new("no-cache", ParameterStyle::DoubleDash))
        .with_parameter(
            Parameter::new("quiet", ParameterStyle::DoubleDash).with_short("q", ParameterStyle::SingleDash),
        )
        .with_parameter(
            Parameter::new("verbose", ParameterStyle::DoubleDash).with_short("v", ParameterStyle::SingleDash),
        )
        .with_parameter(Parameter::new("insecure-tls", ParameterStyle::DoubleDash))
        .with_subcommand(CommandDefinition::new("init"))
        .with_subcommand(
            CommandDefinition::new("backup")
                .with_parameter(Parameter::new("exclude", ParameterStyle::Separate))
                .with_parameter(Parameter::new("tag", ParameterStyle::Separate))
                .with_parameter(Parameter::new("host", ParameterStyle::Separate))
                .with_synopsis(&["[FILE]..."]),
        )
        .with_subcommand(
            CommandDefinition::new("restore")
                .with_parameter(Parameter::new("include", ParameterStyle::Separate))
                .with_parameter(Parameter::new("exclude", ParameterStyle::Separate))
                .with_parameter(
                    Parameter::new("target", ParameterStyle::Separate)
                        .with_short("t", ParameterStyle::SingleDash)
                        .required(),
                )
                .with_synopsis(&["snapshotID"]),
        )
        .with_subcommand(
            CommandDefinition::new("snapshots")
                .with_parameter(Parameter::new("tag", ParameterStyle::Separate))
                .with_parameter(Parameter::new("host", ParameterStyle::Separate)),
        )
        .with_subcommand(
            CommandDefinition::new("check")
                .with_parameter(Parameter::new("read-data", ParameterStyle::DoubleDash))
                .with_parameter(Parameter::new("with-cache", ParameterStyle::DoubleDash))
                .with_synopsis(&["[snapshotID]"]),
        )
        .with_subcommand(
            CommandDefinition::new("stats")
                .with_parameter(Parameter::new("mode", ParameterStyle::Separate))
                .with_synopsis(&["[snapshotID]"]),
        )
        .with_subcommand(
            CommandDefinition::new("forget")
                .with_parameter(Parameter::new("keep-last", ParameterStyle::Separate))
                .with_parameter(Parameter::new("keep-hourly", ParameterStyle::Separate))
                .with_parameter(Parameter::new("keep-daily", ParameterStyle::Separate))
                .with_parameter(Parameter::new("keep-weekly", ParameterStyle::Separate))
                .with_parameter(Parameter::new("keep-monthly", ParameterStyle::Separate))
                .with_parameter(Parameter::new("keep-yearly", ParameterStyle::Separate))
                .with_parameter(Parameter::new("keep-within", ParameterStyle::Separate))
                .with_parameter(Parameter::new("keep-tag", ParameterStyle::Separate))
                .with_parameter(Parameter::new("prune", ParameterStyle::DoubleDash))
                .with_synopsis(&["[snapshotID]..."]),
        )
        .with_subcommand(
            CommandDefinition::new("prune")
                .with_parameter(Parameter::new("max-unused", ParameterStyle::Separate)),
        )
        .with_subcommand(
            CommandDefinition::new("tag")
                .with_parameter(Parameter::new("add", ParameterStyle::Separate))
                .with_parameter(Parameter::new("remove", ParameterStyle::Separate))
                .with_synopsis(&["snapshotID"]),
        )
        .with_subcommand(CommandDefinition::new("find").with_synopsis(&["pattern"]))
        .with_subcommand(CommandDefinition::new("ls").with_synopsis(&["snapshotID"]))
        .with_subcommand(CommandDefinition::new("cat").with_synopsis(&["type", "ID"]))
        .with_subcommand(CommandDefinition::new("diff").with_synopsis(&["snapshotID", "snapshotID"]))
        .with_subcommand(CommandDefinition::new("mount").with_synopsis(&["mountpoint"]))
        .with_subcommand(
            CommandDefinition::new("unlock")
                .with_parameter(Parameter::new("remove-all", ParameterStyle::DoubleDash)),
        )
        .with_subcommand(
            CommandDefinition::new("copy").with_parameter(Parameter::new("from-repo", ParameterStyle::Separate)),
        )
        .with_subcommand(CommandDefinition::new("rebuild-index"))
        .with_subcommand(CommandDefinition::new("migrate").with_synopsis(&["name"]))
        .with_subcommand(CommandDefinition::new("repair"))
        .with_subcommand(CommandDefinition::new("dump").with_synopsis(&["snapshotID", "path"]))
        .with_subcommand(CommandDefinition::new("key"))
        .with_subcommand(CommandDefinition::new("recover"))
        .with_subcommand(CommandDefinition::new("rewrite").with_synopsis(&["snapshotID"]))
        .with_subcommand(CommandDefinition::new("self-update"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_uri_is_file_scheme() {
        let repo = Repository::new("r1", RepositoryKind::Local { path: PathBuf::from("/backup/r1") });
        assert_eq!(repo.uri(), "file:///backup/r1");
    }

    #[test]
    fn s3_uri_matches_convention() {
        let repo = Repository::new(
            "r2",
            RepositoryKind::S3 {
                bucket: "mybucket".into(),
                prefix: "backups".into(),
                region: "us-east-1".into(),
                access_key_id: "AKIA".into(),
                secret_access_key: "secret".into(),
            },
        );
        assert_eq!(repo.uri(), "s3:us-east-1.amazonaws.com/mybucket/backups");
    }

    #[test]
    fn password_missing_when_no_source_present() {
        let repo = Repository::new("r3", RepositoryKind::Local { path: PathBuf::from("/tmp/r3") });
        assert!(repo.password().unwrap().is_none());
    }

    #[test]
    fn explicit_password_wins() {
        let repo = Repository::new("r4", RepositoryKind::Local { path: PathBuf::from("/tmp/r4") })
            .with_password("hunter2");
        assert_eq!(repo.password().unwrap(), Some("hunter2".to_string()));
    }

    #[test]
    fn to_env_is_cached() {
        let repo = Repository::new("r5", RepositoryKind::Local { path: PathBuf::from("/tmp/r5") })
            .with_password("pw");
        let first = repo.to_env().unwrap();
        let second = repo.to_env().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.get(PASSWORD_ENV), Some(&"pw".to_string()));
    }

    #[test]
    fn parses_status_line() {
        let line = r#"{"message_type":"status","percent_done":0.5,"total_files":10,"files_done":5}"#;
        match parse_engine_line(line) {
            EngineEvent::Status(s) => assert_eq!(s.files_done, 5),
            _ => panic!("expected status event"),
        }
    }

    #[test]
    fn parses_summary_line() {
        let line = r#"{"message_type":"summary","snapshot_id":"abc123","files_new":3}"#;
        match parse_engine_line(line) {
            EngineEvent::Summary(s) => assert_eq!(s.snapshot_id.as_deref(), Some("abc123")),
            _ => panic!("expected summary event"),
        }
    }

    #[test]
    fn malformed_line_becomes_other() {
        match parse_engine_line("not json at all") {
            EngineEvent::Other(raw) => assert_eq!(raw, "not json at all"),
            _ => panic!("expected other event"),
        }
    }

    #[test]
    fn version_parsing_handles_standard_output() {
        let output = "restic 0.16.2 compiled with go1.21.0 on linux/amd64";
        assert_eq!(parse_engine_version(output), Some((0, 16, 2)));
    }
}
