//! # Error Types
//!
//! Defines a structured error hierarchy for the backup orchestration layer
//! using `thiserror`. Each error variant carries enough context for
//! meaningful diagnostics without exposing raw engine stderr to callers —
//! that detail is attached separately as `details` by the integration layer
//! rather than folded into the error message itself.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type encompassing all failure modes in the system.
#[derive(Error, Debug)]
pub enum TimeLockerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("engine execution error: {0}")]
    Engine(#[from] EngineExecutionError),

    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("ambiguous snapshot prefix '{prefix}': matched {count} snapshots")]
    AmbiguousSnapshot { prefix: String, count: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found (searched: {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {message}")]
    Validation { message: String },

    #[error("unknown repository reference: {0}")]
    UnknownRepository(String),

    #[error("unknown backup target reference: {0}")]
    UnknownTarget(String),

    #[error("invalid retention policy: {message}")]
    InvalidRetentionPolicy { message: String },
}

/// Invariant/validation failures raised by the file selection engine and
/// other value types, ahead of any I/O.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("at least one directory-shaped entry must be included in the backup selection")]
    EmptyIncludeSet,

    #[error("unknown pattern group: {0}")]
    UnknownPatternGroup(String),

    #[error("malformed pattern: {0}")]
    MalformedPattern(String),
}

/// Errors during the backup process.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("source path does not exist: {0}")]
    SourceNotFound(PathBuf),

    #[error("backup target '{0}' not found")]
    TargetNotFound(String),

    #[error("no password available for repository '{0}'")]
    PasswordMissing(String),

    #[error("backup failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: String,
        #[source]
        source: Box<BackupError>,
    },

    #[error("engine execution failed: {0}")]
    Engine(#[from] EngineExecutionError),

    #[error("no changes detected since last snapshot")]
    NothingChanged,

    #[error("backup cancelled by caller")]
    Cancelled,
}

/// Errors during restoration.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("blob missing from repository: {hash}")]
    BlobMissing { hash: String },

    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    IntegrityFailure {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("target directory already exists and conflict policy does not allow overwrite: {0}")]
    TargetExists(PathBuf),

    #[error("insufficient free space at target: need {needed} bytes, have {available} bytes")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("engine execution failed: {0}")]
    Engine(#[from] EngineExecutionError),
}

/// Repository structure, reachability, and engine-version errors.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("repository not initialized at {0}")]
    NotInitialized(String),

    #[error("repository already exists at {0}")]
    AlreadyExists(String),

    #[error("corrupted repository: {message}")]
    Corrupted { message: String },

    #[error("repository backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("snapshot engine executable not found: {0}")]
    EngineNotFound(String),

    #[error("snapshot engine version {found} is older than required minimum {required}")]
    EngineVersionTooOld { found: String, required: String },

    #[error("no password available for this repository")]
    PasswordMissing,
}

/// Raised when the external snapshot engine process exits non-zero.
#[derive(Error, Debug)]
#[error("engine exited with code {code:?}: {stderr}")]
pub struct EngineExecutionError {
    pub code: Option<i32>,
    pub stderr: String,
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: invalid key length")]
    InvalidKeyLength,

    #[error("decryption failed: authentication tag mismatch (corrupted or wrong key)")]
    DecryptionFailed,

    #[error("key derivation failed")]
    KeyDerivation,
}

/// Credential store errors.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("credential store is locked")]
    Locked,

    #[error("wrong master password")]
    WrongPassword,

    #[error("credential store is locked out until {until}")]
    LockedOut { until: String },

    #[error("credential integrity check failed — store refuses to operate until reconciled")]
    IntegrityFailure,

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("no credential store exists yet")]
    NotCreated,

    #[error("credential store already exists")]
    AlreadyExists,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Security-service errors (distinct from credential errors, which guard
/// the secret store specifically).
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("emergency lockdown is active: {reason}")]
    LockdownActive { reason: String },

    #[error("invalid security configuration: {0:?}")]
    InvalidConfig(Vec<String>),
}

pub type Result<T> = std::result::Result<T, TimeLockerError>;
