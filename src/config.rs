//! # Configuration
//!
//! Handles loading, parsing, and validation of the single JSON configuration
//! document at `<config_dir>/timelocker.json`: repositories, backup targets,
//! settings, and security policy. Searches multiple standard locations with
//! a well-defined priority order, validates cross-references between
//! sections, then returns a typed document — never a duck-typed map.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{env, fs};

/// The root configuration document, persisted as a single UTF-8 JSON file.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryConfig>,
    #[serde(default)]
    pub backup_targets: BTreeMap<String, BackupTargetConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub security: SecurityConfig,
}

/// A named repository entry in the configuration document. `kind` selects
/// which backend-specific fields apply; unused fields are simply omitted
/// from the serialized document rather than left null.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RepositoryConfig {
    pub kind: String,
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// A named backup target entry.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BackupTargetConfig {
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Global defaults and policy toggles.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_verify_after_backup")]
    pub verify_after_backup: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            verify_after_backup: default_verify_after_backup(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            config_dir: default_config_dir(),
        }
    }
}

/// Security policy toggles (see `SecurityService::validate_security_config`
/// in [`crate::security`] for the rules these are checked against).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub encryption_enabled: bool,
    #[serde(default = "default_true")]
    pub audit_logging: bool,
    #[serde(default = "default_credential_timeout")]
    pub credential_timeout: u64,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_lockout_duration")]
    pub lockout_duration: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            encryption_enabled: true,
            audit_logging: true,
            credential_timeout: default_credential_timeout(),
            max_failed_attempts: default_max_failed_attempts(),
            lockout_duration: default_lockout_duration(),
        }
    }
}

fn default_verify_after_backup() -> bool {
    true
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_delay_secs() -> f64 {
    5.0
}
fn default_config_dir() -> PathBuf {
    PathBuf::from(".timelocker")
}
fn default_true() -> bool {
    true
}
fn default_credential_timeout() -> u64 {
    900
}
fn default_max_failed_attempts() -> u32 {
    5
}
fn default_lockout_duration() -> u64 {
    300
}

/// Standard configuration file search paths, in descending priority order.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/timelocker/timelocker.json")];
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(format!("{xdg}/timelocker/timelocker.json")));
    }
    if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(format!("{home}/.config/timelocker/timelocker.json")));
    }
    paths.push(PathBuf::from("timelocker.json"));
    paths
}

/// Loads configuration from the first found config file in the search path.
pub fn load_config() -> Result<Config> {
    let search = config_search_paths();

    for path in &search {
        if path.exists() {
            return load_config_from(path);
        }
    }

    Err(ConfigError::NotFound { searched: search }.into())
}

/// Loads and validates configuration from a specific file path.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;

    let config: Config =
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse { source: e })?;

    validate_config(&config)?;
    Ok(config)
}

/// Writes the document atomically (write-to-temp-then-rename), matching the
/// write discipline the credential store uses for its own persisted state.
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    validate_config(config)?;
    let serialized = serde_json::to_string_pretty(config)
        .map_err(|e| anyhow::anyhow!("failed to serialize config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, serialized)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Validates cross-references and policy bounds after parsing.
fn validate_config(config: &Config) -> std::result::Result<(), ConfigError> {
    for (name, target) in &config.backup_targets {
        if target.paths.is_empty() {
            return Err(ConfigError::Validation {
                message: format!("backup target '{name}' has no paths"),
            });
        }
    }

    if config.security.credential_timeout != 0 && config.security.credential_timeout < 60 {
        return Err(ConfigError::Validation {
            message: "security.credential_timeout must be 0 (disabled) or >= 60".to_string(),
        });
    }

    if config.security.max_failed_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "security.max_failed_attempts must be >= 1".to_string(),
        });
    }

    Ok(())
}

/// Resolves a named repository reference, erroring if unknown.
pub fn resolve_repository<'a>(
    config: &'a Config,
    name: &str,
) -> std::result::Result<&'a RepositoryConfig, ConfigError> {
    config
        .repositories
        .get(name)
        .ok_or_else(|| ConfigError::UnknownRepository(name.to_string()))
}

/// Resolves a named backup target reference, erroring if unknown.
pub fn resolve_target<'a>(
    config: &'a Config,
    name: &str,
) -> std::result::Result<&'a BackupTargetConfig, ConfigError> {
    config
        .backup_targets
        .get(name)
        .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))
}

/// Generates a default configuration document at the given path.
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(anyhow::anyhow!("config file already exists: {}", path.display()).into());
    }

    let mut config = Config::default();
    config.backup_targets.insert(
        "documents".to_string(),
        BackupTargetConfig {
            paths: vec![PathBuf::from("/home/user/Documents")],
            include_patterns: vec![],
            exclude_patterns: vec!["*.tmp".to_string(), "*.cache".to_string()],
            description: "Personal documents".to_string(),
        },
    );

    save_config(&config, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut config = Config::default();
        config.repositories.insert(
            "primary".to_string(),
            RepositoryConfig {
                kind: "local".to_string(),
                location: "/backup/primary".to_string(),
                description: "Primary repository".to_string(),
                bucket: None,
                prefix: None,
                region: None,
                account_id: None,
                user: None,
                host: None,
            },
        );
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.repositories.len(), 1);
    }

    #[test]
    fn rejects_target_with_no_paths() {
        let mut config = Config::default();
        config
            .backup_targets
            .insert("empty".to_string(), BackupTargetConfig::default());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_too_low_credential_timeout() {
        let mut config = Config::default();
        config.security.credential_timeout = 10;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn zero_credential_timeout_disables_check() {
        let mut config = Config::default();
        config.security.credential_timeout = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn unknown_repository_reference_errors() {
        let config = Config::default();
        assert!(resolve_repository(&config, "missing").is_err());
    }
}
