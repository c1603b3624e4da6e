//! # Timeshift Configuration Importer
//!
//! Converts an existing Timeshift (`timeshift.json`) configuration into a
//! [`crate::config::RepositoryConfig`] + [`crate::config::BackupTargetConfig`]
//! pair so a user migrating off Timeshift doesn't have to hand-translate
//! their exclude list. Timeshift and this tool model backups differently
//! (block-level BTRFS snapshots vs. file-level snapshots via the external
//! engine), so several fields only ever get a best-effort mapping — those
//! cases are surfaced as warnings rather than silently guessed at.

use crate::config::{BackupTargetConfig, RepositoryConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Standard locations Timeshift itself checks for its configuration file.
const CONFIG_LOCATIONS: &[&str] = &["/etc/timeshift/timeshift.json", "/etc/timeshift.json"];

const DEFAULT_SYSTEM_EXCLUDES: &[&str] = &[
    "**/proc/**",
    "**/sys/**",
    "**/dev/**",
    "**/tmp/**",
    "**/run/**",
    "**/mnt/**",
    "**/media/**",
    "**/.cache/**",
    "**/lost+found/**",
];

#[derive(Debug, Default)]
pub struct ImportResult {
    pub success: bool,
    pub repository_name: String,
    pub repository: Option<RepositoryConfig>,
    pub target_name: String,
    pub backup_target: Option<BackupTargetConfig>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ImportResult {
    fn failed(error: impl Into<String>) -> Self {
        Self { errors: vec![error.into()], ..Default::default() }
    }
}

/// Finds a readable Timeshift configuration file at one of the standard
/// locations.
pub fn find_config_file() -> Option<PathBuf> {
    CONFIG_LOCATIONS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file() && std::fs::read_to_string(path).is_ok())
}

fn parse_config(path: &Path) -> Result<Value, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&content).map_err(|e| format!("invalid JSON in {}: {e}", path.display()))
}

/// `blkid -U <uuid>` then `findmnt -n -o TARGET <device>`, the same two
/// external lookups Timeshift's own tooling uses to turn a device UUID into
/// a live mount point.
fn resolve_device_uuid_to_path(uuid: &str) -> Option<PathBuf> {
    if uuid.trim().is_empty() {
        return None;
    }
    let blkid = Command::new("blkid").arg("-U").arg(uuid).output().ok()?;
    if !blkid.status.success() {
        return None;
    }
    let device = String::from_utf8_lossy(&blkid.stdout).trim().to_string();
    if device.is_empty() {
        return None;
    }

    let findmnt = Command::new("findmnt").arg("-n").arg("-o").arg("TARGET").arg(&device).output().ok()?;
    if !findmnt.status.success() {
        return None;
    }
    let mount_point = String::from_utf8_lossy(&findmnt.stdout).trim().to_string();
    if mount_point.is_empty() {
        return None;
    }

    Some(PathBuf::from(mount_point).join("timeshift"))
}

/// Rewrites an absolute Timeshift exclude path into the recursive glob
/// shape our file selection engine expects; non-absolute entries are
/// assumed to already be patterns and passed through.
fn map_exclude_pattern(pattern: &str) -> Vec<String> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Vec::new();
    }
    if let Some(relative) = pattern.strip_prefix('/') {
        vec![format!("**/{relative}"), format!("**/{relative}/**")]
    } else {
        vec![pattern.to_string()]
    }
}

fn str_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Imports a Timeshift configuration, producing a repository + backup
/// target pair named `repository_name`/`target_name`. `manual_repository_path`
/// overrides UUID resolution when the backup device can't be found (e.g.
/// importing on a machine other than the one Timeshift ran on).
pub fn import_timeshift_config(
    config_path: Option<&Path>,
    repository_name: &str,
    target_name: &str,
    manual_repository_path: Option<&str>,
) -> ImportResult {
    let resolved_path = match config_path.map(PathBuf::from).or_else(find_config_file) {
        Some(p) => p,
        None => {
            return ImportResult::failed(format!(
                "no Timeshift configuration file found (checked: {})",
                CONFIG_LOCATIONS.join(", "),
            ))
        }
    };

    let config = match parse_config(&resolved_path) {
        Ok(c) => c,
        Err(e) => return ImportResult::failed(e),
    };

    let mut warnings = Vec::new();

    let backup_uuid = config.get("backup_device_uuid").and_then(Value::as_str).unwrap_or("").trim().to_string();

    let mut repository_path = manual_repository_path.map(str::to_string);
    if repository_path.is_none() && !backup_uuid.is_empty() {
        repository_path = resolve_device_uuid_to_path(&backup_uuid).map(|p| p.to_string_lossy().into_owned());
        if repository_path.is_none() {
            warnings.push(format!(
                "could not resolve backup device UUID '{backup_uuid}' to a mount path; specify the repository path manually",
            ));
        }
    }
    let repository_path = repository_path.unwrap_or_else(|| {
        warnings.push("using default path '/timeshift'; verify this is correct for your setup".to_string());
        "/timeshift".to_string()
    });

    let location = if repository_path.starts_with("file://")
        || repository_path.starts_with("s3://")
        || repository_path.starts_with("b2://")
        || repository_path.starts_with("sftp://")
    {
        repository_path.clone()
    } else {
        format!("file://{repository_path}")
    };

    let repository = RepositoryConfig {
        kind: "local".to_string(),
        location,
        description: format!("Imported from Timeshift (UUID: {})", if backup_uuid.is_empty() { "unknown" } else { &backup_uuid }),
        bucket: None,
        prefix: None,
        region: None,
        account_id: None,
        user: None,
        host: None,
    };

    if config.get("btrfs_mode").and_then(Value::as_str) == Some("true") {
        warnings.push(
            "Timeshift was configured for BTRFS snapshots; this tool performs file-level backups via an \
             external snapshot engine, which works differently — review the imported exclusions carefully"
                .to_string(),
        );
    }

    let mut exclude_patterns: Vec<String> = str_array(&config, "exclude")
        .into_iter()
        .chain(str_array(&config, "exclude-apps"))
        .flat_map(|p| map_exclude_pattern(&p))
        .collect();
    exclude_patterns.extend(DEFAULT_SYSTEM_EXCLUDES.iter().map(|s| s.to_string()));
    exclude_patterns.sort();
    exclude_patterns.dedup();

    warnings.push(
        "imported with a full-system backup path ('/') and exclusion patterns, matching Timeshift's default \
         behavior of backing up everything except specific directories"
            .to_string(),
    );

    let schedule_keys = ["hourly", "daily", "weekly", "monthly"];
    if schedule_keys.iter().any(|s| config.get(format!("schedule_{s}")).and_then(Value::as_str) == Some("true")) {
        warnings.push(
            "Timeshift scheduling flags were present but are not imported; configure backup scheduling \
             separately"
                .to_string(),
        );
    }

    let backup_target = BackupTargetConfig {
        paths: vec![PathBuf::from("/")],
        include_patterns: Vec::new(),
        exclude_patterns,
        description: "Imported from Timeshift - full system backup with exclusions".to_string(),
    };

    ImportResult {
        success: true,
        repository_name: repository_name.to_string(),
        repository: Some(repository),
        target_name: target_name.to_string(),
        backup_target: Some(backup_target),
        warnings,
        errors: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_absolute_exclude_to_recursive_glob_pair() {
        let mapped = map_exclude_pattern("/home/user/.thumbnails");
        assert_eq!(mapped, vec!["**/home/user/.thumbnails".to_string(), "**/home/user/.thumbnails/**".to_string()]);
    }

    #[test]
    fn passes_through_non_absolute_pattern() {
        assert_eq!(map_exclude_pattern("*.tmp"), vec!["*.tmp".to_string()]);
    }

    #[test]
    fn empty_pattern_maps_to_nothing() {
        assert!(map_exclude_pattern("   ").is_empty());
    }

    #[test]
    fn missing_config_file_is_reported_as_an_error() {
        let result = import_timeshift_config(Some(Path::new("/nonexistent/timeshift.json")), "r", "t", None);
        assert!(!result.success);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn manual_path_skips_uuid_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("timeshift.json");
        std::fs::write(&config_path, r#"{"backup_device_uuid": "deadbeef", "exclude": ["/var/log"]}"#).unwrap();

        let result = import_timeshift_config(Some(&config_path), "imported", "system", Some("/mnt/backup"));
        assert!(result.success);
        let repo = result.repository.unwrap();
        assert_eq!(repo.location, "file:///mnt/backup");
        assert!(!result.warnings.iter().any(|w| w.contains("could not resolve")));
    }
}
