//! # Security Service
//!
//! Maintains the append-only, pipe-delimited audit log external log
//! shippers depend on, and the emergency-lockdown marker file the
//! orchestrator checks before any operation. Distinct from
//! [`crate::credential::CredentialStore`]'s own internal audit trail, which
//! only covers the credential store's own operations.

use crate::config::SecurityConfig;
use crate::repository::Repository;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuditLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl AuditLevel {
    fn as_str(self) -> &'static str {
        match self {
            AuditLevel::Low => "low",
            AuditLevel::Medium => "medium",
            AuditLevel::High => "high",
            AuditLevel::Critical => "critical",
        }
    }
}

/// An append-only, security-relevant action record.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub level: AuditLevel,
    pub description: String,
    pub user_id: Option<String>,
    pub repository_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>, level: AuditLevel, description: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            level,
            description: description.into(),
            user_id: None,
            repository_id: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_repository(mut self, repository_id: impl Into<String>) -> Self {
        self.repository_id = Some(repository_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `timestamp|event_type|level|description|metadata-json` — this exact
    /// shape is part of the external contract for log shippers.
    fn to_line(&self) -> String {
        let metadata_json = serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".to_string());
        format!(
            "{}|{}|{}|{}|{}",
            self.timestamp.to_rfc3339(),
            self.event_type,
            self.level.as_str(),
            self.description,
            metadata_json,
        )
    }

    fn parse_line(line: &str) -> Option<AuditEvent> {
        let mut parts = line.splitn(5, '|');
        let timestamp = DateTime::parse_from_rfc3339(parts.next()?).ok()?.with_timezone(&Utc);
        let event_type = parts.next()?.to_string();
        let level = match parts.next()? {
            "low" => AuditLevel::Low,
            "medium" => AuditLevel::Medium,
            "high" => AuditLevel::High,
            "critical" => AuditLevel::Critical,
            _ => return None,
        };
        let description = parts.next()?.to_string();
        let metadata: BTreeMap<String, String> =
            parts.next().and_then(|m| serde_json::from_str(m).ok()).unwrap_or_default();

        Some(AuditEvent {
            timestamp,
            event_type,
            level,
            description,
            user_id: None,
            repository_id: None,
            metadata,
        })
    }
}

pub type EventHandler = Box<dyn Fn(&AuditEvent) + Send + Sync>;

pub struct SecurityConfigValidation {
    pub valid: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EncryptionStatus {
    pub is_encrypted: bool,
    pub encryption_algorithm: Option<String>,
    pub key_derivation: Option<String>,
    pub last_verified: DateTime<Utc>,
    pub verification_hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SecuritySummary {
    pub by_event_type: BTreeMap<String, u64>,
    pub by_level: BTreeMap<String, u64>,
    pub total: u64,
}

/// Audit log + emergency lockdown marker + handler fan-out.
pub struct SecurityService {
    audit_log_path: PathBuf,
    lockdown_marker_path: PathBuf,
    handlers: Vec<EventHandler>,
}

impl SecurityService {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        Self {
            audit_log_path: config_dir.join("security").join("audit.log"),
            lockdown_marker_path: config_dir.join("emergency_lockdown.marker"),
            handlers: Vec::new(),
        }
    }

    pub fn add_event_handler(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }

    pub fn remove_all_event_handlers(&mut self) {
        self.handlers.clear();
    }

    /// Writes the record, flushes, then invokes every handler. A handler
    /// panic/failure must not prevent the write or subsequent handlers, so
    /// each call is isolated with `catch_unwind`.
    pub fn log_security_event(&self, event: AuditEvent) {
        if let Some(parent) = self.audit_log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(&self.audit_log_path) {
            use std::io::Write;
            let _ = writeln!(file, "{}", event.to_line());
            let _ = file.flush();
        }

        for handler in &self.handlers {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event)));
        }
    }

    /// Encryption is implied present iff the repository has an effective
    /// password.
    pub fn verify_repository_encryption(&self, repository: &Repository) -> EncryptionStatus {
        let has_password = repository.password().ok().flatten().is_some();
        EncryptionStatus {
            is_encrypted: has_password,
            encryption_algorithm: has_password.then(|| "AES-256-GCM".to_string()),
            key_derivation: has_password.then(|| "scrypt".to_string()),
            last_verified: Utc::now(),
            verification_hash: None,
        }
    }

    pub fn validate_backup_integrity(&self, repository: &Repository, snapshot_id: Option<&str>) -> bool {
        repository
            .verify_backup_comprehensive(snapshot_id)
            .map(|r| r.success)
            .unwrap_or(false)
    }

    pub fn audit_backup_operation(
        &self,
        repository: &Repository,
        operation_type: &str,
        targets: Option<&[String]>,
        success: bool,
    ) {
        let mut event = AuditEvent::new(
            "backup_operation",
            if success { AuditLevel::Low } else { AuditLevel::High },
            format!("{operation_type} on repository {}", repository.id()),
        )
        .with_repository(repository.id());
        if let Some(targets) = targets {
            event = event.with_metadata("targets", targets.join(","));
        }
        self.log_security_event(event);
    }

    pub fn audit_restore_operation(&self, repository: &Repository, success: bool, snapshot_id: &str) {
        self.log_security_event(
            AuditEvent::new(
                "restore_operation",
                if success { AuditLevel::Low } else { AuditLevel::High },
                format!("restore of snapshot {snapshot_id}"),
            )
            .with_repository(repository.id()),
        );
    }

    pub fn audit_credential_access(&self, credential_id: &str, operation: &str, success: bool) {
        self.log_security_event(
            AuditEvent::new(
                "credential_access",
                if success { AuditLevel::Medium } else { AuditLevel::High },
                format!("{operation} on credential {credential_id}"),
            )
            .with_metadata("credential_id", credential_id),
        );
    }

    pub fn audit_integrity_check(&self, repository: &Repository, check_type: &str, success: bool) {
        self.log_security_event(
            AuditEvent::new(
                "integrity_check",
                if success { AuditLevel::Low } else { AuditLevel::Critical },
                format!("{check_type} integrity check"),
            )
            .with_repository(repository.id()),
        );
    }

    pub fn validate_security_config(&self, cfg: &SecurityConfig) -> SecurityConfigValidation {
        let mut issues = Vec::new();

        if !cfg.encryption_enabled {
            issues.push("encryption_enabled must be true".to_string());
        }
        if !cfg.audit_logging {
            issues.push("audit_logging must be true".to_string());
        }
        if cfg.credential_timeout < 60 {
            issues.push("credential_timeout must be >= 60".to_string());
        }
        if cfg.max_failed_attempts < 1 {
            issues.push("max_failed_attempts must be >= 1".to_string());
        }

        SecurityConfigValidation { valid: issues.is_empty(), issues }
    }

    /// Writes the lockdown marker and emits a critical audit event;
    /// subsequent orchestrator calls observe the marker via
    /// [`Self::is_lockdown_active`] and refuse to operate until cleared.
    pub fn emergency_lockdown(&self, reason: &str) {
        if let Some(parent) = self.lockdown_marker_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(&self.lockdown_marker_path, reason);
        self.log_security_event(AuditEvent::new(
            "emergency_lockdown",
            AuditLevel::Critical,
            reason.to_string(),
        ));
    }

    pub fn clear_lockdown(&self) -> std::io::Result<()> {
        if self.lockdown_marker_path.exists() {
            fs::remove_file(&self.lockdown_marker_path)?;
        }
        Ok(())
    }

    pub fn is_lockdown_active(&self) -> bool {
        self.lockdown_marker_path.exists()
    }

    pub fn get_security_summary(&self, days: i64) -> SecuritySummary {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut summary = SecuritySummary::default();

        let Ok(content) = fs::read_to_string(&self.audit_log_path) else {
            return summary;
        };

        for line in content.lines() {
            let Some(event) = AuditEvent::parse_line(line) else { continue };
            if event.timestamp < cutoff {
                continue;
            }
            summary.total += 1;
            *summary.by_event_type.entry(event.event_type).or_insert(0) += 1;
            *summary.by_level.entry(event.level.as_str().to_string()).or_insert(0) += 1;
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn event_round_trips_through_pipe_format() {
        let event = AuditEvent::new("unlock", AuditLevel::Medium, "test unlock").with_metadata("k", "v");
        let line = event.to_line();
        let parsed = AuditEvent::parse_line(&line).unwrap();
        assert_eq!(parsed.event_type, "unlock");
        assert_eq!(parsed.level, AuditLevel::Medium);
        assert_eq!(parsed.metadata.get("k"), Some(&"v".to_string()));
    }

    #[test]
    fn log_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let service = SecurityService::new(dir.path());
        service.log_security_event(AuditEvent::new("a", AuditLevel::Low, "first"));
        service.log_security_event(AuditEvent::new("b", AuditLevel::Low, "second"));

        let content = fs::read_to_string(dir.path().join("security").join("audit.log")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn handler_panic_does_not_break_logging_or_other_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = SecurityService::new(dir.path());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        service.add_event_handler(Box::new(|_| panic!("boom")));
        service.add_event_handler(Box::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        service.log_security_event(AuditEvent::new("x", AuditLevel::Low, "y"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lockdown_marker_gates_operation() {
        let dir = tempfile::tempdir().unwrap();
        let service = SecurityService::new(dir.path());
        assert!(!service.is_lockdown_active());
        service.emergency_lockdown("manual test");
        assert!(service.is_lockdown_active());
        service.clear_lockdown().unwrap();
        assert!(!service.is_lockdown_active());
    }

    #[test]
    fn validate_config_flags_low_credential_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let service = SecurityService::new(dir.path());
        let cfg = SecurityConfig {
            encryption_enabled: true,
            audit_logging: true,
            credential_timeout: 10,
            max_failed_attempts: 5,
            lockout_duration: 60,
        };
        let result = service.validate_security_config(&cfg);
        assert!(!result.valid);
        assert!(result.issues.iter().any(|i| i.contains("credential_timeout")));
    }
}
