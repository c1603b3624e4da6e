//! # Retention Policy
//!
//! A declarative specification of which snapshots the engine's `forget`
//! subcommand should keep. Valid iff at least one field is set — an empty
//! policy is ambiguous (keep everything? keep nothing?) and is rejected
//! before it ever reaches [`crate::repository::Repository::apply_retention_policy`].

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
    pub keep_within: Option<String>,
    #[serde(default)]
    pub keep_tags: Vec<String>,
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        let any_set = self.keep_last.is_some()
            || self.keep_hourly.is_some()
            || self.keep_daily.is_some()
            || self.keep_weekly.is_some()
            || self.keep_monthly.is_some()
            || self.keep_yearly.is_some()
            || self.keep_within.is_some()
            || !self.keep_tags.is_empty();

        if !any_set {
            return Err(ConfigError::InvalidRetentionPolicy {
                message: "at least one retention field must be set".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_policy_is_invalid() {
        assert!(RetentionPolicy::default().validate().is_err());
    }

    #[test]
    fn single_field_is_valid() {
        let policy = RetentionPolicy {
            keep_last: Some(5),
            ..Default::default()
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn tags_only_is_valid() {
        let policy = RetentionPolicy {
            keep_tags: vec!["important".to_string()],
            ..Default::default()
        };
        assert!(policy.validate().is_ok());
    }

    proptest::proptest! {
        /// `validate()` must agree with "at least one field set" for any
        /// combination, not just the handful of cases spelled out above.
        #[test]
        fn validity_matches_any_field_set(
            keep_last in proptest::option::of(0u32..1000),
            keep_hourly in proptest::option::of(0u32..1000),
            keep_within in proptest::option::of("[0-9]{1,2}m"),
            keep_tags in proptest::collection::vec("[a-z]{1,8}", 0..3),
        ) {
            let any_set = keep_last.is_some() || keep_hourly.is_some() || keep_within.is_some() || !keep_tags.is_empty();
            let policy = RetentionPolicy { keep_last, keep_hourly, keep_within, keep_tags, ..Default::default() };
            proptest::prop_assert_eq!(policy.validate().is_ok(), any_set);
        }
    }
}
