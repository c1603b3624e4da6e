//! # Snapshot Model & Service
//!
//! A snapshot is an immutable point-in-time record produced by the engine —
//! this module does not create them, only models, filters, and caches them.
//! [`SnapshotService`] lists/filters snapshots via a [`crate::repository::Repository`]
//! and caches the last full listing with a freshness window, so repeated
//! filtered queries (e.g. from a CLI `list` command with different flags)
//! don't each re-invoke the engine.

use crate::error::{Result, TimeLockerError};
use crate::repository::Repository;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// An immutable point-in-time record in a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub paths: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub stats: SnapshotStats,
}

/// Summary statistics the engine reports for a snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct SnapshotStats {
    pub total_size: u64,
    pub total_files: u64,
    pub unique_files: u64,
}

impl Snapshot {
    /// Short display form of the id, as the engine's own CLI renders it.
    pub fn short_id(&self) -> &str {
        crate::hasher::short_hash(&self.id, 8)
    }
}

/// Conjunctive filter criteria over a snapshot listing. An empty filter
/// (all fields `None`/empty) matches everything.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub tags: BTreeSet<String>,
    pub paths: BTreeSet<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub max_results: Option<usize>,
}

impl SnapshotFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_paths(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.paths = paths.into_iter().collect();
        self
    }

    pub fn with_date_range(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.date_from = from;
        self.date_to = to;
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    /// `tags` matches if at least one required tag is present on the
    /// snapshot (set-intersection non-empty); `paths` likewise.
    fn matches(&self, snapshot: &Snapshot) -> bool {
        if !self.tags.is_empty() && self.tags.is_disjoint(&snapshot.tags) {
            return false;
        }
        if !self.paths.is_empty() && self.paths.is_disjoint(&snapshot.paths) {
            return false;
        }
        if let Some(from) = self.date_from {
            if snapshot.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if snapshot.timestamp > to {
                return false;
            }
        }
        true
    }
}

/// Applies a filter to an already-newest-first-sorted listing.
fn apply_filter(snapshots: &[Snapshot], filter: &SnapshotFilter) -> Vec<Snapshot> {
    let mut matched: Vec<Snapshot> = snapshots
        .iter()
        .filter(|s| filter.matches(s))
        .cloned()
        .collect();
    if let Some(max) = filter.max_results {
        matched.truncate(max);
    }
    matched
}

/// Summary view of a snapshot, for display purposes.
#[derive(Debug, Clone)]
pub struct SnapshotSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub paths: Vec<String>,
    pub tags: Vec<String>,
    pub repository: String,
    pub size: u64,
    pub file_count: u64,
}

struct Cache {
    fetched_at: Instant,
    snapshots: Vec<Snapshot>,
}

/// Lists and filters snapshots from a repository, caching the last full
/// listing for `ttl`.
pub struct SnapshotService {
    ttl: Duration,
    cache: Option<Cache>,
}

impl SnapshotService {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, cache: None }
    }

    fn cache_fresh(&self) -> bool {
        self.cache
            .as_ref()
            .is_some_and(|c| c.fetched_at.elapsed() < self.ttl)
    }

    /// Returns the full, newest-first listing, re-querying the repository
    /// if the cache is stale or `force_refresh` is set.
    fn fetch_all(&mut self, repository: &Repository, force_refresh: bool) -> Result<Vec<Snapshot>> {
        if !force_refresh && self.cache_fresh() {
            return Ok(self.cache.as_ref().unwrap().snapshots.clone());
        }

        let mut snapshots = repository.snapshots(None)?;
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        self.cache = Some(Cache {
            fetched_at: Instant::now(),
            snapshots: snapshots.clone(),
        });

        Ok(snapshots)
    }

    /// Lists snapshots matching `filter` (or all, if `None`), newest first.
    pub fn list_snapshots(
        &mut self,
        repository: &Repository,
        filter: Option<&SnapshotFilter>,
        force_refresh: bool,
    ) -> Result<Vec<Snapshot>> {
        let all = self.fetch_all(repository, force_refresh)?;
        match filter {
            Some(f) => Ok(apply_filter(&all, f)),
            None => Ok(all),
        }
    }

    /// Matches by id prefix; exactly one match is required.
    pub fn get_snapshot_by_id(&mut self, repository: &Repository, prefix: &str) -> Result<Snapshot> {
        let all = self.fetch_all(repository, false)?;
        let matches: Vec<&Snapshot> = all.iter().filter(|s| s.id.starts_with(prefix)).collect();

        match matches.len() {
            0 => Err(TimeLockerError::SnapshotNotFound(prefix.to_string())),
            1 => Ok(matches[0].clone()),
            count => Err(TimeLockerError::AmbiguousSnapshot {
                prefix: prefix.to_string(),
                count,
            }),
        }
    }

    pub fn get_latest_snapshot(
        &mut self,
        repository: &Repository,
        filter: Option<&SnapshotFilter>,
    ) -> Result<Option<Snapshot>> {
        Ok(self.list_snapshots(repository, filter, false)?.into_iter().next())
    }

    /// Snapshots whose timestamp falls within `tolerance_hours` of `target`.
    pub fn get_snapshots_by_date(
        &mut self,
        repository: &Repository,
        target: DateTime<Utc>,
        tolerance_hours: i64,
    ) -> Result<Vec<Snapshot>> {
        let tolerance = ChronoDuration::hours(tolerance_hours);
        let all = self.fetch_all(repository, false)?;
        Ok(all
            .into_iter()
            .filter(|s| (s.timestamp - target).abs() <= tolerance)
            .collect())
    }

    pub fn get_snapshot_summary(&self, snapshot: &Snapshot, repository_name: &str) -> SnapshotSummary {
        SnapshotSummary {
            id: snapshot.id.clone(),
            timestamp: snapshot.timestamp,
            paths: snapshot.paths.iter().cloned().collect(),
            tags: snapshot.tags.iter().cloned().collect(),
            repository: repository_name.to_string(),
            size: snapshot.stats.total_size,
            file_count: snapshot.stats.total_files,
        }
    }

    pub fn clear_cache(&mut self) {
        self.cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: &str, tags: &[&str], paths: &[&str], hours_ago: i64) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            timestamp: Utc::now() - ChronoDuration::hours(hours_ago),
            paths: paths.iter().map(|s| s.to_string()).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            stats: SnapshotStats::default(),
        }
    }

    #[test]
    fn filter_by_tag_matches_intersection() {
        let snapshots = vec![
            snap("s1", &["full", "docs"], &["/u/docs"], 144),
            snap("s2", &["incremental", "docs"], &["/u/docs"], 72),
            snap("s3", &["full", "photos"], &["/u/photos"], 0),
        ];
        let filter = SnapshotFilter::new().with_tags(["full".to_string()]);
        let result = apply_filter(&snapshots, &filter);
        assert_eq!(result.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["s1", "s3"]);
    }

    #[test]
    fn max_results_truncates_after_sort() {
        let snapshots = vec![
            snap("s3", &[], &[], 0),
            snap("s2", &[], &[], 72),
            snap("s1", &[], &[], 144),
        ];
        let filter = SnapshotFilter::new().with_max_results(1);
        let result = apply_filter(&snapshots, &filter);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "s3");
    }

    #[test]
    fn empty_filter_matches_all() {
        let snapshots = vec![snap("s1", &[], &[], 1), snap("s2", &[], &[], 2)];
        let result = apply_filter(&snapshots, &SnapshotFilter::new());
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn filter_monotonicity_adding_criterion_only_shrinks() {
        let snapshots = vec![
            snap("s1", &["full"], &[], 1),
            snap("s2", &["incremental"], &[], 2),
        ];
        let loose = apply_filter(&snapshots, &SnapshotFilter::new());
        let strict = apply_filter(&snapshots, &SnapshotFilter::new().with_tags(["full".to_string()]));
        assert!(strict.iter().all(|s| loose.iter().any(|l| l.id == s.id)));
    }
}
