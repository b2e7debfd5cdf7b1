//! Age-based pruning of backup records.
//!
//! The same policy applies to the local and remote tiers, but each tier is
//! pruned on its own: a failure in one never stops deletions in the other.

use crate::store::{ArchiveStore, RecordName};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
}

impl RetentionPolicy {
    pub fn new(max_age_days: u32) -> Self {
        Self { max_age_days }
    }

    /// Records created strictly before this instant are expired
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.max_age_days))
    }

    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        created_at < self.cutoff(now)
    }
}

/// What a prune pass removed and what it could not
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub local_deleted: Vec<String>,
    pub remote_deleted: Vec<String>,
    pub failures: Vec<String>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for PruneReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pruned {} local and {} remote record(s), {} failure(s)",
            self.local_deleted.len(),
            self.remote_deleted.len(),
            self.failures.len()
        )
    }
}

pub struct RetentionManager {
    store: Arc<ArchiveStore>,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(store: Arc<ArchiveStore>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub async fn prune(&self) -> PruneReport {
        self.prune_at(Utc::now()).await
    }

    pub async fn prune_at(&self, now: DateTime<Utc>) -> PruneReport {
        let mut report = PruneReport::default();
        info!(
            "Pruning records older than {} days (cutoff {})",
            self.policy.max_age_days,
            self.policy.cutoff(now)
        );

        match self.store.list_local().await {
            Ok(records) => {
                for record in records
                    .into_iter()
                    .filter(|r| self.policy.is_expired(r.created_at, now))
                {
                    match self.store.delete_local(&record.name()).await {
                        Ok(_) => report.local_deleted.push(record.id),
                        Err(e) => {
                            warn!(record_id = %record.id, "Local delete failed: {}", e);
                            report.failures.push(format!("local {}: {}", record.id, e));
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Cannot list local tier: {}", e);
                report.failures.push(format!("local listing: {}", e));
            }
        }

        if self.store.has_remote() {
            match self.store.list_remote().await {
                Ok(names) => self.prune_remote(names, now, &mut report).await,
                Err(e) => {
                    warn!("Cannot list remote tier: {}", e);
                    report.failures.push(format!("remote listing: {}", e));
                }
            }
        }

        info!(
            local = report.local_deleted.len(),
            remote = report.remote_deleted.len(),
            failures = report.failures.len(),
            "Retention pass finished"
        );
        report
    }

    async fn prune_remote(&self, names: Vec<RecordName>, now: DateTime<Utc>, report: &mut PruneReport) {
        for name in names
            .into_iter()
            .filter(|n| self.policy.is_expired(n.created_at, now))
        {
            match self.store.delete_remote(&name).await {
                Ok(()) => report.remote_deleted.push(name.id),
                Err(e) => {
                    warn!(record_id = %name.id, "Remote delete failed: {}", e);
                    report.failures.push(format!("remote {}: {}", name.id, e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cutoff_is_exclusive() {
        let policy = RetentionPolicy::new(30);
        let now = Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap();
        let boundary = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        assert_eq!(policy.cutoff(now), boundary);
        assert!(!policy.is_expired(boundary, now));
        assert!(policy.is_expired(boundary - Duration::milliseconds(1), now));
        assert!(!policy.is_expired(now, now));
    }
}
