//! Backup records and artifact naming.
//!
//! Everything a record needs besides its digest and size is encoded in the
//! artifact file name, `node-<kind>-<timestamp>.dra[.enc]`, so both tiers can
//! be listed without a separate index.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const ARTIFACT_PREFIX: &str = "node-";
pub const ARCHIVE_EXT: &str = ".dra";
pub const ENCRYPTED_EXT: &str = ".enc";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    Full,
    Incremental,
    Test,
    FailoverSafety,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
            BackupKind::Test => "test",
            BackupKind::FailoverSafety => "failover-safety",
        }
    }

    /// Only incremental backups read a live node
    pub fn requires_quiesce(&self) -> bool {
        !matches!(self, BackupKind::Incremental)
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            "test" => Ok(BackupKind::Test),
            "failover-safety" => Ok(BackupKind::FailoverSafety),
            other => Err(format!("unknown backup kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Local,
    Remote,
    Both,
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageTier::Local => "local",
            StorageTier::Remote => "remote",
            StorageTier::Both => "both",
        })
    }
}

/// Identity of a backup as encoded in its artifact file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordName {
    pub id: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub encrypted: bool,
}

impl RecordName {
    pub fn new(kind: BackupKind, created_at: DateTime<Utc>, encrypted: bool) -> Self {
        Self {
            id: format_id(kind, created_at),
            kind,
            created_at,
            encrypted,
        }
    }

    /// Artifact file name for this record
    pub fn file_name(&self) -> String {
        format!(
            "{}{}{}{}",
            ARTIFACT_PREFIX,
            self.id,
            ARCHIVE_EXT,
            if self.encrypted { ENCRYPTED_EXT } else { "" }
        )
    }

    /// Parse an artifact file name; anything else (sidecars, partial files,
    /// foreign files) yields `None`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let rest = file_name.strip_prefix(ARTIFACT_PREFIX)?;
        let (rest, encrypted) = match rest.strip_suffix(ENCRYPTED_EXT) {
            Some(r) => (r, true),
            None => (rest, false),
        };
        let id = rest.strip_suffix(ARCHIVE_EXT)?;
        let (kind, created_at) = parse_id(id)?;
        Some(Self {
            id: id.to_string(),
            kind,
            created_at,
            encrypted,
        })
    }
}

/// `<kind>-<timestamp>` with millisecond precision
pub fn format_id(kind: BackupKind, created_at: DateTime<Utc>) -> String {
    format!("{}-{}", kind, created_at.format(TIMESTAMP_FORMAT))
}

/// Split an identifier back into its kind and creation time
pub fn parse_id(id: &str) -> Option<(BackupKind, DateTime<Utc>)> {
    let (kind, ts) = id.rsplit_once('-')?;
    let kind = kind.parse().ok()?;
    let created_at = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    Some((kind, created_at))
}

/// A verified, immutable backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub artifact_path: PathBuf,
    /// Hex SHA-256 of the final artifact bytes
    pub digest: String,
    pub encrypted: bool,
    pub size: u64,
    pub tier: StorageTier,
}

impl BackupRecord {
    pub fn name(&self) -> RecordName {
        RecordName {
            id: self.id.clone(),
            kind: self.kind,
            created_at: self.created_at,
            encrypted: self.encrypted,
        }
    }
}

/// Newest first: creation time, then identifier, both descending
pub fn newest_first(a: &RecordName, b: &RecordName) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_name_roundtrip() {
        let created = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap()
            + chrono::Duration::milliseconds(89);
        for kind in [
            BackupKind::Full,
            BackupKind::Incremental,
            BackupKind::Test,
            BackupKind::FailoverSafety,
        ] {
            for encrypted in [false, true] {
                let name = RecordName::new(kind, created, encrypted);
                let parsed = RecordName::parse(&name.file_name()).unwrap();
                assert_eq!(parsed, name);
            }
        }
        assert_eq!(
            RecordName::new(BackupKind::FailoverSafety, created, true).file_name(),
            "node-failover-safety-20260304T050607089Z.dra.enc"
        );
    }

    #[test]
    fn test_foreign_names_are_ignored() {
        assert!(RecordName::parse("node-full-20260304T050607089Z.dra.sha256").is_none());
        assert!(RecordName::parse(".partial-node-full-20260304T050607089Z.dra").is_none());
        assert!(RecordName::parse("node-weekly-20260304T050607089Z.dra").is_none());
        assert!(RecordName::parse("README").is_none());
    }

    #[test]
    fn test_newest_first_breaks_ties_by_id() {
        let a = RecordName::new(BackupKind::Full, ts(1_000), false);
        let b = RecordName::new(BackupKind::Incremental, ts(1_000), false);
        let c = RecordName::new(BackupKind::Full, ts(500), false);

        let mut names = vec![c.clone(), a.clone(), b.clone()];
        names.sort_by(newest_first);
        // "incremental-..." > "full-..." lexically
        assert_eq!(names, vec![b, a, c]);
    }
}
