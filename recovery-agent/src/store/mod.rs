//! Tiered storage of backup artifacts.
//!
//! The local tier is a flat directory holding `<artifact>` and
//! `<artifact>.sha256` pairs. The optional remote tier mirrors the same file
//! names as object keys. Lookups prefer the local tier and fall back to
//! downloading from the remote one.

pub mod object_store;
pub mod record;

use crate::integrity;
use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, Utc};
pub use object_store::{AwsCliObjectStore, FsObjectStore, ObjectStore};
pub use record::{BackupKind, BackupRecord, RecordName, StorageTier};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Selector accepted by `resolve`
pub const LATEST: &str = "latest";

const PARTIAL_PREFIX: &str = ".partial-";

/// A record known to at least one tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: RecordName,
    pub tier: StorageTier,
}

pub struct ArchiveStore {
    backup_dir: PathBuf,
    remote: Option<Arc<dyn ObjectStore>>,
}

impl ArchiveStore {
    pub fn new(backup_dir: impl Into<PathBuf>, remote: Option<Arc<dyn ObjectStore>>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            remote,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn artifact_path(&self, name: &RecordName) -> PathBuf {
        self.backup_dir.join(name.file_name())
    }

    /// Scratch path in the backup directory that listings never pick up
    pub fn staging_path(&self, name: &RecordName, suffix: &str) -> PathBuf {
        self.backup_dir
            .join(format!("{}{}{}", PARTIAL_PREFIX, name.file_name(), suffix))
    }

    /// Allocate a name for a new backup. Identifiers have millisecond
    /// precision; a clash with an existing local record moves the timestamp
    /// forward until the identifier is unique.
    pub async fn allocate(
        &self,
        kind: BackupKind,
        encrypted: bool,
        now: DateTime<Utc>,
    ) -> Result<RecordName> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let taken: Vec<String> = self.list_local().await?.into_iter().map(|r| r.id).collect();

        let mut created_at = now;
        loop {
            let name = RecordName::new(kind, created_at, encrypted);
            if !taken.contains(&name.id) {
                return Ok(name);
            }
            created_at += chrono::Duration::milliseconds(1);
        }
    }

    /// Turn a finished artifact into a record: write the sidecar holding the
    /// digest of the final bytes, then move the artifact into place.
    pub async fn commit(&self, staged: &Path, name: &RecordName, digest: String) -> Result<BackupRecord> {
        let final_path = self.artifact_path(name);
        let size = match persist(staged, &final_path, &digest).await {
            Ok(size) => size,
            Err(e) => {
                discard_all(&[staged, final_path.as_path(), integrity::sidecar_path(&final_path).as_path()]).await;
                return Err(e);
            }
        };

        info!(
            record_id = %name.id,
            digest = %digest,
            size,
            "Persisted backup artifact {}",
            final_path.display()
        );

        Ok(BackupRecord {
            id: name.id.clone(),
            kind: name.kind,
            created_at: name.created_at,
            artifact_path: final_path,
            digest,
            encrypted: name.encrypted,
            size,
            tier: StorageTier::Local,
        })
    }

    /// Upload an artifact and its sidecar to the remote tier
    pub async fn put(&self, record: &BackupRecord) -> Result<String> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| DrError::Config("no remote tier configured".into()))?;

        let file_name = record.name().file_name();
        let handle = remote.put(&record.artifact_path, &file_name).await?;
        remote
            .put(
                &integrity::sidecar_path(&record.artifact_path),
                &sidecar_key(&file_name),
            )
            .await?;

        info!(record_id = %record.id, "Uploaded backup to {}", handle);
        Ok(handle)
    }

    /// Records held in the local tier
    pub async fn list_local(&self) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(name) = RecordName::parse(&file_name) else {
                continue;
            };
            let path = entry.path();
            let digest = match integrity::read_sidecar(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Ignoring {} without a usable digest sidecar: {}", file_name, e);
                    continue;
                }
            };
            let size = entry.metadata().await?.len();
            records.push(BackupRecord {
                id: name.id,
                kind: name.kind,
                created_at: name.created_at,
                artifact_path: path,
                digest,
                encrypted: name.encrypted,
                size,
                tier: StorageTier::Local,
            });
        }

        records.sort_by(|a, b| record::newest_first(&a.name(), &b.name()));
        Ok(records)
    }

    /// Records held in the remote tier (artifacts with a matching sidecar)
    pub async fn list_remote(&self) -> Result<Vec<RecordName>> {
        let Some(remote) = &self.remote else {
            return Ok(Vec::new());
        };
        let keys = remote.list().await?;
        let mut names: Vec<RecordName> = keys
            .iter()
            .filter(|k| keys.contains(&sidecar_key(k)))
            .filter_map(|k| RecordName::parse(k))
            .collect();
        names.sort_by(record::newest_first);
        Ok(names)
    }

    /// Every known record, newest first, with the tier(s) holding it.
    /// A remote listing failure degrades to the local view.
    pub async fn list(&self) -> Result<Vec<CatalogEntry>> {
        let mut merged: BTreeMap<String, CatalogEntry> = BTreeMap::new();
        for record in self.list_local().await? {
            merged.insert(
                record.id.clone(),
                CatalogEntry {
                    name: record.name(),
                    tier: StorageTier::Local,
                },
            );
        }

        match self.list_remote().await {
            Ok(names) => {
                for name in names {
                    merged
                        .entry(name.id.clone())
                        .and_modify(|e| e.tier = StorageTier::Both)
                        .or_insert(CatalogEntry {
                            name,
                            tier: StorageTier::Remote,
                        });
                }
            }
            Err(e) => warn!("Remote tier unavailable, listing local records only: {}", e),
        }

        let mut entries: Vec<CatalogEntry> = merged.into_values().collect();
        entries.sort_by(|a, b| record::newest_first(&a.name, &b.name));
        Ok(entries)
    }

    /// Resolve an identifier or `latest` to a record available locally,
    /// downloading it from the remote tier when necessary.
    pub async fn resolve(&self, selector: &str) -> Result<BackupRecord> {
        let catalog = self.list().await?;
        let entry = if selector == LATEST {
            catalog.into_iter().next()
        } else {
            catalog.into_iter().find(|e| e.name.id == selector)
        }
        .ok_or_else(|| DrError::NotFound(selector.to_string()))?;

        debug!(record_id = %entry.name.id, tier = %entry.tier, "Resolved {}", selector);

        if entry.tier == StorageTier::Remote {
            return self.fetch(&entry.name).await;
        }

        let mut record = self
            .list_local()
            .await?
            .into_iter()
            .find(|r| r.id == entry.name.id)
            .ok_or_else(|| DrError::NotFound(selector.to_string()))?;
        record.tier = entry.tier;
        Ok(record)
    }

    /// Download a remote-only record into the local tier
    async fn fetch(&self, name: &RecordName) -> Result<BackupRecord> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| DrError::NotFound(name.id.clone()))?;
        tokio::fs::create_dir_all(&self.backup_dir).await?;

        let file_name = name.file_name();
        let final_path = self.artifact_path(name);
        let staged = self.staging_path(name, "");

        info!(record_id = %name.id, "Fetching backup from {}", remote.describe());
        if let Err(e) = remote.get(&file_name, &staged).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }
        let sidecar = integrity::sidecar_path(&final_path);
        let landed = async {
            remote.get(&sidecar_key(&file_name), &sidecar).await?;
            tokio::fs::rename(&staged, &final_path).await?;
            let digest = integrity::read_sidecar(&final_path)?;
            let size = tokio::fs::metadata(&final_path).await?.len();
            Ok::<_, DrError>((digest, size))
        }
        .await;
        let (digest, size) = match landed {
            Ok(v) => v,
            Err(e) => {
                discard_all(&[staged.as_path(), final_path.as_path(), sidecar.as_path()]).await;
                return Err(e);
            }
        };
        Ok(BackupRecord {
            id: name.id.clone(),
            kind: name.kind,
            created_at: name.created_at,
            artifact_path: final_path,
            digest,
            encrypted: name.encrypted,
            size,
            tier: StorageTier::Both,
        })
    }

    /// Remove a record's artifact and sidecar from the local tier.
    /// Returns whether anything was there.
    pub async fn delete_local(&self, name: &RecordName) -> Result<bool> {
        let artifact = self.artifact_path(name);
        let existed = remove_if_exists(&artifact).await?;
        remove_if_exists(&integrity::sidecar_path(&artifact)).await?;
        Ok(existed)
    }

    /// Remove a record's artifact and sidecar from the remote tier
    pub async fn delete_remote(&self, name: &RecordName) -> Result<()> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        let file_name = name.file_name();
        remote.delete(&file_name).await?;
        remote.delete(&sidecar_key(&file_name)).await?;
        Ok(())
    }

    /// Remove a record from whichever tiers hold it. Both tiers are always
    /// attempted; the first failure is reported afterwards.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let entry = self
            .list()
            .await?
            .into_iter()
            .find(|e| e.name.id == id)
            .ok_or_else(|| DrError::NotFound(id.to_string()))?;

        let local = match entry.tier {
            StorageTier::Local | StorageTier::Both => self.delete_local(&entry.name).await.map(|_| ()),
            StorageTier::Remote => Ok(()),
        };
        let remote = match entry.tier {
            StorageTier::Remote | StorageTier::Both => self.delete_remote(&entry.name).await,
            StorageTier::Local => Ok(()),
        };
        local.and(remote)
    }
}

fn sidecar_key(file_name: &str) -> String {
    format!("{}{}", file_name, integrity::SIDECAR_SUFFIX)
}

/// Write the sidecar, move the staged artifact into place and return its size
async fn persist(staged: &Path, final_path: &Path, digest: &str) -> Result<u64> {
    integrity::write_sidecar(final_path, digest)?;
    tokio::fs::rename(staged, final_path).await?;
    Ok(tokio::fs::metadata(final_path).await?.len())
}

/// Best-effort removal of a failed write's leftovers
async fn discard_all(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = remove_if_exists(path).await {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_790_000_000 + secs, 0).unwrap()
    }

    async fn make_record(store: &ArchiveStore, kind: BackupKind, when: DateTime<Utc>, body: &[u8]) -> BackupRecord {
        let name = store.allocate(kind, false, when).await.unwrap();
        let staged = store.staging_path(&name, "");
        tokio::fs::write(&staged, body).await.unwrap();
        let digest = integrity::digest_file_async(&staged).await.unwrap();
        store.commit(&staged, &name, digest).await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_and_resolve_latest() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path(), None);

        let older = make_record(&store, BackupKind::Full, at(0), b"one").await;
        let newer = make_record(&store, BackupKind::Incremental, at(60), b"two").await;
        assert_ne!(older.id, newer.id);

        let resolved = store.resolve(LATEST).await.unwrap();
        assert_eq!(resolved, newer);
        assert_eq!(store.resolve(&older.id).await.unwrap().digest, older.digest);
        assert!(!store.staging_path(&older.name(), "").exists());
    }

    #[tokio::test]
    async fn test_latest_tie_breaks_on_identifier() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path(), None);

        make_record(&store, BackupKind::Full, at(0), b"f").await;
        let inc = make_record(&store, BackupKind::Incremental, at(0), b"i").await;
        assert_eq!(store.resolve(LATEST).await.unwrap().id, inc.id);
    }

    #[tokio::test]
    async fn test_allocate_bumps_on_collision() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path(), None);

        let first = make_record(&store, BackupKind::Incremental, at(0), b"a").await;
        let second = make_record(&store, BackupKind::Incremental, at(0), b"b").await;
        assert_ne!(first.id, second.id);
        assert!(second.created_at > first.created_at);
    }

    #[tokio::test]
    async fn test_resolve_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path().join("never-created"), None);
        let err = store.resolve(LATEST).await.unwrap_err();
        assert_eq!(err.to_string(), "backup not found: latest");
    }

    #[tokio::test]
    async fn test_artifact_without_sidecar_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path(), None);
        let name = RecordName::new(BackupKind::Full, at(0), false);
        tokio::fs::write(store.artifact_path(&name), b"orphan").await.unwrap();
        assert!(store.list_local().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_fallback_fetches_into_local_tier() {
        let local_a = TempDir::new().unwrap();
        let local_b = TempDir::new().unwrap();
        let bucket = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(bucket.path(), "node"));

        let origin = ArchiveStore::new(local_a.path(), Some(remote.clone()));
        let record = make_record(&origin, BackupKind::Full, at(0), b"remote bytes").await;
        origin.put(&record).await.unwrap();

        // A fresh host with an empty local tier
        let other = ArchiveStore::new(local_b.path(), Some(remote));
        let listed = other.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tier, StorageTier::Remote);

        let fetched = other.resolve(&record.id).await.unwrap();
        assert_eq!(fetched.digest, record.digest);
        assert_eq!(fetched.tier, StorageTier::Both);
        assert_eq!(tokio::fs::read(&fetched.artifact_path).await.unwrap(), b"remote bytes");
    }

    async fn local_files(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
            while let Some(entry) = entries.next_entry().await.unwrap() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path(), None);
        let name = store.allocate(BackupKind::Full, false, at(0)).await.unwrap();

        // The staged artifact vanished before the rename
        let staged = store.staging_path(&name, "");
        let err = store.commit(&staged, &name, "00".repeat(32)).await.unwrap_err();
        assert!(matches!(err, DrError::Io(_)), "{}", err);
        assert!(local_files(dir.path()).await.is_empty());
        assert!(store.list_local().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_sidecar_download_discards_staged_artifact() {
        let local_a = TempDir::new().unwrap();
        let local_b = TempDir::new().unwrap();
        let bucket = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(bucket.path(), "node"));

        let origin = ArchiveStore::new(local_a.path(), Some(remote.clone()));
        let record = make_record(&origin, BackupKind::Full, at(0), b"remote bytes").await;
        origin.put(&record).await.unwrap();

        // Still listed, but the sidecar object cannot be downloaded
        let sidecar = PathBuf::from(remote.describe()).join(sidecar_key(&record.name().file_name()));
        tokio::fs::remove_file(&sidecar).await.unwrap();
        tokio::fs::create_dir(&sidecar).await.unwrap();

        let other = ArchiveStore::new(local_b.path(), Some(remote));
        let err = other.resolve(&record.id).await.unwrap_err();
        assert!(matches!(err, DrError::Transfer(_)), "{}", err);
        assert!(local_files(local_b.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_both_tiers() {
        let local = TempDir::new().unwrap();
        let bucket = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(bucket.path(), ""));
        let store = ArchiveStore::new(local.path(), Some(remote.clone()));

        let record = make_record(&store, BackupKind::Full, at(0), b"x").await;
        store.put(&record).await.unwrap();
        assert_eq!(store.list().await.unwrap()[0].tier, StorageTier::Both);

        store.delete(&record.id).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(remote.list().await.unwrap().is_empty());
        assert!(matches!(store.delete(&record.id).await, Err(DrError::NotFound(_))));
    }
}
