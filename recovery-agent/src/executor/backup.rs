//! Backup engine: node data directory in, verified backup record out.

use super::{OpState, Operation};
use crate::archive::crypto::Encryptor;
use crate::archive::Archiver;
use crate::config::StorageConfig;
use crate::controller::ProcessController;
use crate::fs::{walker, WalkOptions};
use crate::health;
use crate::integrity;
use crate::notify::{Notifier, NotifierExt};
use crate::retention::RetentionManager;
use crate::store::{ArchiveStore, BackupKind, BackupRecord, RecordName};
use crate::utils::errors::{DrError, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const PLAINTEXT_SUFFIX: &str = ".plain";

pub struct BackupEngine {
    data_dir: PathBuf,
    storage: StorageConfig,
    store: Arc<ArchiveStore>,
    archiver: Arc<dyn Archiver>,
    encryptor: Option<Arc<dyn Encryptor>>,
    controller: Arc<ProcessController>,
    retention: Arc<RetentionManager>,
    notifier: Arc<dyn Notifier>,
}

impl BackupEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_dir: impl Into<PathBuf>,
        storage: StorageConfig,
        store: Arc<ArchiveStore>,
        archiver: Arc<dyn Archiver>,
        encryptor: Option<Arc<dyn Encryptor>>,
        controller: Arc<ProcessController>,
        retention: Arc<RetentionManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            storage,
            store,
            archiver,
            encryptor,
            controller,
            retention,
            notifier,
        }
    }

    /// Produce a new backup of the given kind.
    ///
    /// Full, test and failover-safety backups stop the node for the duration
    /// of archiving. Incremental backups read a restricted set of paths from
    /// the live node.
    pub async fn create(&self, kind: BackupKind) -> Result<BackupRecord> {
        let mut op = Operation::new("backup", &self.controller);
        match self.run(&mut op, kind).await {
            Ok(record) => {
                op.finish();
                Ok(record)
            }
            Err(e) => Err(op.abort(e).await),
        }
    }

    async fn run(&self, op: &mut Operation<'_>, kind: BackupKind) -> Result<BackupRecord> {
        self.check_prerequisites()?;
        let name = self
            .store
            .allocate(kind, self.encryptor.is_some(), Utc::now())
            .await?;
        info!(record_id = %name.id, kind = %kind, "Creating backup");

        if kind.requires_quiesce() {
            op.quiesce().await?;
        }

        op.advance(OpState::Archiving);
        let artifact = self.archive(&name, kind).await?;

        let artifact = match &self.encryptor {
            Some(encryptor) => {
                op.advance(OpState::Encrypting);
                self.encrypt(encryptor.clone(), &artifact, &name).await?
            }
            None => artifact,
        };

        op.advance(OpState::Verifying);
        let digest = match integrity::digest_file_async(&artifact).await {
            Ok(d) => d,
            Err(e) => {
                let _ = tokio::fs::remove_file(&artifact).await;
                return Err(e);
            }
        };

        op.advance(OpState::Persisting);
        let record = self.store.commit(&artifact, &name, digest).await?;

        if self.store.has_remote() {
            op.advance(OpState::Transferring);
            if let Err(e) = self.store.put(&record).await {
                warn!(record_id = %record.id, "Remote upload failed, keeping local copy: {}", e);
                self.notifier
                    .warning(format!(
                        "Backup {} stored locally only; upload failed: {}",
                        record.id, e
                    ))
                    .await;
            }
        }

        if let Some(status) = op.resume().await? {
            info!(
                record_id = %record.id,
                "Node resumed at height {:?}",
                status.block_height
            );
        }

        let report = self.retention.prune().await;
        if !report.is_clean() {
            warn!("Retention after backup incomplete: {}", report);
        }

        info!(
            record_id = %record.id,
            size = record.size,
            encrypted = record.encrypted,
            "Backup complete"
        );
        Ok(record)
    }

    /// Fail before touching anything when the data directory is missing or the
    /// backup filesystem is short on space.
    fn check_prerequisites(&self) -> Result<()> {
        if !self.data_dir.is_dir() {
            return Err(DrError::Prerequisite(format!(
                "data directory {} does not exist",
                self.data_dir.display()
            )));
        }
        std::fs::create_dir_all(self.store.backup_dir()).map_err(|e| {
            DrError::Prerequisite(format!(
                "cannot create backup directory {}: {}",
                self.store.backup_dir().display(),
                e
            ))
        })?;

        let free = health::free_bytes(self.store.backup_dir())?;
        if free < self.storage.min_free_bytes {
            return Err(DrError::Prerequisite(format!(
                "only {} bytes free in {}, {} required",
                free,
                self.store.backup_dir().display(),
                self.storage.min_free_bytes
            )));
        }
        Ok(())
    }

    /// Paths and exclusions archived for a backup kind
    fn selection(&self, kind: BackupKind) -> WalkOptions {
        let mut exclude_patterns = self.storage.transient_excludes.clone();
        let include = if kind == BackupKind::Incremental {
            exclude_patterns.extend(self.storage.incremental_excludes.iter().cloned());
            self.storage.incremental_paths.clone()
        } else {
            Vec::new()
        };
        WalkOptions {
            follow_links: false,
            include,
            exclude_patterns,
        }
    }

    async fn archive(&self, name: &RecordName, kind: BackupKind) -> Result<PathBuf> {
        let suffix = if self.encryptor.is_some() { PLAINTEXT_SUFFIX } else { "" };
        let dest = self.store.staging_path(name, suffix);
        let options = self.selection(kind);
        let archiver = self.archiver.clone();
        let root = self.data_dir.clone();
        let dest_task = dest.clone();

        let result = tokio::task::spawn_blocking(move || {
            if let Ok(bytes) = walker::calculate_total_size(&root, &options) {
                debug!(bytes, "Archiving {}", root.display());
            }
            archiver.create(&root, &options, &dest_task)
        })
            .await
            .map_err(|e| DrError::Archive(format!("archive task failed: {}", e)))
            .and_then(|r| r);

        match result {
            Ok(summary) => {
                info!(
                    files = summary.files,
                    dirs = summary.dirs,
                    bytes = summary.bytes,
                    "Archived {}",
                    self.data_dir.display()
                );
                Ok(dest)
            }
            Err(e) => {
                discard(&dest).await;
                Err(e)
            }
        }
    }

    /// Encrypt the staged archive; the plaintext is discarded either way
    async fn encrypt(&self, encryptor: Arc<dyn Encryptor>, plain: &Path, name: &RecordName) -> Result<PathBuf> {
        let dest = self.store.staging_path(name, "");
        let src = plain.to_path_buf();
        let dest_task = dest.clone();

        let result = tokio::task::spawn_blocking(move || encryptor.encrypt(&src, &dest_task))
            .await
            .map_err(|e| DrError::Encryption(format!("encryption task failed: {}", e)))
            .and_then(|r| r);
        discard(plain).await;

        match result {
            Ok(()) => Ok(dest),
            Err(e) => {
                discard(&dest).await;
                Err(e)
            }
        }
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
