//! Restore engine: backup record in, rebuilt data directory out.
//!
//! The artifact is verified, decrypted and extracted into a fresh sibling of
//! the data directory while the node keeps running. Only then is the node
//! stopped and the fresh tree swapped in; the previous data directory is kept
//! under a timestamped side path.

use super::{OpState, Operation};
use crate::archive::crypto::Encryptor;
use crate::archive::Archiver;
use crate::config::StorageConfig;
use crate::controller::ProcessController;
use crate::fs::{fill_missing, walker::matches_pattern, Owner};
use crate::health::HealthStatus;
use crate::integrity;
use crate::notify::{Notifier, NotifierExt};
use crate::store::{ArchiveStore, BackupKind, BackupRecord};
use crate::utils::errors::{DrError, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const SIDE_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub record_id: String,
    /// Where the replaced data directory was moved, if there was one
    pub previous_data_dir: Option<PathBuf>,
    pub health: HealthStatus,
    /// Height reported by the post-restore sanity check
    pub block_height: Option<u64>,
}

pub struct RestoreEngine {
    data_dir: PathBuf,
    restore_dir: PathBuf,
    storage: StorageConfig,
    store: Arc<ArchiveStore>,
    archiver: Arc<dyn Archiver>,
    encryptor: Option<Arc<dyn Encryptor>>,
    controller: Arc<ProcessController>,
    owner: Option<Owner>,
    notifier: Arc<dyn Notifier>,
}

impl RestoreEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_dir: impl Into<PathBuf>,
        restore_dir: impl Into<PathBuf>,
        storage: StorageConfig,
        store: Arc<ArchiveStore>,
        archiver: Arc<dyn Archiver>,
        encryptor: Option<Arc<dyn Encryptor>>,
        controller: Arc<ProcessController>,
        owner: Option<Owner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            restore_dir: restore_dir.into(),
            storage,
            store,
            archiver,
            encryptor,
            controller,
            owner,
            notifier,
        }
    }

    /// Check a record's artifact against its recorded digest without
    /// touching the node or the data directory.
    pub async fn verify(&self, selector: &str) -> Result<BackupRecord> {
        let record = self.store.resolve(selector).await?;
        integrity::verify_file_async(&record.artifact_path, &record.digest).await?;
        info!(record_id = %record.id, "Artifact digest verified");
        Ok(record)
    }

    /// Rebuild the data directory from `selector` (an identifier or `latest`)
    pub async fn restore(&self, selector: &str) -> Result<RestoreOutcome> {
        let mut op = Operation::new("restore", &self.controller);
        match self.run(&mut op, selector).await {
            Ok(outcome) => {
                op.finish();
                Ok(outcome)
            }
            Err(e) => Err(op.abort(e).await),
        }
    }

    async fn run(&self, op: &mut Operation<'_>, selector: &str) -> Result<RestoreOutcome> {
        op.advance(OpState::Transferring);
        let record = self.store.resolve(selector).await?;
        info!(record_id = %record.id, tier = %record.tier, "Restoring backup");

        // Nothing below may run on an artifact that fails its digest
        op.advance(OpState::Verifying);
        integrity::verify_file_async(&record.artifact_path, &record.digest).await?;

        let scratch = self.restore_dir.join(Uuid::new_v4().simple().to_string());
        let result = self.prepare_and_swap(op, &record, &scratch).await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clean restore scratch {}: {}", scratch.display(), e);
            }
        }
        let previous_data_dir = result?;

        let health = match op.resume().await? {
            Some(status) => status,
            None => self.controller.await_healthy().await?,
        };

        let block_height = self.sanity_check(&record).await;
        Ok(RestoreOutcome {
            record_id: record.id,
            previous_data_dir,
            health,
            block_height,
        })
    }

    /// Decrypt, extract into a fresh tree, stop the node and swap the tree in
    async fn prepare_and_swap(
        &self,
        op: &mut Operation<'_>,
        record: &BackupRecord,
        scratch: &Path,
    ) -> Result<Option<PathBuf>> {
        let archive = if record.encrypted {
            op.advance(OpState::Encrypting);
            let encryptor = self.encryptor.clone().ok_or_else(|| {
                DrError::Encryption(format!(
                    "backup {} is encrypted but no passphrase is configured",
                    record.id
                ))
            })?;
            tokio::fs::create_dir_all(scratch).await?;
            let plain = scratch.join("archive.dra");
            let src = record.artifact_path.clone();
            let dest = plain.clone();
            tokio::task::spawn_blocking(move || encryptor.decrypt(&src, &dest))
                .await
                .map_err(|e| DrError::Encryption(format!("decryption task failed: {}", e)))??;
            plain
        } else {
            record.artifact_path.clone()
        };

        op.advance(OpState::Archiving);
        let stamp = Utc::now().format(SIDE_TIMESTAMP_FORMAT).to_string();
        let fresh = sibling(&self.data_dir, &format!("restore-{}", stamp))?;
        if let Err(e) = self.extract(&archive, &fresh).await {
            remove_tree(&fresh).await;
            return Err(e);
        }

        if let Err(e) = op.quiesce().await {
            remove_tree(&fresh).await;
            return Err(e);
        }

        op.advance(OpState::Persisting);
        if record.kind == BackupKind::Incremental {
            if let Err(e) = self.carry_over(&fresh).await {
                remove_tree(&fresh).await;
                return Err(e);
            }
        }
        if let Some(owner) = self.owner {
            let target = fresh.clone();
            let chown = tokio::task::spawn_blocking(move || owner.apply_recursive(&target))
                .await
                .map_err(|e| DrError::Archive(format!("ownership task failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = chown {
                remove_tree(&fresh).await;
                return Err(e);
            }
        }

        self.swap_in(&fresh, &stamp).await
    }

    async fn extract(&self, archive: &Path, fresh: &Path) -> Result<()> {
        let archiver = self.archiver.clone();
        let src = archive.to_path_buf();
        let dest = fresh.to_path_buf();
        let summary = tokio::task::spawn_blocking(move || archiver.extract(&src, &dest))
            .await
            .map_err(|e| DrError::Archive(format!("extract task failed: {}", e)))??;
        info!(
            files = summary.files,
            dirs = summary.dirs,
            bytes = summary.bytes,
            "Extracted into {}",
            fresh.display()
        );
        Ok(())
    }

    /// An incremental archive only holds the incremental paths minus their
    /// historical subdirectories; everything else comes from the current tree.
    async fn carry_over(&self, fresh: &Path) -> Result<()> {
        let covered = self.storage.incremental_paths.clone();
        let historical = self.storage.incremental_excludes.clone();
        let from = self.data_dir.clone();
        let into = fresh.to_path_buf();

        let copied = tokio::task::spawn_blocking(move || {
            let carry = |rel: &Path| {
                let in_covered = covered.iter().any(|c| rel.starts_with(c));
                let in_historical = rel.components().any(|c| {
                    let name = c.as_os_str().to_string_lossy();
                    historical.iter().any(|p| matches_pattern(&name, p))
                });
                !in_covered || in_historical
            };
            fill_missing(&from, &into, carry)
        })
        .await
        .map_err(|e| DrError::Archive(format!("carry-over task failed: {}", e)))??;

        info!("Carried {} entries over from the current data directory", copied);
        Ok(())
    }

    /// Move the current data directory aside and the fresh tree into place.
    /// If the second move fails, the original directory is moved back.
    async fn swap_in(&self, fresh: &Path, stamp: &str) -> Result<Option<PathBuf>> {
        let previous = if tokio::fs::symlink_metadata(&self.data_dir).await.is_ok() {
            let side = sibling(&self.data_dir, &format!("pre-restore-{}", stamp))?;
            tokio::fs::rename(&self.data_dir, &side).await.map_err(|e| {
                DrError::Io(std::io::Error::new(
                    e.kind(),
                    format!("cannot move {} aside: {}", self.data_dir.display(), e),
                ))
            })?;
            info!("Previous data directory kept at {}", side.display());
            Some(side)
        } else {
            None
        };

        if let Err(e) = tokio::fs::rename(fresh, &self.data_dir).await {
            error!("Cannot move restored tree into place: {}", e);
            if let Some(side) = &previous {
                if let Err(back) = tokio::fs::rename(side, &self.data_dir).await {
                    error!(
                        "Original data directory left at {}: {}",
                        side.display(),
                        back
                    );
                }
            }
            remove_tree(fresh).await;
            return Err(e.into());
        }

        Ok(previous)
    }

    /// A node that is healthy but still reports height 0 is probably still
    /// catching up; warn rather than fail.
    async fn sanity_check(&self, record: &BackupRecord) -> Option<u64> {
        match self.controller.probe().rpc().block_number().await {
            Ok(height) if height > 0 => {
                info!(record_id = %record.id, height, "Post-restore sanity check passed");
                Some(height)
            }
            Ok(height) => {
                self.notifier
                    .warning(format!(
                        "Restored node from {} reports block height {}",
                        record.id, height
                    ))
                    .await;
                Some(height)
            }
            Err(e) => {
                self.notifier
                    .warning(format!(
                        "Post-restore sanity check for {} failed: {}",
                        record.id, e
                    ))
                    .await;
                None
            }
        }
    }
}

/// `<parent>/<name>.<tag>` next to `dir`
fn sibling(dir: &Path, tag: &str) -> Result<PathBuf> {
    let name = dir.file_name().ok_or_else(|| {
        DrError::Prerequisite(format!("{} has no directory name", dir.display()))
    })?;
    let mut sibling_name = name.to_os_string();
    sibling_name.push(".");
    sibling_name.push(tag);
    Ok(dir.with_file_name(sibling_name))
}

async fn remove_tree(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
