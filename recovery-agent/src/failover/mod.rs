//! Failover of the node to a standby host.
//!
//! Order matters: safety backup, stop the local node, copy the data
//! directory, start the node on the target, and only then redirect traffic.
//! Traffic is never pointed at a target that did not come up.

pub mod router;
pub mod ssh;

use crate::controller::ProcessController;
use crate::executor::{BackupEngine, OpState, Operation};
use crate::store::BackupKind;
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub use router::{NoopRouter, WebhookRouter};
pub use ssh::{shell_quote, SshRemoteHost};

/// Secure remote execution and file synchronization on a failover target
#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Run a shell command on `target`, returning its stdout
    async fn exec(&self, target: &str, command: &str) -> Result<String>;

    /// Copy the local directory tree into `remote` on `target`; returns the
    /// number of file bytes sent
    async fn sync_dir(&self, target: &str, local: &Path, remote: &Path) -> Result<u64>;
}

/// External collaborator that moves client traffic to a new host
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    async fn redirect(&self, target: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverOutcome {
    pub target: String,
    pub safety_backup: String,
    pub bytes_transferred: u64,
}

pub struct FailoverController {
    data_dir: PathBuf,
    remote_data_dir: PathBuf,
    remote_start_command: String,
    backup: Arc<BackupEngine>,
    controller: Arc<ProcessController>,
    remote: Arc<dyn RemoteHost>,
    router: Arc<dyn TrafficRouter>,
}

impl FailoverController {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        remote_data_dir: impl Into<PathBuf>,
        remote_start_command: impl Into<String>,
        backup: Arc<BackupEngine>,
        controller: Arc<ProcessController>,
        remote: Arc<dyn RemoteHost>,
        router: Arc<dyn TrafficRouter>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            remote_data_dir: remote_data_dir.into(),
            remote_start_command: remote_start_command.into(),
            backup,
            controller,
            remote,
            router,
        }
    }

    pub async fn failover(&self, target: &str) -> Result<FailoverOutcome> {
        info!(target_host = %target, "Starting failover");
        let safety = self.backup.create(BackupKind::FailoverSafety).await?;

        let mut op = Operation::new("failover", &self.controller);
        match self.run(&mut op, target).await {
            Ok(bytes_transferred) => {
                op.finish();
                Ok(FailoverOutcome {
                    target: target.to_string(),
                    safety_backup: safety.id,
                    bytes_transferred,
                })
            }
            Err(e) => Err(op.abort(e).await),
        }
    }

    async fn run(&self, op: &mut Operation<'_>, target: &str) -> Result<u64> {
        // The node must be fully down before the first byte is copied
        op.quiesce().await?;

        op.advance(OpState::Transferring);
        let remote_dir = self.remote_data_dir.to_string_lossy().to_string();
        let incoming = format!("{}.incoming", remote_dir);
        self.remote
            .exec(target, &format!("rm -rf {}", shell_quote(&incoming)))
            .await?;
        let bytes = self
            .remote
            .sync_dir(target, &self.data_dir, Path::new(&incoming))
            .await?;

        op.advance(OpState::Persisting);
        let side = format!(
            "{}.pre-failover-{}",
            remote_dir,
            Utc::now().format("%Y%m%dT%H%M%SZ")
        );
        let swap = format!(
            "if [ -e {dir} ]; then mv {dir} {side}; fi && mv {incoming} {dir}",
            dir = shell_quote(&remote_dir),
            side = shell_quote(&side),
            incoming = shell_quote(&incoming),
        );
        self.remote.exec(target, &swap).await?;

        info!(target_host = %target, "Starting node on failover target");
        self.remote.exec(target, &self.remote_start_command).await?;

        // The target now owns the chain; the local node stays down from here on
        op.keep_stopped();
        self.router.redirect(target).await?;

        info!(target_host = %target, bytes, "Failover complete");
        Ok(bytes)
    }
}
