//! Command dispatch table.
//!
//! Wires the components together from a [`Config`] and runs one command at a
//! time against the data directory, reporting start and completion through
//! the notifier.

use crate::archive::crypto::{Encryptor, PassphraseEncryptor};
use crate::archive::{Archiver, ZstdArchiver};
use crate::config::Config;
use crate::controller::ProcessController;
use crate::executor::{BackupEngine, RestoreEngine};
use crate::failover::{FailoverController, NoopRouter, RemoteHost, SshRemoteHost, TrafficRouter, WebhookRouter};
use crate::fs::Owner;
use crate::health::HealthProbe;
use crate::lock::DataDirLock;
use crate::node::{CommandProcess, JsonRpcNode, NodeRpc, ProcessControl};
use crate::notify::{LogNotifier, Notifier, NotifierExt, WebhookNotifier};
use crate::objectives::ObjectiveTester;
use crate::retention::{RetentionManager, RetentionPolicy};
use crate::store::{ArchiveStore, AwsCliObjectStore, BackupKind, FsObjectStore, ObjectStore};
use crate::utils::errors::{DrError, Result};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Planted in the data directory by the drill to simulate corruption
pub const DRILL_MARKER: &str = "DR_DRILL_CORRUPTION_MARKER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Backup(BackupKind),
    Restore(String),
    Verify(String),
    Drill,
    Failover(String),
    TestRto,
    TestRpo,
    Health,
    Clean,
    List,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Backup(_) => "backup",
            Command::Restore(_) => "restore",
            Command::Verify(_) => "verify",
            Command::Drill => "test",
            Command::Failover(_) => "failover",
            Command::TestRto => "test-rto",
            Command::TestRpo => "test-rpo",
            Command::Health => "health",
            Command::Clean => "clean",
            Command::List => "list",
        }
    }

    /// Commands that may stop the node or change stored state hold the
    /// data directory lock
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, Command::Health | Command::List | Command::Verify(_))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Backup(kind) => write!(f, "backup {}", kind),
            Command::Restore(sel) | Command::Verify(sel) => write!(f, "{} {}", self.name(), sel),
            Command::Failover(target) => write!(f, "failover {}", target),
            _ => f.write_str(self.name()),
        }
    }
}

/// Result of a dispatched command; `success` decides the exit code
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub summary: String,
}

impl Outcome {
    fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
        }
    }

    fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
        }
    }
}

/// External systems the engines talk to
pub struct Collaborators {
    pub process: Arc<dyn ProcessControl>,
    pub rpc: Arc<dyn NodeRpc>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub remote_host: Arc<dyn RemoteHost>,
    pub router: Arc<dyn TrafficRouter>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Production collaborators described by the configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let object_store: Option<Arc<dyn ObjectStore>> =
            match (config.remote.backend.as_deref(), config.remote.bucket.as_deref()) {
                (None, _) => None,
                (Some("s3"), Some(bucket)) => {
                    Some(Arc::new(AwsCliObjectStore::new(bucket, config.remote.prefix.clone())))
                }
                (Some("fs"), Some(bucket)) => {
                    Some(Arc::new(FsObjectStore::new(bucket, &config.remote.prefix)))
                }
                (Some(other), _) => {
                    return Err(DrError::Config(format!(
                        "unsupported remote backend {:?} (expected s3 or fs)",
                        other
                    )))
                }
            };

        let router: Arc<dyn TrafficRouter> = match &config.failover.router_url {
            Some(url) => Arc::new(WebhookRouter::new(url.clone())?),
            None => Arc::new(NoopRouter),
        };

        let notifier: Arc<dyn Notifier> = match &config.notify.url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            process: Arc::new(CommandProcess::new(
                config.node.start_command.clone(),
                config.node.stop_command.clone(),
                config.node.status_command.clone(),
            )),
            rpc: Arc::new(JsonRpcNode::new(config.node.rpc_url.clone())?),
            object_store,
            remote_host: Arc::new(SshRemoteHost::new(
                config.failover.ssh_user.clone(),
                config.failover.ssh_port,
                config.failover.ssh_key.clone(),
            )),
            router,
            notifier,
        })
    }
}

/// Fully wired engines for one data directory
pub struct Dispatcher {
    data_dir: PathBuf,
    store: Arc<ArchiveStore>,
    controller: Arc<ProcessController>,
    backup: Arc<BackupEngine>,
    restore: Arc<RestoreEngine>,
    retention: Arc<RetentionManager>,
    failover: FailoverController,
    objectives: ObjectiveTester,
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            process,
            rpc,
            object_store,
            remote_host,
            router,
            notifier,
        } = collaborators;

        let data_dir = config.node.data_dir.clone();
        let probe = Arc::new(HealthProbe::new(
            process.clone(),
            rpc,
            config.storage.backup_dir.clone(),
            config.storage.min_free_bytes,
        ));
        let controller = Arc::new(ProcessController::new(
            process,
            probe,
            Duration::from_secs(config.node.stop_timeout_secs),
            config.health.max_attempts,
            config.health.interval(),
        ));

        let store = Arc::new(ArchiveStore::new(config.storage.backup_dir.clone(), object_store));
        let retention = Arc::new(RetentionManager::new(
            store.clone(),
            RetentionPolicy::new(config.retention.days),
        ));
        let archiver: Arc<dyn Archiver> = Arc::new(ZstdArchiver::new(config.storage.compression_level));
        let encryptor: Option<Arc<dyn Encryptor>> = config
            .encryption
            .passphrase
            .as_ref()
            .map(|p| Arc::new(PassphraseEncryptor::new(p.clone())) as Arc<dyn Encryptor>);
        let owner = config.node.owner.as_deref().map(Owner::parse).transpose()?;

        let backup = Arc::new(BackupEngine::new(
            data_dir.clone(),
            config.storage.clone(),
            store.clone(),
            archiver.clone(),
            encryptor.clone(),
            controller.clone(),
            retention.clone(),
            notifier.clone(),
        ));
        let restore = Arc::new(RestoreEngine::new(
            data_dir.clone(),
            config.storage.restore_dir.clone(),
            config.storage.clone(),
            store.clone(),
            archiver,
            encryptor,
            controller.clone(),
            owner,
            notifier.clone(),
        ));
        let failover = FailoverController::new(
            data_dir.clone(),
            config.failover.remote_data_dir.clone(),
            config.failover.remote_start_command.clone(),
            backup.clone(),
            controller.clone(),
            remote_host,
            router,
        );
        let objectives = ObjectiveTester::new(
            restore.clone(),
            controller.clone(),
            config.objectives.clone(),
        );

        Ok(Self {
            data_dir,
            store,
            controller,
            backup,
            restore,
            retention,
            failover,
            objectives,
            notifier,
        })
    }

    pub fn store(&self) -> &Arc<ArchiveStore> {
        &self.store
    }

    pub fn controller(&self) -> &Arc<ProcessController> {
        &self.controller
    }

    pub fn backup_engine(&self) -> &Arc<BackupEngine> {
        &self.backup
    }

    pub fn restore_engine(&self) -> &Arc<RestoreEngine> {
        &self.restore
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    pub fn failover_controller(&self) -> &FailoverController {
        &self.failover
    }

    pub fn objective_tester(&self) -> &ObjectiveTester {
        &self.objectives
    }

    /// Run a command to completion. Errors are reported through the notifier
    /// and folded into a failed outcome.
    pub async fn run(&self, command: Command) -> Outcome {
        let _lock = if command.is_exclusive() {
            match DataDirLock::acquire(&self.data_dir, command.name()) {
                Ok(lock) => Some(lock),
                Err(e) => return self.report_error(&command, e).await,
            }
        } else {
            None
        };

        info!(command = %command, "Dispatching");
        self.notifier.info(format!("Starting {}", command)).await;

        match self.execute(&command).await {
            Ok(outcome) if outcome.success => {
                self.notifier
                    .success(format!("{} succeeded: {}", command, outcome.summary))
                    .await;
                outcome
            }
            Ok(outcome) => {
                self.notifier
                    .error(format!("{} failed: {}", command, outcome.summary))
                    .await;
                outcome
            }
            Err(e) => self.report_error(&command, e).await,
        }
    }

    async fn report_error(&self, command: &Command, e: DrError) -> Outcome {
        error!(command = %command, category = e.category(), "Command failed: {}", e);
        self.notifier
            .error(format!("{} failed [{}]: {}", command, e.category(), e))
            .await;
        Outcome::failed(e.to_string())
    }

    async fn execute(&self, command: &Command) -> Result<Outcome> {
        match command {
            Command::Backup(kind) => {
                let record = self.backup.create(*kind).await?;
                Ok(Outcome::ok(format!(
                    "{} ({} bytes, digest {})",
                    record.id, record.size, record.digest
                )))
            }
            Command::Restore(selector) => {
                let outcome = self.restore.restore(selector).await?;
                Ok(Outcome::ok(format!(
                    "restored {} at height {:?}",
                    outcome.record_id, outcome.block_height
                )))
            }
            Command::Verify(selector) => {
                let record = self.restore.verify(selector).await?;
                Ok(Outcome::ok(format!("{} matches digest {}", record.id, record.digest)))
            }
            Command::Drill => self.drill().await,
            Command::Failover(target) => {
                let outcome = self.failover.failover(target).await?;
                Ok(Outcome::ok(format!(
                    "node running on {} ({} bytes moved, safety backup {})",
                    outcome.target, outcome.bytes_transferred, outcome.safety_backup
                )))
            }
            Command::TestRto => {
                let result = self.objectives.test_rto().await?;
                Ok(Outcome {
                    success: result.passed,
                    summary: result.to_string(),
                })
            }
            Command::TestRpo => {
                let result = self.objectives.test_rpo().await?;
                Ok(Outcome {
                    success: result.passed,
                    summary: result.to_string(),
                })
            }
            Command::Health => {
                let status = self.controller.probe().status().await;
                Ok(Outcome {
                    success: status.is_healthy(),
                    summary: serde_json::to_string(&status)?,
                })
            }
            Command::Clean => {
                let report = self.retention.prune().await;
                Ok(Outcome {
                    success: report.is_clean(),
                    summary: report.to_string(),
                })
            }
            Command::List => {
                let entries = self.store.list().await?;
                let lines: Vec<String> = entries
                    .iter()
                    .map(|e| format!("{}\t{}\t{}", e.name.id, e.name.kind, e.tier))
                    .collect();
                Ok(Outcome::ok(if lines.is_empty() {
                    "no backups".to_string()
                } else {
                    lines.join("\n")
                }))
            }
        }
    }

    /// End-to-end drill: back up, verify, simulate corruption, restore the
    /// drill backup, and confirm the node is healthy with the corruption gone.
    async fn drill(&self) -> Result<Outcome> {
        let record = self.backup.create(BackupKind::Test).await?;
        self.restore.verify(&record.id).await?;

        let marker = self.data_dir.join(DRILL_MARKER);
        tokio::fs::write(&marker, b"simulated corruption\n").await?;
        info!("Drill: planted {}", marker.display());

        self.restore.restore(&record.id).await?;

        let status = self.controller.probe().status().await;
        if !status.is_healthy() {
            return Ok(Outcome::failed(format!(
                "node unhealthy after restoring {}",
                record.id
            )));
        }
        if tokio::fs::try_exists(&marker).await? {
            return Ok(Outcome::failed(format!(
                "simulated corruption survived restore of {}",
                record.id
            )));
        }
        Ok(Outcome::ok(format!(
            "backup {} verified and restored, node healthy at height {:?}",
            record.id, status.block_height
        )))
    }
}
