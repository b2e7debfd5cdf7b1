//! Node liveness aggregation.
//!
//! A node is healthy when its process runs and its RPC answers. Disk headroom
//! is reported alongside but only ever produces a warning.

use crate::node::{NodeRpc, ProcessControl};
use crate::utils::errors::{DrError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub process_running: bool,
    pub rpc_responsive: bool,
    pub disk_ok: bool,
    pub free_bytes: Option<u64>,
    pub block_height: Option<u64>,
    pub peer_count: Option<u64>,
    pub syncing: Option<bool>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.process_running && self.rpc_responsive
    }
}

pub struct HealthProbe {
    process: Arc<dyn ProcessControl>,
    rpc: Arc<dyn NodeRpc>,
    disk_path: PathBuf,
    min_free_bytes: u64,
}

impl HealthProbe {
    pub fn new(
        process: Arc<dyn ProcessControl>,
        rpc: Arc<dyn NodeRpc>,
        disk_path: impl Into<PathBuf>,
        min_free_bytes: u64,
    ) -> Self {
        Self {
            process,
            rpc,
            disk_path: disk_path.into(),
            min_free_bytes,
        }
    }

    pub fn rpc(&self) -> &Arc<dyn NodeRpc> {
        &self.rpc
    }

    /// Take a single snapshot of node health
    pub async fn status(&self) -> HealthStatus {
        let process_running = match self.process.is_running().await {
            Ok(running) => running,
            Err(e) => {
                debug!("Process status check failed: {}", e);
                false
            }
        };

        let block_height = match self.rpc.block_number().await {
            Ok(height) => Some(height),
            Err(e) => {
                debug!("RPC liveness check failed: {}", e);
                None
            }
        };
        let rpc_responsive = block_height.is_some();
        let (peer_count, syncing) = if rpc_responsive {
            (self.rpc.peer_count().await.ok(), self.rpc.syncing().await.ok())
        } else {
            (None, None)
        };

        let free_bytes = match free_bytes(&self.disk_path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Cannot read disk headroom for {}: {}", self.disk_path.display(), e);
                None
            }
        };
        let disk_ok = free_bytes.is_some_and(|b| b >= self.min_free_bytes);
        if let Some(bytes) = free_bytes.filter(|_| !disk_ok) {
            warn!(
                "Low disk headroom on {}: {} bytes free, {} required",
                self.disk_path.display(),
                bytes,
                self.min_free_bytes
            );
        }

        HealthStatus {
            process_running,
            rpc_responsive,
            disk_ok,
            free_bytes,
            block_height,
            peer_count,
            syncing,
        }
    }

    /// Poll `status` until healthy, at most `max_attempts` times with a fixed
    /// `interval` between attempts.
    pub async fn await_healthy(&self, max_attempts: u32, interval: Duration) -> Result<HealthStatus> {
        for attempt in 1..=max_attempts {
            let status = self.status().await;
            if status.is_healthy() {
                info!(
                    "Node healthy after {} attempt(s) (height: {:?}, peers: {:?})",
                    attempt, status.block_height, status.peer_count
                );
                return Ok(status);
            }
            debug!(
                "Health attempt {}/{}: running={}, rpc={}",
                attempt, max_attempts, status.process_running, status.rpc_responsive
            );
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(DrError::HealthTimeout {
            attempts: max_attempts,
        })
    }
}

/// Free bytes available to unprivileged users on the filesystem holding
/// `path`. Missing paths are resolved to their closest existing ancestor.
pub fn free_bytes(path: &Path) -> std::io::Result<u64> {
    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));
    let stat = nix::sys::statvfs::statvfs(existing).map_err(std::io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}
