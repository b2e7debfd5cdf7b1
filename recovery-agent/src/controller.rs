//! Start/stop sequencing for the managed node.
//!
//! Only one stop/start cycle may be open at a time. `stop` hands out a
//! [`Quiesced`] guard that keeps the cycle open until it is passed back to
//! `start` (or dropped, which leaves the node stopped).

use crate::health::{HealthProbe, HealthStatus};
use crate::node::ProcessControl;
use crate::utils::errors::{DrError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info};

const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Proof that the node was stopped by the holder of this guard
#[derive(Debug)]
pub struct Quiesced {
    was_running: bool,
    _cycle: OwnedMutexGuard<()>,
}

impl Quiesced {
    /// Whether the node was running before `stop` was called
    pub fn was_running(&self) -> bool {
        self.was_running
    }
}

pub struct ProcessController {
    process: Arc<dyn ProcessControl>,
    probe: Arc<HealthProbe>,
    stop_timeout: Duration,
    health_attempts: u32,
    health_interval: Duration,
    cycle: Arc<Mutex<()>>,
}

impl ProcessController {
    pub fn new(
        process: Arc<dyn ProcessControl>,
        probe: Arc<HealthProbe>,
        stop_timeout: Duration,
        health_attempts: u32,
        health_interval: Duration,
    ) -> Self {
        Self {
            process,
            probe,
            stop_timeout,
            health_attempts,
            health_interval,
            cycle: Arc::new(Mutex::new(())),
        }
    }

    pub fn probe(&self) -> &Arc<HealthProbe> {
        &self.probe
    }

    /// Halt the node and wait until the process is gone.
    ///
    /// Fails with `Locked` if another cycle is open and with `Process` if the
    /// node is still running once the stop timeout has elapsed.
    pub async fn stop(&self) -> Result<Quiesced> {
        let cycle = self.cycle.clone().try_lock_owned().map_err(|_| {
            DrError::Locked("a stop/start sequence is already in progress".into())
        })?;

        if !self.process.is_running().await? {
            info!("Node already stopped");
            return Ok(Quiesced {
                was_running: false,
                _cycle: cycle,
            });
        }

        info!("Stopping node");
        self.process.stop().await?;

        let deadline = Instant::now() + self.stop_timeout;
        while self.process.is_running().await? {
            if Instant::now() >= deadline {
                return Err(DrError::Process(format!(
                    "node still running {}s after stop",
                    self.stop_timeout.as_secs()
                )));
            }
            debug!("Waiting for node to exit");
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        info!("Node stopped");
        Ok(Quiesced {
            was_running: true,
            _cycle: cycle,
        })
    }

    /// Launch the node, closing the cycle opened by `stop`
    pub async fn start(&self, quiesced: Quiesced) -> Result<()> {
        info!("Starting node");
        let result = self.process.start().await;
        drop(quiesced);
        result
    }

    /// Poll health with the configured attempt budget
    pub async fn await_healthy(&self) -> Result<HealthStatus> {
        self.probe
            .await_healthy(self.health_attempts, self.health_interval)
            .await
    }

    /// `start` followed by `await_healthy`
    pub async fn resume(&self, quiesced: Quiesced) -> Result<HealthStatus> {
        self.start(quiesced).await?;
        self.await_healthy().await
    }

    /// Bring back a node whose stop cycle was already closed. Returns `None`
    /// when the node is running.
    pub async fn ensure_running(&self) -> Result<Option<HealthStatus>> {
        let cycle = self.cycle.clone().try_lock_owned().map_err(|_| {
            DrError::Locked("a stop/start sequence is already in progress".into())
        })?;
        if self.process.is_running().await? {
            return Ok(None);
        }
        self.resume(Quiesced {
            was_running: false,
            _cycle: cycle,
        })
        .await
        .map(Some)
    }
}
