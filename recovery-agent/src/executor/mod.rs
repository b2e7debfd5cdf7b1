//! Operation executor - the state machine shared by backup, restore and
//! failover.
//!
//! Every operation moves from `Idle` through its working states to `Done`, or
//! to `Aborted` from anywhere. An operation that quiesced the node always
//! passes through `Resuming` on its way out, including on abort.

pub mod backup;
pub mod restore;

use crate::controller::{ProcessController, Quiesced};
use crate::health::HealthStatus;
use crate::utils::errors::{DrError, Result};
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use backup::BackupEngine;
pub use restore::{RestoreEngine, RestoreOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpState {
    Idle,
    Quiescing,
    Archiving,
    Transferring,
    Encrypting,
    Verifying,
    Persisting,
    Resuming,
    Done,
    Aborted,
}

impl OpState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OpState::Done | OpState::Aborted)
    }
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpState::Idle => "IDLE",
            OpState::Quiescing => "QUIESCING",
            OpState::Archiving => "ARCHIVING",
            OpState::Transferring => "TRANSFERRING",
            OpState::Encrypting => "ENCRYPTING",
            OpState::Verifying => "VERIFYING",
            OpState::Persisting => "PERSISTING",
            OpState::Resuming => "RESUMING",
            OpState::Done => "DONE",
            OpState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// A single running backup/restore/failover
pub struct Operation<'a> {
    name: &'static str,
    id: String,
    state: OpState,
    history: Vec<OpState>,
    controller: &'a ProcessController,
    quiesced: Option<Quiesced>,
}

impl<'a> Operation<'a> {
    pub fn new(name: &'static str, controller: &'a ProcessController) -> Self {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        info!(op = name, op_id = %id, "Operation started");
        Self {
            name,
            id,
            state: OpState::Idle,
            history: vec![OpState::Idle],
            controller,
            quiesced: None,
        }
    }

    pub fn state(&self) -> OpState {
        self.state
    }

    /// States visited so far, in order
    pub fn history(&self) -> &[OpState] {
        &self.history
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced.is_some()
    }

    pub fn advance(&mut self, next: OpState) {
        if self.state.is_terminal() {
            warn!(op = self.name, op_id = %self.id, "Ignoring {} after {}", next, self.state);
            return;
        }
        debug!(op = self.name, op_id = %self.id, from = %self.state, to = %next, "State transition");
        self.state = next;
        self.history.push(next);
    }

    /// Stop the node for the rest of this operation
    pub async fn quiesce(&mut self) -> Result<()> {
        self.advance(OpState::Quiescing);
        self.quiesced = Some(self.controller.stop().await?);
        Ok(())
    }

    /// Restart the node if this operation stopped it and wait for health.
    /// Returns `None` when there was nothing to resume.
    pub async fn resume(&mut self) -> Result<Option<HealthStatus>> {
        let Some(quiesced) = self.quiesced.take() else {
            return Ok(None);
        };
        self.advance(OpState::Resuming);
        if !quiesced.was_running() {
            info!(op = self.name, op_id = %self.id, "Node was not running beforehand; starting it anyway");
        }
        self.controller.resume(quiesced).await.map(Some)
    }

    /// Close the stop/start cycle without restarting the node. Neither
    /// `resume` nor `abort` will start it afterwards.
    pub fn keep_stopped(&mut self) {
        if self.quiesced.take().is_some() {
            info!(op = self.name, op_id = %self.id, "Leaving node stopped");
        }
    }

    pub fn finish(mut self) {
        self.advance(OpState::Done);
        info!(op = self.name, op_id = %self.id, "Operation completed");
    }

    /// Move to `Aborted`, resuming the node first if this operation stopped
    /// it. The original error is handed back for propagation.
    pub async fn abort(mut self, err: DrError) -> DrError {
        error!(op = self.name, op_id = %self.id, state = %self.state, "Operation failed: {}", err);
        if self.quiesced.is_some() {
            if let Err(resume_err) = self.resume().await {
                error!(
                    op = self.name,
                    op_id = %self.id,
                    "Failed to resume node after abort: {}",
                    resume_err
                );
            }
        }
        self.advance(OpState::Aborted);
        err
    }
}
