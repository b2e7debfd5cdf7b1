//! Control surface of the managed node.
//!
//! The agent never links against the node; it only needs a way to start and
//! stop the process and a JSON-RPC endpoint to ask how far along it is.

pub mod command;
pub mod rpc;

use crate::utils::errors::Result;
use async_trait::async_trait;

pub use command::CommandProcess;
pub use rpc::JsonRpcNode;

/// Start/stop surface of the node process
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Request a stop; returning does not imply the process has exited
    async fn stop(&self) -> Result<()>;

    async fn is_running(&self) -> Result<bool>;
}

/// RPC status calls exposed by the node
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    async fn peer_count(&self) -> Result<u64>;

    async fn syncing(&self) -> Result<bool>;
}
