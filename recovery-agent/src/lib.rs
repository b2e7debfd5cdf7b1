//! Recovery Agent Library
//!
//! Disaster-recovery orchestration for a blockchain node: verified backups,
//! restores, failover to a standby host, and RTO/RPO measurement.

pub mod archive;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod executor;
pub mod failover;
pub mod fs;
pub mod health;
pub mod integrity;
pub mod lock;
pub mod node;
pub mod notify;
pub mod objectives;
pub mod retention;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{Collaborators, Command, Dispatcher, Outcome};
pub use utils::errors::{DrError, Result};
