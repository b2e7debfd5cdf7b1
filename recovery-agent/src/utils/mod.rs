//! Utility modules for the recovery agent.

pub mod errors;
pub mod logger;

pub use errors::{DrError, Result};
