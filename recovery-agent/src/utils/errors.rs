//! Error taxonomy for disaster-recovery operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DrError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Prerequisite not met: {0}")]
    Prerequisite(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Integrity check failed for {artifact}: expected {expected}, got {actual}")]
    Integrity {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Node did not become healthy after {attempts} attempts")]
    HealthTimeout { attempts: u32 },

    #[error("Process control error: {0}")]
    Process(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("backup not found: {0}")]
    NotFound(String),

    #[error("Data directory is locked: {0}")]
    Locked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DrError {
    /// Short stable name used in notifications and logs.
    pub fn category(&self) -> &'static str {
        match self {
            DrError::Config(_) => "config",
            DrError::Prerequisite(_) => "prerequisite",
            DrError::Archive(_) => "archive",
            DrError::Encryption(_) => "encryption",
            DrError::Integrity { .. } => "integrity",
            DrError::Transfer(_) | DrError::Http(_) => "transfer",
            DrError::HealthTimeout { .. } => "health-timeout",
            DrError::Process(_) => "process",
            DrError::Rpc(_) => "rpc",
            DrError::NotFound(_) => "not-found",
            DrError::Locked(_) => "locked",
            DrError::Io(_) => "io",
            DrError::Serialization(_) => "serialization",
        }
    }

    /// Transfer failures leave a usable local copy behind and only degrade a
    /// backup; everything else aborts the operation.
    pub fn is_degraded(&self) -> bool {
        matches!(self, DrError::Transfer(_) | DrError::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, DrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = DrError::NotFound("latest".to_string());
        assert_eq!(err.to_string(), "backup not found: latest");
        assert_eq!(err.category(), "not-found");
    }

    #[test]
    fn test_degraded_classification() {
        assert!(DrError::Transfer("bucket unreachable".into()).is_degraded());
        assert!(!DrError::HealthTimeout { attempts: 3 }.is_degraded());
        assert!(!DrError::Archive("disk full".into()).is_degraded());
    }
}
