//! Configuration management for the recovery agent.
//!
//! Loads configuration from a TOML file, then applies `DR_*` environment
//! overrides once at startup. Components receive the resulting value at
//! construction and never read the environment themselves.

use crate::utils::errors::{DrError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub objectives: ObjectivesConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node data directory (the directory that gets backed up and restored)
    pub data_dir: PathBuf,

    /// Shell command that starts the node
    #[serde(default = "default_start_command")]
    pub start_command: String,

    /// Shell command that stops the node
    #[serde(default = "default_stop_command")]
    pub stop_command: String,

    /// Shell command that exits 0 while the node process is running
    #[serde(default = "default_status_command")]
    pub status_command: String,

    /// JSON-RPC endpoint of the node
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Owner applied to restored files, as `user` or `user:group`
    #[serde(default)]
    pub owner: Option<String>,

    /// How long `stop` may take before it is treated as fatal
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local backup tier
    pub backup_dir: PathBuf,

    /// Scratch space for decrypted archives during restore
    pub restore_dir: PathBuf,

    /// Subpaths of the data directory read by incremental backups
    #[serde(default = "default_incremental_paths")]
    pub incremental_paths: Vec<PathBuf>,

    /// Transient files never archived (`*.log` suffix, `tmp*` prefix, or exact name)
    #[serde(default = "default_transient_excludes")]
    pub transient_excludes: Vec<String>,

    /// Historical subdirectories skipped by incremental backups
    #[serde(default = "default_incremental_excludes")]
    pub incremental_excludes: Vec<String>,

    /// Minimum free bytes on the backup and data filesystems
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Object store backend (`s3` or `fs`); unset disables the remote tier
    #[serde(default)]
    pub backend: Option<String>,

    /// Bucket name (`s3`) or root directory (`fs`)
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix inside the bucket
    #[serde(default = "default_remote_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Symmetric passphrase; unset leaves artifacts in plaintext
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Maximum age in days, applied to both tiers
    #[serde(default = "default_retention_days")]
    pub days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectivesConfig {
    #[serde(default = "default_rto_target_secs")]
    pub rto_target_secs: u64,

    #[serde(default = "default_rpo_target_secs")]
    pub rpo_target_secs: u64,

    /// Assumed seconds per block when converting lost blocks to lost time
    #[serde(default = "default_block_interval_secs")]
    pub block_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Private key for SSH auth; the SSH agent is used when unset
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,

    /// Data directory on the failover target
    #[serde(default = "default_remote_data_dir")]
    pub remote_data_dir: PathBuf,

    /// Command that starts the node on the failover target
    #[serde(default = "default_start_command")]
    pub remote_start_command: String,

    /// Endpoint told to redirect traffic once the target is up
    #[serde(default)]
    pub router_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Webhook receiving `{level, message, timestamp}` events
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file, appended to alongside stdout
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default values
fn default_start_command() -> String {
    "docker compose start node".to_string()
}

fn default_stop_command() -> String {
    "docker compose stop node".to_string()
}

fn default_status_command() -> String {
    "docker compose ps --status running --quiet node | grep -q .".to_string()
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_stop_timeout_secs() -> u64 {
    120
}

fn default_incremental_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("chaindata"), PathBuf::from("keystore")]
}

fn default_transient_excludes() -> Vec<String> {
    vec![
        "*.log".to_string(),
        "*.tmp".to_string(),
        "logs".to_string(),
        "tmp".to_string(),
        "LOCK".to_string(),
    ]
}

fn default_incremental_excludes() -> Vec<String> {
    vec!["ancient".to_string(), "history".to_string()]
}

fn default_min_free_bytes() -> u64 {
    1024 * 1024 * 1024 // 1GB
}

fn default_compression_level() -> i32 {
    3
}

fn default_remote_prefix() -> String {
    "node-backups".to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_rto_target_secs() -> u64 {
    900
}

fn default_rpo_target_secs() -> u64 {
    3600
}

fn default_block_interval_secs() -> u64 {
    12
}

fn default_health_max_attempts() -> u32 {
    30
}

fn default_health_interval_secs() -> u64 {
    10
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/node/data")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: None,
            bucket: None,
            prefix: default_remote_prefix(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { days: default_retention_days() }
    }
}

impl Default for ObjectivesConfig {
    fn default() -> Self {
        Self {
            rto_target_secs: default_rto_target_secs(),
            rpo_target_secs: default_rpo_target_secs(),
            block_interval_secs: default_block_interval_secs(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_health_max_attempts(),
            interval_secs: default_health_interval_secs(),
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
            ssh_key: None,
            remote_data_dir: default_remote_data_dir(),
            remote_start_command: default_start_command(),
            router_url: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DrError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| DrError::Config(format!("invalid {}: {}", path.display(), e)))
    }

    /// Create a default configuration
    pub fn default() -> Self {
        Config {
            node: NodeConfig {
                data_dir: PathBuf::from("/var/lib/node/data"),
                start_command: default_start_command(),
                stop_command: default_stop_command(),
                status_command: default_status_command(),
                rpc_url: default_rpc_url(),
                owner: None,
                stop_timeout_secs: default_stop_timeout_secs(),
            },
            storage: StorageConfig {
                backup_dir: PathBuf::from("/var/backups/node"),
                restore_dir: PathBuf::from("/var/tmp/node-restore"),
                incremental_paths: default_incremental_paths(),
                transient_excludes: default_transient_excludes(),
                incremental_excludes: default_incremental_excludes(),
                min_free_bytes: default_min_free_bytes(),
                compression_level: default_compression_level(),
            },
            remote: RemoteConfig::default(),
            encryption: EncryptionConfig::default(),
            retention: RetentionConfig::default(),
            objectives: ObjectivesConfig::default(),
            health: HealthConfig::default(),
            failover: FailoverConfig::default(),
            notify: NotifyConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Apply `DR_*` overrides from the process environment (and `.env`)
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let _ = dotenvy::dotenv();
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DR_DATA_DIR") {
            self.node.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DR_BACKUP_DIR") {
            self.storage.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DR_RESTORE_DIR") {
            self.storage.restore_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DR_LOG_FILE") {
            self.log.file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DR_NOTIFY_URL") {
            self.notify.url = Some(v);
        }
        if let Some(v) = lookup("DR_REMOTE_BUCKET") {
            self.remote.bucket = Some(v);
            self.remote.backend.get_or_insert_with(|| "s3".to_string());
        }
        if let Some(v) = lookup("DR_REMOTE_PREFIX") {
            self.remote.prefix = v;
        }
        if let Some(v) = lookup("DR_ENCRYPTION_PASSPHRASE") {
            self.encryption.passphrase = Some(v);
        }
        if let Some(v) = lookup("DR_RETENTION_DAYS") {
            self.retention.days = parse_override("DR_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = lookup("DR_RTO_TARGET_SECS") {
            self.objectives.rto_target_secs = parse_override("DR_RTO_TARGET_SECS", &v)?;
        }
        if let Some(v) = lookup("DR_RPO_TARGET_SECS") {
            self.objectives.rpo_target_secs = parse_override("DR_RPO_TARGET_SECS", &v)?;
        }
        if let Some(v) = lookup("DR_BLOCK_INTERVAL_SECS") {
            self.objectives.block_interval_secs = parse_override("DR_BLOCK_INTERVAL_SECS", &v)?;
        }
        Ok(())
    }

    /// Reject configurations that would make an operation unsafe before it starts
    pub fn validate(&self) -> Result<()> {
        if self.node.data_dir.as_os_str().is_empty() {
            return Err(DrError::Prerequisite("node.data_dir is empty".into()));
        }
        if self.storage.backup_dir.as_os_str().is_empty() {
            return Err(DrError::Prerequisite("storage.backup_dir is empty".into()));
        }
        if self.storage.backup_dir.starts_with(&self.node.data_dir)
            || self.storage.restore_dir.starts_with(&self.node.data_dir)
        {
            return Err(DrError::Prerequisite(
                "backup and restore directories must live outside the data directory".into(),
            ));
        }
        if self.retention.days == 0 {
            return Err(DrError::Prerequisite("retention.days must be at least 1".into()));
        }
        if self.health.max_attempts == 0 {
            return Err(DrError::Prerequisite("health.max_attempts must be at least 1".into()));
        }
        if self.encryption.passphrase.as_deref() == Some("") {
            return Err(DrError::Prerequisite("encryption.passphrase is empty".into()));
        }
        if self.remote.backend.is_some() && self.remote.bucket.is_none() {
            return Err(DrError::Config("remote.backend is set but remote.bucket is not".into()));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DrError::Config(format!("{} has an invalid value: {:?}", key, value)))
}
