//! Remote object store backends.
//!
//! Every call is a single blocking attempt; retries are left to the caller or
//! the operator.

use crate::utils::errors::{DrError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Put/get/list/delete by key under a fixed prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file, returning a handle describing where it landed
    async fn put(&self, local: &Path, key: &str) -> Result<String>;

    /// Download an object into a local file
    async fn get(&self, key: &str, local: &Path) -> Result<()>;

    /// Keys currently stored under the prefix
    async fn list(&self) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Object store backed by a directory, e.g. a mounted network share
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(bucket: impl Into<PathBuf>, prefix: &str) -> Self {
        let bucket = bucket.into();
        let root = if prefix.is_empty() {
            bucket
        } else {
            bucket.join(prefix)
        };
        Self { root }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.starts_with('.') {
            return Err(DrError::Transfer(format!("invalid object key: {:?}", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, local: &Path, key: &str) -> Result<String> {
        let dest = self.object_path(key)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| transfer("create", &self.root, e))?;
        // Copy under a temporary name so a reader never sees a partial object
        let tmp = self.root.join(format!(".{}.part", key));
        tokio::fs::copy(local, &tmp)
            .await
            .map_err(|e| transfer("upload", local, e))?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| transfer("upload", &dest, e))?;
        Ok(dest.display().to_string())
    }

    async fn get(&self, key: &str, local: &Path) -> Result<()> {
        let src = self.object_path(key)?;
        tokio::fs::copy(&src, local)
            .await
            .map_err(|e| transfer("download", &src, e))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(transfer("list", &self.root, e)),
        };
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| transfer("list", &self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(transfer("delete", &path, e)),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

fn transfer(action: &str, path: &Path, e: std::io::Error) -> DrError {
    DrError::Transfer(format!("{} {} failed: {}", action, path.display(), e))
}

/// S3 object store driven through the `aws` CLI
#[derive(Debug, Clone)]
pub struct AwsCliObjectStore {
    bucket: String,
    prefix: String,
}

impl AwsCliObjectStore {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    fn base_url(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}/", self.bucket)
        } else {
            format!("s3://{}/{}/", self.bucket, self.prefix)
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}{}", self.base_url(), key)
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!("aws {}", args.join(" "));
        Command::new("aws")
            .args(args)
            .output()
            .await
            .map_err(|e| DrError::Transfer(format!("failed to spawn aws cli: {}", e)))
    }

    async fn aws(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(DrError::Transfer(format!(
                "aws {} exited with {}: {}",
                args.get(1).copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ObjectStore for AwsCliObjectStore {
    async fn put(&self, local: &Path, key: &str) -> Result<String> {
        let url = self.url(key);
        let local = local.to_string_lossy();
        self.aws(&["s3", "cp", "--only-show-errors", &local, &url])
            .await?;
        Ok(url)
    }

    async fn get(&self, key: &str, local: &Path) -> Result<()> {
        let url = self.url(key);
        let local = local.to_string_lossy();
        self.aws(&["s3", "cp", "--only-show-errors", &url, &local])
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let base = self.base_url();
        let output = self.run(&["s3", "ls", &base]).await?;
        // `aws s3 ls` exits 1 with no output when nothing matches the prefix
        if output.status.code() == Some(1) && output.stdout.is_empty() {
            return Ok(Vec::new());
        }
        if !output.status.success() {
            return Err(DrError::Transfer(format!(
                "aws s3 ls {} exited with {}: {}",
                base,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut keys = parse_ls_output(&stdout);
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.url(key);
        self.aws(&["s3", "rm", "--only-show-errors", &url]).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.base_url()
    }
}

/// Extract object names from `aws s3 ls` output
/// (`2026-01-01 12:00:00   1234 name`; `PRE dir/` lines are skipped).
fn parse_ls_output(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let first = parts.next()?;
            if first == "PRE" {
                return None;
            }
            let _time = parts.next()?;
            let _size = parts.next()?;
            let name: Vec<&str> = parts.collect();
            (!name.is_empty()).then(|| name.join(" "))
        })
        .collect()
}
