//! Failover target reached over SSH: command execution plus an SFTP tree copy.

use super::RemoteHost;
use crate::fs::{walk_directory, EntryKind, WalkOptions};
use crate::fs::metadata::file_mode;
use crate::utils::errors::{DrError, Result};
use async_trait::async_trait;
use ssh2::{OpenFlags, OpenType, Session};
use std::fs::File;
use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SshRemoteHost {
    user: String,
    port: u16,
    key: Option<PathBuf>,
}

impl SshRemoteHost {
    /// Authenticates with `key` when given, otherwise through the SSH agent
    pub fn new(user: impl Into<String>, port: u16, key: Option<PathBuf>) -> Self {
        Self {
            user: user.into(),
            port,
            key,
        }
    }

    fn connect(&self, target: &str) -> Result<Session> {
        let tcp = TcpStream::connect((target, self.port))
            .map_err(|e| DrError::Transfer(format!("cannot reach {}:{}: {}", target, self.port, e)))?;
        let mut sess = Session::new().map_err(ssh_err)?;
        sess.set_tcp_stream(tcp);
        sess.handshake().map_err(ssh_err)?;

        match &self.key {
            Some(key) => sess.userauth_pubkey_file(&self.user, None, key, None),
            None => sess.userauth_agent(&self.user),
        }
        .map_err(|e| DrError::Transfer(format!("SSH authentication to {} failed: {}", target, e)))?;

        if !sess.authenticated() {
            return Err(DrError::Transfer(format!("SSH authentication to {} failed", target)));
        }
        Ok(sess)
    }
}

fn ssh_err(e: ssh2::Error) -> DrError {
    DrError::Transfer(format!("SSH: {}", e))
}

fn exec_blocking(sess: &Session, command: &str) -> Result<String> {
    debug!("Remote exec: {}", command);
    let mut channel = sess.channel_session().map_err(ssh_err)?;
    channel.exec(command).map_err(ssh_err)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;
    channel.wait_close().map_err(ssh_err)?;

    let status = channel.exit_status().map_err(ssh_err)?;
    if status != 0 {
        return Err(DrError::Process(format!(
            "remote `{}` exited with {}: {}",
            command,
            status,
            stderr.trim()
        )));
    }
    Ok(stdout)
}

/// Copy `local` into the existing remote directory `remote`
fn upload_tree(sess: &Session, local: &Path, remote: &Path) -> Result<u64> {
    let sftp = sess.sftp().map_err(ssh_err)?;
    let mut bytes = 0u64;

    for entry in walk_directory(local, &WalkOptions::default())? {
        let target = remote.join(&entry.relative_path);
        let mode = file_mode(&entry.path)?;
        match entry.kind {
            EntryKind::Dir => {
                sftp.mkdir(&target, mode as i32).map_err(ssh_err)?;
            }
            EntryKind::Symlink => {
                let link = std::fs::read_link(&entry.path)?;
                sftp.symlink(&target, &link).map_err(ssh_err)?;
            }
            EntryKind::File => {
                let mut src = File::open(&entry.path)?;
                let mut dst = sftp
                    .open_mode(
                        &target,
                        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                        mode as i32,
                        OpenType::File,
                    )
                    .map_err(ssh_err)?;
                bytes += std::io::copy(&mut src, &mut dst)?;
            }
        }
    }
    Ok(bytes)
}

#[async_trait]
impl RemoteHost for SshRemoteHost {
    async fn exec(&self, target: &str, command: &str) -> Result<String> {
        let host = self.clone();
        let target = target.to_string();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            let sess = host.connect(&target)?;
            exec_blocking(&sess, &command)
        })
        .await
        .map_err(|e| DrError::Transfer(format!("SSH task failed: {}", e)))?
    }

    async fn sync_dir(&self, target: &str, local: &Path, remote: &Path) -> Result<u64> {
        let host = self.clone();
        let target = target.to_string();
        let local = local.to_path_buf();
        let remote = remote.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let sess = host.connect(&target)?;
            exec_blocking(
                &sess,
                &format!("mkdir -p {}", shell_quote(&remote.to_string_lossy())),
            )?;
            let bytes = upload_tree(&sess, &local, &remote)?;
            info!(target_host = %target, bytes, "Synced {} to {}", local.display(), remote.display());
            Ok(bytes)
        })
        .await
        .map_err(|e| DrError::Transfer(format!("SSH task failed: {}", e)))?
    }
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
