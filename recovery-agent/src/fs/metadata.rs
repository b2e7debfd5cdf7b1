//! File permission and ownership handling for restored data directories.

use crate::utils::errors::{DrError, Result};
use nix::unistd::{Gid, Group, Uid, User};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Unix mode bits of a path (symlinks are not followed)
pub fn file_mode(path: &Path) -> std::io::Result<u32> {
    Ok(fs::symlink_metadata(path)?.permissions().mode() & 0o7777)
}

/// Apply archived mode bits to a restored path
pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

/// Resolved owner for restored files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: Uid,
    pub gid: Option<Gid>,
}

impl Owner {
    /// Parse `user`, `user:group`, or numeric `uid:gid`
    pub fn parse(spec: &str) -> Result<Self> {
        let (user, group) = match spec.split_once(':') {
            Some((u, g)) => (u, Some(g)),
            None => (spec, None),
        };

        let uid = match user.parse::<u32>() {
            Ok(raw) => Uid::from_raw(raw),
            Err(_) => User::from_name(user)
                .map_err(|e| DrError::Config(format!("cannot look up user {}: {}", user, e)))?
                .ok_or_else(|| DrError::Config(format!("unknown user: {}", user)))?
                .uid,
        };

        let gid = match group {
            None => None,
            Some(g) => Some(match g.parse::<u32>() {
                Ok(raw) => Gid::from_raw(raw),
                Err(_) => Group::from_name(g)
                    .map_err(|e| DrError::Config(format!("cannot look up group {}: {}", g, e)))?
                    .ok_or_else(|| DrError::Config(format!("unknown group: {}", g)))?
                    .gid,
            }),
        };

        Ok(Self { uid, gid })
    }

    /// Recursively hand a restored tree to this owner
    pub fn apply_recursive(&self, root: &Path) -> Result<()> {
        for entry in walkdir::WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(std::io::Error::from)?;
            std::os::unix::fs::lchown(
                entry.path(),
                Some(self.uid.as_raw()),
                self.gid.map(|g| g.as_raw()),
            )?;
        }
        Ok(())
    }
}
