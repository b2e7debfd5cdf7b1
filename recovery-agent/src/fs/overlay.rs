//! Fill a freshly extracted tree with whatever it lacks from another tree.
//!
//! Used when restoring an incremental archive: the archive carries only a
//! subset of the data directory, the rest is taken from the current one.

use super::metadata::{apply_mode, file_mode};
use super::walker::{walk_directory, EntryKind, WalkOptions};
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// Copy every entry of `from` accepted by `carry` (called with the relative
/// path) that has no counterpart in `into`. Entries already present in `into`
/// always win. Returns the number of entries copied.
pub fn fill_missing<F>(from: &Path, into: &Path, carry: F) -> io::Result<usize>
where
    F: Fn(&Path) -> bool,
{
    if !from.is_dir() {
        return Ok(0);
    }

    let mut copied = 0;
    for entry in walk_directory(from, &WalkOptions::default())? {
        let target = into.join(&entry.relative_path);
        if !carry(&entry.relative_path) || target.symlink_metadata().is_ok() {
            continue;
        }

        match entry.kind {
            EntryKind::Dir => {
                fs::create_dir(&target)?;
                apply_mode(&target, file_mode(&entry.path)?)?;
            }
            EntryKind::File => {
                // fs::copy carries the permission bits over
                fs::copy(&entry.path, &target)?;
            }
            EntryKind::Symlink => {
                std::os::unix::fs::symlink(fs::read_link(&entry.path)?, &target)?;
            }
        }
        debug!("Carried over {}", entry.relative_path.display());
        copied += 1;
    }
    Ok(copied)
}
