//! Archive creation and extraction.
//!
//! An archive is a zstd stream holding a magic header followed by framed
//! entries, in walk order:
//!
//! | field       | encoding                         |
//! |-------------|----------------------------------|
//! | tag         | u8 (0 end, 1 file, 2 dir, 3 link)|
//! | path        | u32 LE length + raw bytes        |
//! | mode        | u32 LE                           |
//! | file body   | u64 LE length + bytes            |
//! | link target | u32 LE length + raw bytes        |
//!
//! Paths are relative to the archived root and are validated on extraction so
//! an archive can never write outside its destination.

pub mod crypto;

use crate::fs::metadata::{apply_mode, file_mode};
use crate::fs::walker::{walk_directory, EntryKind, WalkOptions};
use crate::utils::errors::{DrError, Result};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

const MAGIC: &[u8; 4] = b"DRA1";

const TAG_END: u8 = 0;
const TAG_FILE: u8 = 1;
const TAG_DIR: u8 = 2;
const TAG_SYMLINK: u8 = 3;

/// Totals for an archive that was written or extracted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub dirs: usize,
    pub bytes: u64,
}

/// Packs a directory selection into a single artifact and back.
pub trait Archiver: Send + Sync {
    /// Archive the entries of `root` selected by `options` into `dest`.
    fn create(&self, root: &Path, options: &WalkOptions, dest: &Path) -> Result<ArchiveSummary>;

    /// Extract `archive` into `dest`, which is created if missing.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<ArchiveSummary>;
}

/// Native archiver writing zstd-compressed framed entries
#[derive(Debug, Clone)]
pub struct ZstdArchiver {
    level: i32,
}

impl ZstdArchiver {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    fn write_archive(&self, root: &Path, options: &WalkOptions, dest: &Path) -> io::Result<ArchiveSummary> {
        let entries = walk_directory(root, options)?;
        let out = BufWriter::new(File::create(dest)?);
        let mut encoder = zstd::stream::write::Encoder::new(out, self.level)?;
        encoder.write_all(MAGIC)?;

        let mut summary = ArchiveSummary::default();
        for entry in &entries {
            let mode = file_mode(&entry.path)?;
            match entry.kind {
                EntryKind::Dir => {
                    write_header(&mut encoder, TAG_DIR, &entry.relative_path, mode)?;
                    summary.dirs += 1;
                }
                EntryKind::Symlink => {
                    let target = fs::read_link(&entry.path)?;
                    write_header(&mut encoder, TAG_SYMLINK, &entry.relative_path, mode)?;
                    write_bytes(&mut encoder, target.as_os_str().as_bytes())?;
                }
                EntryKind::File => {
                    let mut file = File::open(&entry.path)?;
                    // Length is fixed at open time; growth after this point is
                    // not captured (incremental backups of live paths).
                    let len = file.metadata()?.len();
                    write_header(&mut encoder, TAG_FILE, &entry.relative_path, mode)?;
                    encoder.write_all(&len.to_le_bytes())?;
                    let copied = io::copy(&mut (&mut file).take(len), &mut encoder)?;
                    if copied != len {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("{} shrank while being archived", entry.path.display()),
                        ));
                    }
                    summary.files += 1;
                    summary.bytes += len;
                }
            }
        }

        encoder.write_all(&[TAG_END])?;
        let mut out = encoder.finish()?;
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(summary)
    }

    fn read_archive(&self, archive: &Path, dest: &Path) -> Result<ArchiveSummary> {
        let input = BufReader::new(File::open(archive)?);
        let mut decoder = zstd::stream::read::Decoder::new(input)?;

        let mut magic = [0u8; 4];
        decoder.read_exact(&mut magic).map_err(|e| corrupt(archive, e))?;
        if &magic != MAGIC {
            return Err(DrError::Archive(format!(
                "{} is not a recovery archive",
                archive.display()
            )));
        }

        fs::create_dir_all(dest)?;
        let mut summary = ArchiveSummary::default();
        let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

        loop {
            let tag = read_u8(&mut decoder).map_err(|e| corrupt(archive, e))?;
            if tag == TAG_END {
                break;
            }
            let relative = read_path(&mut decoder).map_err(|e| corrupt(archive, e))?;
            let mode = read_u32(&mut decoder).map_err(|e| corrupt(archive, e))?;
            let target = dest.join(&relative);
            if let Some(link) = symlink_on_path(dest, &relative)? {
                return Err(DrError::Archive(format!(
                    "{} entry {} passes through symlink {}",
                    archive.display(),
                    relative.display(),
                    link.display()
                )));
            }

            match tag {
                TAG_DIR => {
                    fs::create_dir_all(&target)?;
                    dir_modes.push((target, mode));
                    summary.dirs += 1;
                }
                TAG_FILE => {
                    let len = read_u64(&mut decoder).map_err(|e| corrupt(archive, e))?;
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let mut out = BufWriter::new(File::create(&target)?);
                    let copied = io::copy(&mut (&mut decoder).take(len), &mut out)?;
                    if copied != len {
                        return Err(DrError::Archive(format!(
                            "{} is truncated at {}",
                            archive.display(),
                            relative.display()
                        )));
                    }
                    out.flush()?;
                    drop(out);
                    apply_mode(&target, mode)?;
                    summary.files += 1;
                    summary.bytes += len;
                }
                TAG_SYMLINK => {
                    let link = read_raw(&mut decoder).map_err(|e| corrupt(archive, e))?;
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    std::os::unix::fs::symlink(OsStr::from_bytes(&link), &target)?;
                }
                other => {
                    return Err(DrError::Archive(format!(
                        "{} contains unknown entry tag {}",
                        archive.display(),
                        other
                    )));
                }
            }
        }

        // Directory modes last, deepest first, so read-only directories do not
        // block their own contents.
        for (dir, mode) in dir_modes.into_iter().rev() {
            apply_mode(&dir, mode)?;
        }

        debug!(
            "Extracted {} files, {} dirs, {} bytes into {}",
            summary.files,
            summary.dirs,
            summary.bytes,
            dest.display()
        );
        Ok(summary)
    }
}

impl Archiver for ZstdArchiver {
    fn create(&self, root: &Path, options: &WalkOptions, dest: &Path) -> Result<ArchiveSummary> {
        if !root.is_dir() {
            return Err(DrError::Archive(format!(
                "source directory {} does not exist",
                root.display()
            )));
        }
        self.write_archive(root, options, dest).map_err(|e| {
            let _ = fs::remove_file(dest);
            DrError::Archive(format!("failed to archive {}: {}", root.display(), e))
        })
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<ArchiveSummary> {
        self.read_archive(archive, dest)
    }
}

fn corrupt(archive: &Path, e: io::Error) -> DrError {
    DrError::Archive(format!("{} is corrupt or truncated: {}", archive.display(), e))
}

fn write_header<W: Write>(w: &mut W, tag: u8, path: &Path, mode: u32) -> io::Result<()> {
    w.write_all(&[tag])?;
    write_bytes(w, path.as_os_str().as_bytes())?;
    w.write_all(&mode.to_le_bytes())
}

fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_raw<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// First existing component of `dest/relative`, the entry itself included,
/// that is a symlink. Writing through one could land outside `dest`.
fn symlink_on_path(dest: &Path, relative: &Path) -> io::Result<Option<PathBuf>> {
    let mut current = dest.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(Some(current)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Read an entry path, rejecting anything that could escape the destination
fn read_path<R: Read>(r: &mut R) -> io::Result<PathBuf> {
    let raw = read_raw(r)?;
    let path = PathBuf::from(OsStr::from_bytes(&raw));
    let safe = !raw.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path)
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsafe entry path {:?}", path),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) -> io::Result<()> {
        fs::create_dir_all(root.join("chaindata/ancient"))?;
        fs::create_dir_all(root.join("empty"))?;
        fs::write(root.join("chaindata/000001.sst"), vec![1u8; 10_000])?;
        fs::write(root.join("chaindata/ancient/bodies.cdat"), b"old bodies")?;
        fs::write(root.join("nodekey"), b"secret")?;
        fs::set_permissions(root.join("nodekey"), fs::Permissions::from_mode(0o600))?;
        std::os::unix::fs::symlink("nodekey", root.join("nodekey.link"))?;
        Ok(())
    }

    #[test]
    fn test_archive_and_extract_tree() -> Result<()> {
        let src = TempDir::new()?;
        let work = TempDir::new()?;
        sample_tree(src.path())?;

        let archiver = ZstdArchiver::new(3);
        let archive = work.path().join("a.dra");
        let written = archiver.create(src.path(), &WalkOptions::default(), &archive)?;
        assert_eq!(written.files, 3);

        let dest = work.path().join("restored");
        let read = archiver.extract(&archive, &dest)?;
        assert_eq!(read, written);

        assert_eq!(fs::read(dest.join("chaindata/000001.sst"))?, vec![1u8; 10_000]);
        assert!(dest.join("empty").is_dir());
        assert_eq!(file_mode(&dest.join("nodekey"))?, 0o600);
        assert_eq!(fs::read_link(dest.join("nodekey.link"))?, PathBuf::from("nodekey"));
        Ok(())
    }

    #[test]
    fn test_identical_trees_give_identical_archives() -> Result<()> {
        let src = TempDir::new()?;
        let work = TempDir::new()?;
        sample_tree(src.path())?;

        let archiver = ZstdArchiver::new(3);
        let a = work.path().join("a.dra");
        let b = work.path().join("b.dra");
        archiver.create(src.path(), &WalkOptions::default(), &a)?;
        archiver.create(src.path(), &WalkOptions::default(), &b)?;
        assert_eq!(fs::read(a)?, fs::read(b)?);
        Ok(())
    }

    #[test]
    fn test_excluded_paths_are_not_archived() -> Result<()> {
        let src = TempDir::new()?;
        let work = TempDir::new()?;
        sample_tree(src.path())?;

        let options = WalkOptions {
            include: vec![PathBuf::from("chaindata")],
            exclude_patterns: vec!["ancient".into()],
            ..Default::default()
        };
        let archiver = ZstdArchiver::new(3);
        let archive = work.path().join("inc.dra");
        archiver.create(src.path(), &options, &archive)?;

        let dest = work.path().join("restored");
        archiver.extract(&archive, &dest)?;
        assert!(dest.join("chaindata/000001.sst").exists());
        assert!(!dest.join("chaindata/ancient").exists());
        assert!(!dest.join("nodekey").exists());
        Ok(())
    }

    #[test]
    fn test_missing_source_is_archive_error() {
        let work = TempDir::new().unwrap();
        let archiver = ZstdArchiver::new(3);
        let err = archiver
            .create(
                &work.path().join("nope"),
                &WalkOptions::default(),
                &work.path().join("x.dra"),
            )
            .unwrap_err();
        assert!(matches!(err, DrError::Archive(_)));
    }

    #[test]
    fn test_unsafe_path_is_rejected() {
        let mut raw = Vec::new();
        write_bytes(&mut raw, b"../escape").unwrap();
        assert!(read_path(&mut raw.as_slice()).is_err());

        let mut raw = Vec::new();
        write_bytes(&mut raw, b"/etc/passwd").unwrap();
        assert!(read_path(&mut raw.as_slice()).is_err());
    }

    fn encode(entries: &[(u8, &str, &[u8])]) -> io::Result<Vec<u8>> {
        let mut raw = Vec::new();
        raw.extend_from_slice(MAGIC);
        for (tag, path, body) in entries {
            write_header(&mut raw, *tag, Path::new(path), 0o644)?;
            match *tag {
                TAG_FILE => {
                    raw.extend_from_slice(&(body.len() as u64).to_le_bytes());
                    raw.extend_from_slice(body);
                }
                TAG_SYMLINK => write_bytes(&mut raw, body)?,
                _ => {}
            }
        }
        raw.push(TAG_END);
        zstd::encode_all(raw.as_slice(), 3)
    }

    #[test]
    fn test_writes_through_symlinks_are_rejected() -> Result<()> {
        let work = TempDir::new()?;
        let outside = work.path().join("outside");
        fs::create_dir_all(&outside)?;
        let outside_str = outside.to_string_lossy().to_string();
        let victim = outside.join("victim");
        fs::write(&victim, b"original")?;
        let victim_str = victim.to_string_lossy().to_string();
        let archiver = ZstdArchiver::new(3);

        let cases: [(&str, Vec<(u8, &str, &[u8])>); 3] = [
            (
                "dir-link",
                vec![(TAG_SYMLINK, "evil", outside_str.as_bytes()), (TAG_FILE, "evil/pwned", &b"x"[..])],
            ),
            (
                "nested-link",
                vec![(TAG_SYMLINK, "evil", outside_str.as_bytes()), (TAG_DIR, "evil/sub", &b""[..])],
            ),
            (
                "file-link",
                vec![(TAG_SYMLINK, "evil", victim_str.as_bytes()), (TAG_FILE, "evil", &b"overwritten"[..])],
            ),
        ];

        for (name, entries) in cases {
            let archive = work.path().join(format!("{}.dra", name));
            fs::write(&archive, encode(&entries)?)?;
            let err = archiver
                .extract(&archive, &work.path().join(name))
                .unwrap_err();
            assert!(matches!(err, DrError::Archive(_)), "{}: {}", name, err);
        }

        assert!(!outside.join("pwned").exists());
        assert!(!outside.join("sub").exists());
        assert_eq!(fs::read(&victim)?, b"original");
        Ok(())
    }

    #[test]
    fn test_truncated_archive_is_rejected() -> Result<()> {
        let src = TempDir::new()?;
        let work = TempDir::new()?;
        sample_tree(src.path())?;

        let archiver = ZstdArchiver::new(3);
        let archive = work.path().join("a.dra");
        archiver.create(src.path(), &WalkOptions::default(), &archive)?;
        let bytes = fs::read(&archive)?;
        fs::write(&archive, &bytes[..bytes.len() / 2])?;

        let err = archiver.extract(&archive, &work.path().join("out")).unwrap_err();
        assert!(matches!(err, DrError::Archive(_) | DrError::Io(_)));
        Ok(())
    }
}
