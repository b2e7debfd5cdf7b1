//! Directory traversal for archive selection.
//!
//! Walks the node data directory (or a subset of it) in a stable order,
//! pruning excluded names so transient files and historical subdirectories
//! never reach the archiver.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Subpaths (relative to the root) to walk; empty walks the whole root
    pub include: Vec<PathBuf>,

    /// Exclude patterns: `*suffix`, `prefix*`, or an exact file name
    pub exclude_patterns: Vec<String>,
}

/// Kind of entry discovered during walking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (0 for directories and symlinks)
    pub size: u64,

    pub kind: EntryKind,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let kind = if entry.path_is_symlink() && !entry.file_type().is_dir() {
            EntryKind::Symlink
        } else if metadata.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        Ok(Self {
            path,
            relative_path,
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
            kind,
        })
    }
}

/// Walk the selected part of a directory tree.
///
/// Directories are reported before their contents and siblings are sorted by
/// name, so identical trees always produce identical listings. The root
/// itself is not reported. Include paths that do not exist are skipped.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();

    let starts: Vec<PathBuf> = if options.include.is_empty() {
        vec![root.to_path_buf()]
    } else {
        let mut starts: Vec<PathBuf> = options.include.iter().map(|p| root.join(p)).collect();
        starts.sort();
        starts.dedup();
        starts
    };

    for start in starts {
        if !start.exists() {
            tracing::debug!("Skipping missing path: {}", start.display());
            continue;
        }

        // Parent directories of an include path are recorded so that the
        // restored tree keeps their modes.
        if start != root {
            if let Ok(rel) = start.strip_prefix(root) {
                let mut ancestor = PathBuf::new();
                for component in rel.parent().into_iter().flat_map(|p| p.components()) {
                    ancestor.push(component);
                    if !entries.iter().any(|e: &FileInfo| e.relative_path == ancestor) {
                        entries.push(FileInfo {
                            path: root.join(&ancestor),
                            relative_path: ancestor.clone(),
                            size: 0,
                            kind: EntryKind::Dir,
                        });
                    }
                }
            }
        }

        let walker = WalkDir::new(&start)
            .follow_links(options.follow_links)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.exclude_patterns));

        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.path() == root {
                continue;
            }
            entries.push(FileInfo::from_entry(&entry, root)?);
        }
    }

    Ok(entries)
}

/// Calculate total size of all files selected by the options
pub fn calculate_total_size(root: &Path, options: &WalkOptions) -> std::io::Result<u64> {
    Ok(walk_directory(root, options)?
        .iter()
        .filter(|e| e.kind == EntryKind::File)
        .map(|e| e.size)
        .sum())
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|p| matches_pattern(&file_name, p))
}

/// Match a file name against `*suffix`, `prefix*`, or an exact name
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        name == pattern
    }
}
