//! File system utilities for archive selection and restore fix-ups.

pub mod metadata;
pub mod overlay;
pub mod walker;

pub use metadata::Owner;
pub use overlay::fill_missing;
pub use walker::{walk_directory, EntryKind, FileInfo, WalkOptions};
