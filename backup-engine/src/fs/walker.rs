//! Directory traversal for archive building.
//!
//! Walks are deterministic (children sorted by name) and never follow
//! symlinks. Excluded paths are pruned together with everything below them.

use super::metadata::FileMetadata;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// An entry discovered during walking
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Full path to the entry
    pub path: PathBuf,

    /// Path relative to the walk root; empty for the root itself
    pub relative_path: PathBuf,

    /// Depth from the root
    pub depth: usize,

    pub metadata: FileMetadata,
}

/// Walk `root` in pre-order, skipping every path for which `is_excluded`
/// returns true. The root itself is always visited.
pub fn walk_tree<F>(root: &Path, is_excluded: F) -> io::Result<Vec<WalkEntry>>
where
    F: Fn(&Path) -> bool,
{
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e.path()));

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let metadata = FileMetadata::from_metadata(&entry.metadata()?);

        entries.push(WalkEntry {
            path,
            relative_path,
            depth: entry.depth(),
            metadata,
        });
    }

    Ok(entries)
}
