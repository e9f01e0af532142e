//! File enumeration for capture and verification.
//!
//! Walks a root directory, prunes excluded entries and reports every regular
//! file with its `/`-separated path relative to the root. Entries that cannot
//! be read are collected rather than aborting the walk.

use crate::hash::{self, TreeHashes};
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Options for enumerating a tree
#[derive(Debug, Clone, Default)]
pub struct InventoryOptions {
    /// Whether to follow symbolic links to directories
    pub follow_symlinks: bool,
    /// Patterns to exclude (file name, path segment, or single `*` wildcard)
    pub exclude_patterns: Vec<String>,
}

/// A file discovered during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Full path on disk
    pub path: PathBuf,
    /// Path relative to the walk root, `/`-separated
    pub relative: String,
}

/// Result of enumerating a tree
#[derive(Debug, Default)]
pub struct Listing {
    pub files: Vec<FileEntry>,
    pub errors: Vec<(PathBuf, String)>,
}

/// Enumerate every file under `root`.
///
/// Fails only if `root` itself is missing or unreadable.
pub fn list_files(root: &Path, options: &InventoryOptions) -> io::Result<Listing> {
    // Surface an unreadable root as a hard error before walking
    fs::read_dir(root)?;

    let mut listing = Listing::default();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_excluded(entry, &options.exclude_patterns));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                debug!("Unreadable entry {}: {}", path.display(), e);
                listing.errors.push((path, e.to_string()));
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        if file_type.is_symlink() {
            // Resolve to decide whether the link points at a file
            match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_dir() => continue,
                Ok(_) => {}
                Err(e) => {
                    listing.errors.push((entry.path().to_path_buf(), e.to_string()));
                    continue;
                }
            }
        }

        let relative = match entry.path().strip_prefix(root) {
            Ok(rel) => normalize_relative(rel),
            Err(_) => continue,
        };

        listing.files.push(FileEntry {
            path: entry.path().to_path_buf(),
            relative,
        });
    }

    Ok(listing)
}

/// Hash a set of files in parallel.
///
/// Results are collected into a sorted map; unreadable files are reported in
/// [`TreeHashes::errors`].
pub fn hash_files(files: &[FileEntry]) -> TreeHashes {
    let results: Vec<_> = files
        .par_iter()
        .map(|file| (file, hash::hash_file(&file.path)))
        .collect();

    let mut tree = TreeHashes::default();
    for (file, result) in results {
        match result {
            Ok(hash) => {
                tree.files.insert(file.relative.clone(), hash);
            }
            Err(e) => tree.errors.push((file.path.clone(), e.to_string())),
        }
    }
    tree
}

/// Join the normal components of a relative path with `/`
pub fn normalize_relative(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Check if an entry should be excluded based on patterns
fn is_excluded(entry: &DirEntry, patterns: &[String]) -> bool {
    let name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| matches_pattern(&name, pattern))
}

/// Simple pattern matching (supports a single `*` wildcard)
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some((prefix, suffix)) = pattern.split_once('*') {
        if !suffix.contains('*') {
            return name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix);
        }
    }

    name == pattern
}
