//! Content hashing with BLAKE3
//!
//! Every hash recorded in a manifest is a lowercase hex BLAKE3 digest. Tree
//! digests fold a sorted `path -> hash` inventory into a single value so two
//! captures of an identical tree always agree.

use crate::inventory::{self, InventoryOptions};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A BLAKE3 content hash in hex form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wrap an already computed hex digest
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Get the hash as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_blake3(hash: blake3::Hash) -> Self {
        Self(hash.to_hex().to_string())
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_blake3(blake3::hash(data))
}

/// Compute BLAKE3 hash for a file in streaming fashion
pub fn hash_file<P: AsRef<Path>>(file_path: P) -> io::Result<ContentHash> {
    let mut file = File::open(file_path)?;
    let mut hasher = Hasher::new();

    io::copy(&mut file, &mut hasher)?;

    Ok(ContentHash::from_blake3(hasher.finalize()))
}

/// Digest of a whole inventory, independent of enumeration order
pub fn tree_hash(files: &BTreeMap<String, ContentHash>) -> ContentHash {
    let mut hasher = Hasher::new();
    for (path, hash) in files {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_str().as_bytes());
        hasher.update(b"\n");
    }
    ContentHash::from_blake3(hasher.finalize())
}

/// A writer that hashes every byte passing through it.
///
/// Used when copying artifacts so the recorded hash describes the bytes that
/// actually landed on disk.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            written: 0,
        }
    }

    /// Consume the writer, returning the inner writer, the digest and the byte count
    pub fn finish(self) -> (W, ContentHash, u64) {
        let hash = ContentHash::from_blake3(self.hasher.finalize());
        (self.inner, hash, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Per-file hashes for a directory tree
#[derive(Debug, Default)]
pub struct TreeHashes {
    /// Relative path -> content hash for every readable file
    pub files: BTreeMap<String, ContentHash>,
    /// Files (or walk entries) that could not be read, with the error text
    pub errors: Vec<(PathBuf, String)>,
}

impl TreeHashes {
    /// Digest over `files`
    pub fn digest(&self) -> ContentHash {
        tree_hash(&self.files)
    }
}

/// Enumerate and hash every file under `root`.
///
/// Fails only when `root` itself cannot be read; individual unreadable files
/// land in [`TreeHashes::errors`].
pub fn hash_directory(root: &Path, options: &InventoryOptions) -> io::Result<TreeHashes> {
    let listing = inventory::list_files(root, options)?;
    let mut tree = inventory::hash_files(&listing.files);
    tree.errors.extend(listing.errors);
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_hash_bytes() {
        let hash = hash_bytes(b"hello world");

        // BLAKE3 hash of "hello world"
        assert_eq!(
            hash.as_str(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_hash_file_matches_bytes() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("data.bin");
        fs::write(&path, b"some file content")?;

        assert_eq!(hash_file(&path)?, hash_bytes(b"some file content"));
        Ok(())
    }

    #[test]
    fn test_tree_hash_depends_on_paths_and_content() {
        let mut a = BTreeMap::new();
        a.insert("a.txt".to_string(), hash_bytes(b"1"));
        a.insert("b.txt".to_string(), hash_bytes(b"2"));

        let mut renamed = a.clone();
        let moved = renamed.remove("b.txt").unwrap();
        renamed.insert("c.txt".to_string(), moved);

        let mut changed = a.clone();
        changed.insert("b.txt".to_string(), hash_bytes(b"3"));

        assert_ne!(tree_hash(&a), tree_hash(&renamed));
        assert_ne!(tree_hash(&a), tree_hash(&changed));
        assert_eq!(tree_hash(&a), tree_hash(&a.clone()));
    }

    #[test]
    fn test_hashing_writer() -> io::Result<()> {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"hello ")?;
        writer.write_all(b"world")?;
        let (buf, hash, written) = writer.finish();

        assert_eq!(buf, b"hello world");
        assert_eq!(written, 11);
        assert_eq!(hash, hash_bytes(b"hello world"));
        Ok(())
    }

    #[test]
    fn test_hash_directory() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("nested"))?;
        fs::write(temp_dir.path().join("top.txt"), b"top")?;
        fs::write(temp_dir.path().join("nested/inner.txt"), b"inner")?;

        let tree = hash_directory(temp_dir.path(), &InventoryOptions::default())?;
        assert!(tree.errors.is_empty());
        assert_eq!(tree.files.len(), 2);
        assert_eq!(tree.files["nested/inner.txt"], hash_bytes(b"inner"));
        Ok(())
    }
}
