//! Advisory lock scoped to a backup root

use crate::{Error, Result};
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lock file name inside the backup root
pub const LOCK_FILE: &str = ".lock";

/// Exclusive lock on a backup root, released on drop
#[derive(Debug)]
pub struct RootLock {
    file: File,
    path: PathBuf,
}

impl RootLock {
    /// Block until the exclusive lock for `root` is held
    pub fn acquire(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            Error::persistence(format!("failed to create {}: {}", root.display(), e))
        })?;

        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                Error::persistence(format!("failed to open lock {}: {}", path.display(), e))
            })?;

        FileExt::lock_exclusive(&file).map_err(|e| {
            Error::persistence(format!("failed to lock {}: {}", path.display(), e))
        })?;

        debug!("Acquired lock {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}
