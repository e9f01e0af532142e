//! Backup verification against manifests

use crate::hash::{self, ContentHash};
use crate::inventory::{self, InventoryOptions};
use crate::manifest::BackupManifest;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, span, warn, Level};

/// Expected vs. recomputed hash of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashMismatch {
    pub expected: ContentHash,
    /// `None` when the file exists but could not be read
    pub actual: Option<ContentHash>,
}

/// Outcome of verifying one backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub backup_id: String,
    pub expected_file_count: usize,
    pub actual_file_count: usize,
    pub mismatches: BTreeMap<String, HashMismatch>,
    pub missing_files: BTreeSet<String>,
    pub extra_files: BTreeSet<String>,
}

impl VerificationResult {
    pub fn count_matches(&self) -> bool {
        self.expected_file_count == self.actual_file_count
    }

    /// True when the artifacts match the manifest exactly
    pub fn is_clean(&self) -> bool {
        self.count_matches()
            && self.mismatches.is_empty()
            && self.missing_files.is_empty()
            && self.extra_files.is_empty()
    }
}

/// Checks stored backups against their manifests. Never writes.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    options: InventoryOptions,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the file-count check and the hash check and merge the results
    pub fn verify(&self, manifest: &BackupManifest, location: &Path) -> VerificationResult {
        let span = span!(Level::INFO, "verify", backup_id = %manifest.id());
        let _enter = span.enter();

        let listing = match inventory::list_files(location, &self.options) {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Backup location {} unreadable: {}", location.display(), e);
                Default::default()
            }
        };
        for (path, reason) in &listing.errors {
            warn!("Unreadable entry {} during verify: {}", path.display(), reason);
        }

        let on_disk: BTreeSet<String> = listing.files.into_iter().map(|f| f.relative).collect();
        let expected = manifest.file_hashes();

        let missing_files: BTreeSet<String> = expected
            .keys()
            .filter(|path| !on_disk.contains(*path))
            .cloned()
            .collect();

        let extra_files: BTreeSet<String> = on_disk
            .iter()
            .filter(|path| !expected.contains_key(*path))
            .cloned()
            .collect();

        let mismatches: BTreeMap<String, HashMismatch> = expected
            .par_iter()
            .filter(|(path, _)| on_disk.contains(*path))
            .filter_map(|(path, expected_hash)| {
                let actual = match hash::hash_file(location.join(path)) {
                    Ok(actual) if actual == *expected_hash => return None,
                    Ok(actual) => Some(actual),
                    Err(e) => {
                        debug!("Cannot hash {}: {}", path, e);
                        None
                    }
                };
                Some((
                    path.clone(),
                    HashMismatch {
                        expected: expected_hash.clone(),
                        actual,
                    },
                ))
            })
            .collect();

        let result = VerificationResult {
            backup_id: manifest.id().to_string(),
            expected_file_count: manifest.file_count(),
            actual_file_count: on_disk.len(),
            mismatches,
            missing_files,
            extra_files,
        };

        if result.is_clean() {
            info!("Backup {} verified: {} files", result.backup_id, result.actual_file_count);
        } else {
            warn!(
                "Backup {} failed verification: {} mismatched, {} missing, {} extra, count {}/{}",
                result.backup_id,
                result.mismatches.len(),
                result.missing_files.len(),
                result.extra_files.len(),
                result.actual_file_count,
                result.expected_file_count
            );
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SystemState;
    use chrono::Utc;
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    fn manifest_for(dir: &Path) -> BackupManifest {
        let tree = hash::hash_directory(dir, &InventoryOptions::default()).unwrap();
        let state = SystemState {
            captured_at: Utc::now(),
            revision: None,
            config_hashes: BTreeMap::new(),
            missing_configs: Vec::new(),
            file_count: tree.files.len(),
            tree_hash: tree.digest(),
            engine_version: "test".to_string(),
            platform: "test/test".to_string(),
        };
        BackupManifest::new("b1".to_string(), Utc::now(), state, tree.files)
    }

    fn populate(dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir.join("sub"))?;
        fs::write(dir.join("one.txt"), b"one")?;
        fs::write(dir.join("two.txt"), b"two")?;
        fs::write(dir.join("sub/three.txt"), b"three")?;
        Ok(())
    }

    #[test]
    fn test_clean_backup() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let manifest = manifest_for(temp_dir.path());

        let result = Verifier::new().verify(&manifest, temp_dir.path());
        assert!(result.is_clean());
        assert_eq!(result.actual_file_count, 3);
        Ok(())
    }

    #[test]
    fn test_extra_file_is_reported() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let manifest = manifest_for(temp_dir.path());
        fs::write(temp_dir.path().join("sub/new.txt"), b"new")?;

        let result = Verifier::new().verify(&manifest, temp_dir.path());
        assert_eq!(
            result.extra_files.iter().collect::<Vec<_>>(),
            vec!["sub/new.txt"]
        );
        assert!(result.mismatches.is_empty());
        assert!(!result.count_matches());
        Ok(())
    }

    #[test]
    fn test_missing_location_reports_every_file_missing() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let manifest = manifest_for(temp_dir.path());

        let result = Verifier::new().verify(&manifest, &temp_dir.path().join("absent"));
        assert_eq!(result.actual_file_count, 0);
        assert_eq!(result.missing_files.len(), 3);
        assert!(result.mismatches.is_empty());
        Ok(())
    }

    #[test]
    fn test_verification_is_read_only() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        populate(temp_dir.path())?;
        let manifest = manifest_for(temp_dir.path());
        fs::write(temp_dir.path().join("one.txt"), b"changed")?;

        let before = manifest.clone();
        let _ = Verifier::new().verify(&manifest, temp_dir.path());
        assert_eq!(manifest, before);
        assert_eq!(fs::read(temp_dir.path().join("one.txt"))?, b"changed");
        Ok(())
    }
}
