//! State capture
//!
//! Produces an immutable [`SystemState`] for a source tree together with the
//! per-file hash inventory the orchestrator turns into a manifest.

use crate::hash::{self, ContentHash};
use crate::inventory::{self, FileEntry, InventoryOptions};
use crate::manifest::SystemState;
use crate::{Error, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, span, warn, Level};

/// Source of the revision identifier recorded with each capture
pub trait RevisionProvider: Send + Sync + fmt::Debug {
    /// `Ok(None)` when the tree is not under version control.
    /// `Err` only for failures that make the capture meaningless.
    fn revision(&self, root: &Path) -> Result<Option<String>>;
}

/// Reads `HEAD` with the `git` binary
#[derive(Debug, Default, Clone)]
pub struct GitRevision;

impl RevisionProvider for GitRevision {
    fn revision(&self, root: &Path) -> Result<Option<String>> {
        let output = match Command::new("git")
            .arg("-C")
            .arg(root)
            .args(["rev-parse", "HEAD"])
            .output()
        {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("git not installed, recording no revision");
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::capture(format!("failed to query revision: {}", e)));
            }
        };

        if !output.status.success() {
            debug!("{} is not a git work tree", root.display());
            return Ok(None);
        }

        let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!revision.is_empty()).then_some(revision))
    }
}

/// Records no revision
#[derive(Debug, Default, Clone)]
pub struct NoRevision;

impl RevisionProvider for NoRevision {
    fn revision(&self, _root: &Path) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Non-fatal condition met while capturing or writing a backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureWarning {
    /// A tracked configuration file was absent or unreadable
    MissingTrackedConfig { path: String, reason: String },
    /// A file under the source root could not be read
    UnreadableFile { path: PathBuf, reason: String },
    /// A file's content changed between hashing and copying
    ChangedDuringBackup { path: String },
}

impl fmt::Display for CaptureWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureWarning::MissingTrackedConfig { path, reason } => {
                write!(f, "tracked config {} missing: {}", path, reason)
            }
            CaptureWarning::UnreadableFile { path, reason } => {
                write!(f, "unreadable file {}: {}", path.display(), reason)
            }
            CaptureWarning::ChangedDuringBackup { path } => {
                write!(f, "{} changed during backup", path)
            }
        }
    }
}

/// Settings for one capture
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub source_root: PathBuf,
    /// Configuration files to fingerprint, relative to `source_root` or absolute
    pub tracked_configs: Vec<PathBuf>,
    /// Fail the capture on the first unreadable file
    pub strict: bool,
    pub inventory: InventoryOptions,
}

/// Output of a successful capture
#[derive(Debug, Clone)]
pub struct Capture {
    pub state: SystemState,
    /// Relative path -> content hash for every captured file
    pub file_hashes: BTreeMap<String, ContentHash>,
    /// Files on disk backing `file_hashes`
    pub files: Vec<FileEntry>,
    pub warnings: Vec<CaptureWarning>,
}

/// Captures system state snapshots
#[derive(Debug)]
pub struct StateCapturer {
    config: CaptureConfig,
    revisions: Arc<dyn RevisionProvider>,
}

impl StateCapturer {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            revisions: Arc::new(GitRevision),
        }
    }

    /// Replace the revision source
    pub fn with_revision_provider(mut self, provider: Arc<dyn RevisionProvider>) -> Self {
        self.revisions = provider;
        self
    }

    /// Gather revision, tracked config hashes and the full file inventory
    pub fn capture(&self) -> Result<Capture> {
        let root = &self.config.source_root;
        let span = span!(Level::INFO, "capture", root = %root.display());
        let _enter = span.enter();

        let captured_at = Utc::now();
        let mut warnings = Vec::new();

        let revision = self.revisions.revision(root)?;

        let mut config_hashes = BTreeMap::new();
        let mut missing_configs = Vec::new();
        for tracked in &self.config.tracked_configs {
            let (key, path) = if tracked.is_absolute() {
                (tracked.display().to_string(), tracked.clone())
            } else {
                (inventory::normalize_relative(tracked), root.join(tracked))
            };

            match hash::hash_file(&path) {
                Ok(hash) => {
                    config_hashes.insert(key, hash);
                }
                Err(e) => {
                    warn!("Tracked config {} not captured: {}", key, e);
                    missing_configs.push(key.clone());
                    warnings.push(CaptureWarning::MissingTrackedConfig {
                        path: key,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let listing = inventory::list_files(root, &self.config.inventory).map_err(|e| {
            Error::capture(format!("cannot read source root {}: {}", root.display(), e))
        })?;
        let mut tree = inventory::hash_files(&listing.files);

        let unreadable: Vec<_> = listing
            .errors
            .into_iter()
            .chain(std::mem::take(&mut tree.errors))
            .collect();
        if self.config.strict {
            if let Some((path, reason)) = unreadable.first() {
                return Err(Error::capture(format!(
                    "strict mode: unreadable file {}: {}",
                    path.display(),
                    reason
                )));
            }
        }
        for (path, reason) in unreadable {
            warn!("Skipping unreadable file {}: {}", path.display(), reason);
            warnings.push(CaptureWarning::UnreadableFile { path, reason });
        }

        let files: Vec<FileEntry> = listing
            .files
            .into_iter()
            .filter(|f| tree.files.contains_key(&f.relative))
            .collect();

        let state = SystemState {
            captured_at,
            revision,
            config_hashes,
            missing_configs,
            file_count: tree.files.len(),
            tree_hash: tree.digest(),
            engine_version: crate::VERSION.to_string(),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        };

        info!(
            "Captured {} files ({} warnings)",
            state.file_count,
            warnings.len()
        );

        Ok(Capture {
            state,
            file_hashes: tree.files,
            files,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct FixedRevision(&'static str);

    impl RevisionProvider for FixedRevision {
        fn revision(&self, _root: &Path) -> Result<Option<String>> {
            Ok(Some(self.0.to_string()))
        }
    }

    #[derive(Debug)]
    struct BrokenRevision;

    impl RevisionProvider for BrokenRevision {
        fn revision(&self, _root: &Path) -> Result<Option<String>> {
            Err(Error::capture("vcs exploded"))
        }
    }

    fn config(root: &Path) -> CaptureConfig {
        CaptureConfig {
            source_root: root.to_path_buf(),
            tracked_configs: vec![PathBuf::from("app.toml")],
            strict: false,
            inventory: InventoryOptions::default(),
        }
    }

    #[test]
    fn test_capture_records_files_and_configs() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("app.toml"), b"key = 1")?;
        fs::write(temp_dir.path().join("data.txt"), b"data")?;

        let capturer = StateCapturer::new(config(temp_dir.path()))
            .with_revision_provider(Arc::new(FixedRevision("deadbeef")));
        let capture = capturer.capture()?;

        assert_eq!(capture.state.revision.as_deref(), Some("deadbeef"));
        assert_eq!(capture.state.file_count, 2);
        assert_eq!(capture.files.len(), 2);
        assert_eq!(
            capture.state.config_hashes["app.toml"],
            hash::hash_bytes(b"key = 1")
        );
        assert_eq!(capture.state.tree_hash, hash::tree_hash(&capture.file_hashes));
        assert!(capture.warnings.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_tracked_config_is_a_warning() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("data.txt"), b"data")?;

        let capturer =
            StateCapturer::new(config(temp_dir.path())).with_revision_provider(Arc::new(NoRevision));
        let capture = capturer.capture()?;

        assert_eq!(capture.state.revision, None);
        assert_eq!(capture.state.missing_configs, vec!["app.toml".to_string()]);
        assert!(matches!(
            capture.warnings.as_slice(),
            [CaptureWarning::MissingTrackedConfig { .. }]
        ));
        Ok(())
    }

    #[test]
    fn test_missing_source_root_fails() {
        let temp_dir = TempDir::new().unwrap();
        let capturer = StateCapturer::new(config(&temp_dir.path().join("gone")))
            .with_revision_provider(Arc::new(NoRevision));

        assert!(matches!(capturer.capture(), Err(Error::Capture { .. })));
    }

    #[test]
    fn test_revision_failure_fails_capture() {
        let temp_dir = TempDir::new().unwrap();
        let capturer = StateCapturer::new(config(temp_dir.path()))
            .with_revision_provider(Arc::new(BrokenRevision));

        assert!(matches!(capturer.capture(), Err(Error::Capture { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_strict_mode_rejects_unreadable_file() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new()?;
        let locked = temp_dir.path().join("locked.txt");
        fs::write(&locked, b"secret")?;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000))?;

        // Root can read anything; nothing to assert in that case
        if fs::read(&locked).is_ok() {
            return Ok(());
        }

        let lenient =
            StateCapturer::new(config(temp_dir.path())).with_revision_provider(Arc::new(NoRevision));
        let capture = lenient.capture()?;
        assert_eq!(capture.state.file_count, 0);
        assert!(capture
            .warnings
            .iter()
            .any(|w| matches!(w, CaptureWarning::UnreadableFile { .. })));

        let mut strict_config = config(temp_dir.path());
        strict_config.strict = true;
        let strict = StateCapturer::new(strict_config).with_revision_provider(Arc::new(NoRevision));
        assert!(matches!(strict.capture(), Err(Error::Capture { .. })));
        Ok(())
    }

    #[test]
    fn test_git_revision_outside_repository() -> Result<()> {
        let temp_dir = TempDir::new()?;
        // Either git is missing or the temp dir is not a work tree
        assert_eq!(GitRevision.revision(temp_dir.path())?, None);
        Ok(())
    }
}
