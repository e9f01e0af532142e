//! Backup orchestration: capture, persist, prune and verify
//!
//! Layout of a backup root:
//!
//! ```text
//! <backup_root>/
//!   history.json           version history ledger
//!   .lock                  advisory lock for mutating operations
//!   snapshots/<id>/...     one directory per backup
//!   snapshots/.staging-*   artifacts still being written
//!   snapshots/.trash-*     artifacts being deleted by a prune
//! ```
//!
//! Artifacts are written to a staging directory and renamed into place
//! before the manifest is appended, so the ledger never references a
//! missing backup. Anything under `snapshots/` without a ledger entry is an
//! orphan and can be reclaimed.

use crate::capture::{CaptureWarning, GitRevision, RevisionProvider, StateCapturer};
use crate::config::EngineConfig;
use crate::events::{BackupEvent, EventSink, TracingSink};
use crate::hash::{tree_hash, ContentHash, HashingWriter};
use crate::lock::RootLock;
use crate::manifest::{BackupManifest, ManifestStore, VersionHistory};
use crate::verify::{VerificationResult, Verifier};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, span, warn, Level};

/// Directory holding one subdirectory per backup
pub const SNAPSHOTS_DIR: &str = "snapshots";

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// Writes one artifact file and reports the hash of the bytes written
pub trait ArtifactWriter: Send + Sync + fmt::Debug {
    fn write_file(&self, source: &mut dyn Read, dest: &Path) -> io::Result<ContentHash>;
}

/// Copies artifacts to the local filesystem and fsyncs them
#[derive(Debug, Default, Clone)]
pub struct FsArtifactWriter;

impl ArtifactWriter for FsArtifactWriter {
    fn write_file(&self, source: &mut dyn Read, dest: &Path) -> io::Result<ContentHash> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut writer = HashingWriter::new(File::create(dest)?);
        io::copy(source, &mut writer)?;
        writer.flush()?;
        let (file, hash, _) = writer.finish();
        file.sync_all()?;
        Ok(hash)
    }
}

/// Result of a successful backup run
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub manifest: BackupManifest,
    pub warnings: Vec<CaptureWarning>,
}

/// A discarded backup whose artifacts could not be removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneFailure {
    pub backup_id: String,
    pub reason: String,
}

/// Result of a prune run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Backups removed from the history
    pub discarded: Vec<String>,
    /// Backups still in the history
    pub retained: Vec<String>,
    /// Backups the policy discarded but which stay recorded
    pub failures: Vec<PruneFailure>,
    /// Trash directories left behind after their entries were dropped
    pub leftovers: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanKind {
    /// Partially written backup from an interrupted run
    Staging,
    /// Artifacts of a pruned backup that were not fully deleted
    Trash,
    /// Complete backup directory with no ledger entry
    Unreferenced,
}

/// Artifact directory with no corresponding manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Orphan {
    pub path: PathBuf,
    pub kind: OrphanKind,
}

/// Composes capture, manifest store, retention and verification
pub struct BackupOrchestrator {
    config: EngineConfig,
    store: ManifestStore,
    verifier: Verifier,
    revisions: Arc<dyn RevisionProvider>,
    writer: Arc<dyn ArtifactWriter>,
    sink: Option<Arc<dyn EventSink>>,
}

impl fmt::Debug for BackupOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupOrchestrator")
            .field("config", &self.config)
            .field("revisions", &self.revisions)
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

impl BackupOrchestrator {
    pub fn new(config: EngineConfig) -> Self {
        let store = ManifestStore::new(&config.backup_root);
        Self {
            config,
            store,
            verifier: Verifier::new(),
            revisions: Arc::new(GitRevision),
            writer: Arc::new(FsArtifactWriter),
            sink: Some(Arc::new(TracingSink)),
        }
    }

    /// Replace the event sink; `None` disables events
    pub fn with_event_sink(mut self, sink: Option<Arc<dyn EventSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_revision_provider(mut self, provider: Arc<dyn RevisionProvider>) -> Self {
        self.revisions = provider;
        self
    }

    pub fn with_artifact_writer(mut self, writer: Arc<dyn ArtifactWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.config.backup_root.join(SNAPSHOTS_DIR)
    }

    /// Directory holding the artifacts of backup `id`
    pub fn snapshot_path(&self, id: &str) -> PathBuf {
        self.snapshots_dir().join(id)
    }

    fn trash_path(&self, id: &str) -> PathBuf {
        self.snapshots_dir().join(format!("{}{}", TRASH_PREFIX, id))
    }

    /// Capture the source tree, write its artifacts and record the manifest
    pub fn run_backup(&self) -> Result<BackupOutcome> {
        self.run_backup_inner()
            .inspect_err(|e| log_failure("run_backup", e))
    }

    fn run_backup_inner(&self) -> Result<BackupOutcome> {
        let span = span!(Level::INFO, "run_backup", source = %self.config.source_root.display());
        let _enter = span.enter();

        self.config.validate()?;
        let _lock = RootLock::acquire(&self.config.backup_root)?;

        self.emit(BackupEvent::CaptureStarted {
            source_root: self.config.source_root.clone(),
        });
        let capture = StateCapturer::new(self.config.capture_config())
            .with_revision_provider(Arc::clone(&self.revisions))
            .capture()?;
        self.emit(BackupEvent::CaptureCompleted {
            file_count: capture.state.file_count,
            warnings: capture.warnings.len(),
        });

        let history = self.store.load()?;
        let timestamp = capture.state.captured_at;
        let id = self.unique_id(timestamp, &history)?;

        let snapshots = self.snapshots_dir();
        fs::create_dir_all(&snapshots).map_err(|e| {
            Error::persistence(format!("failed to create {}: {}", snapshots.display(), e))
        })?;

        let staging = snapshots.join(format!("{}{}", STAGING_PREFIX, id));
        let mut warnings = capture.warnings;

        let file_hashes = match self.write_artifacts(
            &capture.files,
            &capture.file_hashes,
            &staging,
            &mut warnings,
        ) {
            Ok(hashes) => hashes,
            Err(e) => {
                remove_partial(&staging);
                return Err(e);
            }
        };

        let final_dir = snapshots.join(&id);
        if let Err(e) = fs::rename(&staging, &final_dir) {
            remove_partial(&staging);
            return Err(Error::persistence(format!(
                "failed to move backup {} into place: {}",
                id, e
            )));
        }
        sync_dir(&snapshots);

        // The state describes what the backup holds, not what the walk saw
        let mut state = capture.state;
        state.file_count = file_hashes.len();
        state.tree_hash = tree_hash(&file_hashes);

        let manifest = BackupManifest::new(id.clone(), timestamp, state, file_hashes);
        if let Err(e) = self.store.append(manifest.clone()) {
            remove_partial(&final_dir);
            return Err(e);
        }

        info!(
            "Backup {} recorded: {} files, {} warnings",
            id,
            manifest.file_count(),
            warnings.len()
        );
        self.emit(BackupEvent::BackupCompleted {
            backup_id: id,
            file_count: manifest.file_count(),
            warnings: warnings.len(),
        });

        Ok(BackupOutcome { manifest, warnings })
    }

    /// Copy captured files into `staging`, returning the hashes of what was written
    fn write_artifacts(
        &self,
        files: &[crate::inventory::FileEntry],
        captured: &BTreeMap<String, ContentHash>,
        staging: &Path,
        warnings: &mut Vec<CaptureWarning>,
    ) -> Result<BTreeMap<String, ContentHash>> {
        fs::create_dir_all(staging).map_err(|e| {
            Error::persistence(format!("failed to create {}: {}", staging.display(), e))
        })?;

        let mut written = BTreeMap::new();
        for file in files {
            let mut source = match File::open(&file.path) {
                Ok(source) => source,
                Err(e) if self.config.strict_capture => {
                    return Err(Error::capture(format!(
                        "strict mode: unreadable file {}: {}",
                        file.path.display(),
                        e
                    )));
                }
                Err(e) => {
                    warn!("File {} vanished before copy: {}", file.path.display(), e);
                    warnings.push(CaptureWarning::UnreadableFile {
                        path: file.path.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let dest = staging.join(&file.relative);
            let hash = self.writer.write_file(&mut source, &dest).map_err(|e| {
                Error::persistence(format!("failed to write {}: {}", dest.display(), e))
            })?;

            if captured.get(&file.relative) != Some(&hash) {
                warn!("{} changed during backup", file.relative);
                warnings.push(CaptureWarning::ChangedDuringBackup {
                    path: file.relative.clone(),
                });
            }
            written.insert(file.relative.clone(), hash);
        }

        sync_dir(staging);
        debug!("Wrote {} artifacts to {}", written.len(), staging.display());
        Ok(written)
    }

    /// Apply the retention policy and delete discarded backups
    pub fn prune_backups(&self) -> Result<PruneReport> {
        self.prune_backups_at(Utc::now())
    }

    /// [`prune_backups`](Self::prune_backups) with an explicit reference time
    pub fn prune_backups_at(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        self.prune_inner(now)
            .inspect_err(|e| log_failure("prune_backups", e))
    }

    fn prune_inner(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        let span = span!(Level::INFO, "prune_backups", now = %now);
        let _enter = span.enter();

        let _lock = RootLock::acquire(&self.config.backup_root)?;
        let mut history = self.store.load()?;

        let decision = self.config.retention_policy().apply(&history, now);
        self.emit(BackupEvent::PruneDecision {
            keep: decision.keep.iter().cloned().collect(),
            discard: decision.discard.iter().cloned().collect(),
        });

        let mut report = PruneReport::default();
        let mut trashed: Vec<(String, Option<PathBuf>)> = Vec::new();

        // Move discarded artifacts aside; a failure keeps the entry recorded
        for id in &decision.discard {
            let dir = self.snapshot_path(id);
            let trash = self.trash_path(id);
            match fs::rename(&dir, &trash) {
                Ok(()) => trashed.push((id.clone(), Some(trash))),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!("Artifacts of {} already absent", id);
                    trashed.push((id.clone(), None));
                }
                Err(e) => {
                    warn!("Failed to delete artifacts of {}: {}", id, e);
                    report.failures.push(PruneFailure {
                        backup_id: id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        for (id, _) in &trashed {
            history.remove(id);
        }
        for (id, tag) in &decision.tags {
            if let Some(manifest) = history.get_mut(id) {
                manifest.set_retention_tag(*tag);
            }
        }

        if let Err(e) = self.store.save(&history) {
            // Put artifacts back so the unchanged ledger stays consistent
            for (id, trash) in &trashed {
                if let Some(trash) = trash {
                    if let Err(restore_err) = fs::rename(trash, self.snapshot_path(id)) {
                        error!("Failed to restore artifacts of {}: {}", id, restore_err);
                    }
                }
            }
            return Err(e);
        }

        for (id, trash) in trashed {
            if let Some(trash) = trash {
                if let Err(e) = fs::remove_dir_all(&trash) {
                    warn!("Leaving {} for reclamation: {}", trash.display(), e);
                    report.leftovers.push(trash);
                }
            }
            report.discarded.push(id);
        }
        report.retained = history.ids().into_iter().map(String::from).collect();

        info!(
            "Pruned {} backups, {} retained, {} failures",
            report.discarded.len(),
            report.retained.len(),
            report.failures.len()
        );
        self.emit(BackupEvent::PruneCompleted {
            discarded: report.discarded.len(),
            failures: report.failures.len(),
        });

        Ok(report)
    }

    /// Verify one recorded backup against its manifest
    pub fn verify_backup(&self, id: &str) -> Result<VerificationResult> {
        self.verify_inner(id)
            .inspect_err(|e| log_failure("verify_backup", e))
    }

    fn verify_inner(&self, id: &str) -> Result<VerificationResult> {
        let history = self.store.load()?;
        let manifest = history.get(id).ok_or_else(|| Error::not_found(id))?;

        let result = self.verifier.verify(manifest, &self.snapshot_path(id));

        // A concurrent prune may have discarded the backup mid-verification.
        // Its artifacts sit in trash until the ledger is saved.
        if self.trash_path(id).exists() || !self.store.load()?.contains(id) {
            debug!("Backup {} was pruned during verification", id);
            return Err(Error::not_found(id));
        }

        self.emit(BackupEvent::VerifyResult {
            backup_id: result.backup_id.clone(),
            clean: result.is_clean(),
            mismatches: result.mismatches.len(),
            missing: result.missing_files.len(),
            extra: result.extra_files.len(),
        });
        Ok(result)
    }

    /// Verify every recorded backup
    pub fn verify_all(&self) -> Result<Vec<VerificationResult>> {
        let history = self.store.load()?;
        let mut results = Vec::with_capacity(history.len());
        for manifest in &history {
            match self.verify_backup(manifest.id()) {
                Ok(result) => results.push(result),
                // Pruned while we were working through the list
                Err(Error::NotFound { id }) => debug!("Skipping {}: no longer recorded", id),
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// The recorded version history
    pub fn list_backups(&self) -> Result<VersionHistory> {
        self.store.load()
    }

    /// Artifact directories without a ledger entry
    pub fn find_orphans(&self) -> Result<Vec<Orphan>> {
        let history = self.store.load()?;
        self.scan_orphans(&history)
    }

    fn scan_orphans(&self, history: &VersionHistory) -> Result<Vec<Orphan>> {
        let snapshots = self.snapshots_dir();
        let entries = match fs::read_dir(&snapshots) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::persistence(format!(
                    "failed to read {}: {}",
                    snapshots.display(),
                    e
                )))
            }
        };

        // Entries that failed to parse still own their artifacts
        let unreadable = history.unreadable_ids();
        let mut orphans = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = if name.starts_with(STAGING_PREFIX) {
                OrphanKind::Staging
            } else if name.starts_with(TRASH_PREFIX) {
                OrphanKind::Trash
            } else if !history.contains(&name) && !unreadable.contains(&name.as_str()) {
                OrphanKind::Unreferenced
            } else {
                continue;
            };
            orphans.push(Orphan {
                path: entry.path(),
                kind,
            });
        }

        orphans.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(orphans)
    }

    /// Delete orphaned artifact directories, returning those removed
    pub fn reclaim_orphans(&self) -> Result<Vec<Orphan>> {
        let span = span!(Level::INFO, "reclaim_orphans");
        let _enter = span.enter();

        let _lock = RootLock::acquire(&self.config.backup_root)?;
        let history = self.store.load()?;

        let mut reclaimed = Vec::new();
        for orphan in self.scan_orphans(&history)? {
            match fs::remove_dir_all(&orphan.path) {
                Ok(()) => {
                    info!("Reclaimed orphan {}", orphan.path.display());
                    self.emit(BackupEvent::OrphanReclaimed {
                        path: orphan.path.clone(),
                    });
                    reclaimed.push(orphan);
                }
                Err(e) => warn!("Failed to reclaim {}: {}", orphan.path.display(), e),
            }
        }
        Ok(reclaimed)
    }

    /// Timestamp-derived id, suffixed when it would collide
    fn unique_id(&self, timestamp: DateTime<Utc>, history: &VersionHistory) -> Result<String> {
        let base = timestamp.format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let taken = |id: &str| history.contains(id) || self.snapshot_path(id).exists();

        if !taken(base.as_str()) {
            return Ok(base);
        }
        (1..=u32::MAX)
            .map(|n| format!("{}-{}", base, n))
            .find(|candidate| !taken(candidate.as_str()))
            .ok_or_else(|| Error::persistence(format!("no free backup id for {}", base)))
    }

    fn emit(&self, event: BackupEvent) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.emit(&event) {
                warn!("Event sink rejected event: {}", e);
            }
        }
    }
}

/// Classified errors are expected outcomes; anything else is logged louder
fn log_failure(operation: &str, err: &Error) {
    if err.is_classified() {
        warn!("{} failed: {}", operation, err);
    } else {
        error!("{} failed with unexpected error: {}", operation, err);
    }
}

fn remove_partial(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => debug!("Removed partial artifacts {}", dir.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => error!("Failed to remove partial artifacts {}: {}", dir.display(), e),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!("Failed to sync directory {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
