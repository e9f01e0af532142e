//! Backup manifests and the version history ledger
//!
//! The ledger is a single JSON file per backup root holding every manifest in
//! chronological order. Writes go to a temporary file that is fsynced and
//! renamed over the ledger, so a reader never observes a partial write.

use crate::hash::ContentHash;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Ledger format version
pub const LEDGER_FORMAT_VERSION: u32 = 1;

/// Ledger file name inside the backup root
pub const LEDGER_FILE: &str = "history.json";

/// Point-in-time record of the system being preserved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    /// When the capture ran
    pub captured_at: DateTime<Utc>,
    /// Source-control revision, absent when not under version control
    pub revision: Option<String>,
    /// Tracked configuration file -> content hash
    pub config_hashes: BTreeMap<String, ContentHash>,
    /// Tracked configuration files that were missing or unreadable
    #[serde(default)]
    pub missing_configs: Vec<String>,
    /// Number of files in the captured inventory
    pub file_count: usize,
    /// Digest over the sorted inventory
    pub tree_hash: ContentHash,
    /// Version of the engine that produced the capture
    pub engine_version: String,
    /// `os/arch` of the capturing host
    pub platform: String,
}

/// Retention tier that last selected a backup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionTag {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl std::fmt::Display for RetentionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionTag::None => write!(f, "none"),
            RetentionTag::Daily => write!(f, "daily"),
            RetentionTag::Weekly => write!(f, "weekly"),
            RetentionTag::Monthly => write!(f, "monthly"),
        }
    }
}

/// One backup's manifest.
///
/// Fields are private so nothing but the retention tag can change after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    id: String,
    timestamp: DateTime<Utc>,
    state: SystemState,
    file_count: usize,
    file_hashes: BTreeMap<String, ContentHash>,
    #[serde(default)]
    retention_tag: RetentionTag,
}

impl BackupManifest {
    /// Create a manifest; the file count is derived from `file_hashes`
    pub fn new(
        id: String,
        timestamp: DateTime<Utc>,
        state: SystemState,
        file_hashes: BTreeMap<String, ContentHash>,
    ) -> Self {
        Self {
            id,
            timestamp,
            state,
            file_count: file_hashes.len(),
            file_hashes,
            retention_tag: RetentionTag::None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    pub fn revision(&self) -> Option<&str> {
        self.state.revision.as_deref()
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    pub fn file_hashes(&self) -> &BTreeMap<String, ContentHash> {
        &self.file_hashes
    }

    pub fn retention_tag(&self) -> RetentionTag {
        self.retention_tag
    }

    pub fn set_retention_tag(&mut self, tag: RetentionTag) {
        self.retention_tag = tag;
    }
}

/// Ordered sequence of manifests; insertion order is chronological order
///
/// Ledger entries that failed to parse are carried along verbatim so that
/// saving the history never drops them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionHistory {
    entries: Vec<BackupManifest>,
    unreadable: Vec<serde_json::Value>,
}

impl VersionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, manifest: BackupManifest) {
        self.entries.push(manifest);
    }

    pub fn get(&self, id: &str) -> Option<&BackupManifest> {
        self.entries.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut BackupManifest> {
        self.entries.iter_mut().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Remove an entry by id, returning it if present
    pub fn remove(&mut self, id: &str) -> Option<BackupManifest> {
        let index = self.entries.iter().position(|m| m.id == id)?;
        Some(self.entries.remove(index))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|m| m.id.as_str()).collect()
    }

    /// The most recent manifest by timestamp, ties broken by the greater id
    pub fn latest(&self) -> Option<&BackupManifest> {
        self.entries
            .iter()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BackupManifest> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Ids of ledger entries that could not be parsed, where one is present
    pub fn unreadable_ids(&self) -> Vec<&str> {
        self.unreadable
            .iter()
            .filter_map(|raw| raw.get("id").and_then(serde_json::Value::as_str))
            .collect()
    }

    pub fn unreadable_count(&self) -> usize {
        self.unreadable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a VersionHistory {
    type Item = &'a BackupManifest;
    type IntoIter = std::slice::Iter<'a, BackupManifest>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<BackupManifest> for VersionHistory {
    fn from_iter<I: IntoIterator<Item = BackupManifest>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
            unreadable: Vec::new(),
        }
    }
}

/// A ledger entry that was skipped during load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadWarning {
    /// Position of the entry in the persisted list
    pub index: usize,
    pub reason: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum EntryOut<'a> {
    Parsed(&'a BackupManifest),
    Raw(&'a serde_json::Value),
}

#[derive(Serialize)]
struct LedgerOut<'a> {
    format_version: u32,
    entries: Vec<EntryOut<'a>>,
}

#[derive(Deserialize)]
struct LedgerIn {
    format_version: u32,
    entries: Vec<serde_json::Value>,
}

/// Persists and loads the version history of one backup root
#[derive(Debug, Clone)]
pub struct ManifestStore {
    ledger_path: PathBuf,
}

impl ManifestStore {
    /// Create a store whose ledger lives in `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            ledger_path: root.as_ref().join(LEDGER_FILE),
        }
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Load the history, skipping individually unparseable entries
    pub fn load(&self) -> Result<VersionHistory> {
        self.load_with_warnings().map(|(history, _)| history)
    }

    /// Load the history along with a warning per skipped entry.
    ///
    /// A missing ledger is an empty history. An unreadable envelope is fatal.
    pub fn load_with_warnings(&self) -> Result<(VersionHistory, Vec<LoadWarning>)> {
        let content = match fs::read_to_string(&self.ledger_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No ledger at {}, starting empty", self.ledger_path.display());
                return Ok((VersionHistory::new(), Vec::new()));
            }
            Err(e) => {
                return Err(Error::persistence(format!(
                    "failed to read {}: {}",
                    self.ledger_path.display(),
                    e
                )))
            }
        };

        let ledger: LedgerIn = serde_json::from_str(&content).map_err(|e| {
            Error::corrupt(format!("{}: {}", self.ledger_path.display(), e))
        })?;

        if ledger.format_version != LEDGER_FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported ledger format version: {} (expected {})",
                ledger.format_version, LEDGER_FORMAT_VERSION
            )));
        }

        let mut history = VersionHistory::new();
        let mut warnings = Vec::new();

        for (index, raw) in ledger.entries.into_iter().enumerate() {
            match BackupManifest::deserialize(&raw) {
                Ok(manifest) => history.push(manifest),
                Err(e) => {
                    warn!("Skipping unreadable ledger entry #{}: {}", index, e);
                    warnings.push(LoadWarning {
                        index,
                        reason: e.to_string(),
                    });
                    history.unreadable.push(raw);
                }
            }
        }

        Ok((history, warnings))
    }

    /// Atomically replace the persisted history
    pub fn save(&self, history: &VersionHistory) -> Result<()> {
        let parent = self
            .ledger_path
            .parent()
            .ok_or_else(|| Error::persistence("ledger path has no parent directory"))?;
        fs::create_dir_all(parent).map_err(|e| {
            Error::persistence(format!("failed to create {}: {}", parent.display(), e))
        })?;

        let tmp_path = self.ledger_path.with_extension("json.tmp");
        if let Err(e) = write_ledger(&tmp_path, history) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::persistence(format!(
                "failed to write {}: {}",
                tmp_path.display(),
                e
            )));
        }

        if let Err(e) = fs::rename(&tmp_path, &self.ledger_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::persistence(format!(
                "failed to move ledger into place: {}",
                e
            )));
        }

        sync_dir(parent);
        debug!("Saved {} manifests to {}", history.len(), self.ledger_path.display());
        Ok(())
    }

    /// Append one manifest to the persisted history
    pub fn append(&self, manifest: BackupManifest) -> Result<()> {
        let mut history = self.load()?;
        if history.contains(manifest.id()) {
            return Err(Error::persistence(format!(
                "manifest {} already recorded",
                manifest.id()
            )));
        }
        history.push(manifest);
        self.save(&history)
    }
}

fn write_ledger(path: &Path, history: &VersionHistory) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let ledger = LedgerOut {
        format_version: LEDGER_FORMAT_VERSION,
        entries: history
            .entries
            .iter()
            .map(EntryOut::Parsed)
            .chain(history.unreadable.iter().map(EntryOut::Raw))
            .collect(),
    };
    serde_json::to_writer_pretty(&mut writer, &ledger)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Persist a rename by syncing the containing directory
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!("Failed to sync directory {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
