//! Engine configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration.

use crate::capture::CaptureConfig;
use crate::inventory::{self, InventoryOptions};
use crate::retention::RetentionPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tree whose state is preserved
    pub source_root: PathBuf,
    /// Where the ledger and snapshot directories live
    pub backup_root: PathBuf,
    /// Configuration files fingerprinted on every capture
    pub tracked_configs: Vec<PathBuf>,
    /// Fail a capture on the first unreadable file
    pub strict_capture: bool,
    /// Entry names excluded from capture (single `*` wildcard allowed)
    pub exclude_patterns: Vec<String>,
    pub follow_symlinks: bool,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub verbose: bool,
    /// Append logs to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            backup_root: PathBuf::from(".evostate"),
            tracked_configs: Vec::new(),
            strict_capture: false,
            exclude_patterns: vec![
                ".evostate".to_string(),
                ".git".to_string(),
                "*.tmp".to_string(),
            ],
            follow_symlinks: false,
            retention: RetentionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 6,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            verbose: false,
            file: None,
        }
    }
}

impl EngineConfig {
    /// Configuration for the given roots with default settings otherwise
    pub fn for_roots<P: Into<PathBuf>, Q: Into<PathBuf>>(source_root: P, backup_root: Q) -> Self {
        Self {
            source_root: source_root.into(),
            backup_root: backup_root.into(),
            ..Self::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| Error::Configuration {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content).map_err(|e| Error::Configuration {
            reason: format!("failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| Error::Configuration {
            reason: format!("failed to serialize config: {}", e),
        })?;

        fs::write(path, content)?;
        Ok(())
    }

    /// Reject layouts where backups would capture themselves
    pub fn validate(&self) -> Result<()> {
        let source = lexical(&self.source_root);
        let backup = lexical(&self.backup_root);

        if source == backup {
            return Err(Error::Configuration {
                reason: "source_root and backup_root must differ".to_string(),
            });
        }

        if let Ok(inside) = backup.strip_prefix(&source) {
            let first = inside
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .unwrap_or_default();
            let excluded = self
                .exclude_patterns
                .iter()
                .any(|pattern| inventory::matches_pattern(&first, pattern));
            if !excluded {
                return Err(Error::Configuration {
                    reason: format!(
                        "backup_root {} is inside source_root but '{}' is not excluded",
                        self.backup_root.display(),
                        first
                    ),
                });
            }
        }

        Ok(())
    }

    pub fn inventory_options(&self) -> InventoryOptions {
        InventoryOptions {
            follow_symlinks: self.follow_symlinks,
            exclude_patterns: self.exclude_patterns.clone(),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            source_root: self.source_root.clone(),
            tracked_configs: self.tracked_configs.clone(),
            strict: self.strict_capture,
            inventory: self.inventory_options(),
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(
            self.retention.daily,
            self.retention.weekly,
            self.retention.monthly,
        )
    }
}

/// Drop `.` components so `./a` and `a` compare equal
fn lexical(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
