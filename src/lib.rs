//! # evostate
//!
//! Evolutionary-state preservation engine: captures full snapshots of a
//! source tree, keeps a version history of backup manifests, prunes old
//! backups with a tiered retention policy and verifies stored backups
//! against their manifests.
//!
//! ## Features
//!
//! - **Capture**: revision, tracked config fingerprints and a BLAKE3 inventory
//! - **Version history**: crash-atomic JSON ledger per backup root
//! - **Retention**: daily/weekly/monthly tiers with a safety floor
//! - **Verification**: file-count and per-file hash checks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use evostate::{BackupOrchestrator, EngineConfig};
//!
//! # fn main() -> evostate::Result<()> {
//! let config = EngineConfig::for_roots("/srv/app", "/var/backups/app");
//! let orchestrator = BackupOrchestrator::new(config);
//!
//! let outcome = orchestrator.run_backup()?;
//! println!("Backup completed: {}", outcome.manifest.id());
//!
//! let report = orchestrator.prune_backups()?;
//! println!("Discarded {} backups", report.discarded.len());
//!
//! let result = orchestrator.verify_backup(outcome.manifest.id())?;
//! assert!(result.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod inventory;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod retention;
pub mod verify;

// Re-export commonly used types
pub use capture::{Capture, CaptureWarning, RevisionProvider, StateCapturer};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::{BackupEvent, EventSink};
pub use hash::ContentHash;
pub use manifest::{BackupManifest, ManifestStore, RetentionTag, SystemState, VersionHistory};
pub use orchestrator::{BackupOrchestrator, BackupOutcome, PruneReport};
pub use retention::{RetentionDecision, RetentionPolicy};
pub use verify::{VerificationResult, Verifier};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
