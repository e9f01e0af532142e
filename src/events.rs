//! Structured events emitted by the orchestrator.
//!
//! Consumers (status pages, log shippers, an event bus) implement
//! [`EventSink`]. Sink failures never fail a backup operation; they are
//! logged and dropped.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

/// Events describing engine activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BackupEvent {
    /// Capture of the source tree started
    CaptureStarted { source_root: PathBuf },
    /// Capture finished, possibly with non-fatal warnings
    CaptureCompleted { file_count: usize, warnings: usize },
    /// Artifacts written and manifest recorded
    BackupCompleted {
        backup_id: String,
        file_count: usize,
        warnings: usize,
    },
    /// Retention policy decision, before any deletion
    PruneDecision {
        keep: Vec<String>,
        discard: Vec<String>,
    },
    /// Pruning finished
    PruneCompleted { discarded: usize, failures: usize },
    /// Verification of one backup finished
    VerifyResult {
        backup_id: String,
        clean: bool,
        mismatches: usize,
        missing: usize,
        extra: usize,
    },
    /// An orphaned artifact directory was removed
    OrphanReclaimed { path: PathBuf },
}

/// Capability for receiving engine events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &BackupEvent) -> anyhow::Result<()>;
}

/// Writes events to the `tracing` subscriber
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &BackupEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        match event {
            BackupEvent::VerifyResult { clean: false, .. } => {
                warn!(target: "evostate::events", "{}", payload)
            }
            _ => info!(target: "evostate::events", "{}", payload),
        }
        Ok(())
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<BackupEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far
    pub fn events(&self) -> Vec<BackupEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &BackupEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("event buffer poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = BackupEvent::CaptureCompleted {
            file_count: 3,
            warnings: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "capture_completed");
        assert_eq!(json["file_count"], 3);
    }

    #[test]
    fn test_memory_sink_records_events() -> anyhow::Result<()> {
        let sink = MemorySink::new();
        sink.emit(&BackupEvent::PruneCompleted {
            discarded: 2,
            failures: 0,
        })?;
        assert_eq!(sink.events().len(), 1);
        Ok(())
    }

    #[test]
    fn test_tracing_sink_without_subscriber() -> anyhow::Result<()> {
        TracingSink.emit(&BackupEvent::OrphanReclaimed {
            path: PathBuf::from("/tmp/x"),
        })
    }
}
