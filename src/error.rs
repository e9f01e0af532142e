//! Error types for evostate

use thiserror::Error;

/// Main error type for evostate operations
#[derive(Error, Debug)]
pub enum Error {
    /// Source tree unreadable, strict-mode violation or revision query failure.
    /// Fatal to the current run; prior persisted state is unaffected.
    #[error("Capture failed: {reason}")]
    Capture { reason: String },

    /// Ledger or artifact I/O failure. Prior persisted state is left untouched.
    #[error("Persistence failed: {reason}")]
    Persistence { reason: String },

    /// The ledger envelope could not be read. Never auto-repaired.
    #[error("Version history is corrupt: {reason}")]
    CorruptHistory { reason: String },

    #[error("Backup not found: {id}")]
    NotFound { id: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    /// Unclassified I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn capture(reason: impl Into<String>) -> Self {
        Error::Capture {
            reason: reason.into(),
        }
    }

    pub(crate) fn persistence(reason: impl Into<String>) -> Self {
        Error::Persistence {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptHistory {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(id: impl Into<String>) -> Self {
        Error::NotFound { id: id.into() }
    }

    /// Whether this error belongs to the classified taxonomy.
    ///
    /// Unclassified errors are logged at a higher severity by callers.
    pub fn is_classified(&self) -> bool {
        !matches!(self, Error::Io(_))
    }
}

/// Result type alias for evostate operations
pub type Result<T> = std::result::Result<T, Error>;
