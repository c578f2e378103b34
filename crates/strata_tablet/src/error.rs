use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the recovery core.
///
/// `Io` failures are transient and the whole recovery is retryable by the
/// caller. `CorruptLog` and `Invariant` abort the recovery of the affected
/// tablet and leave it unavailable until an operator intervenes.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Underlying file or filesystem failure.
    #[error("recovery io error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A sorted log is structurally bad: its first entry is not OPEN, a block
    /// fails its checksum, or an entry cannot be decoded.
    #[error("corrupt recovery log {log}: {reason}")]
    CorruptLog { log: String, reason: String },

    /// An ordering, sign, or event-sequence invariant did not hold while
    /// scanning. Indicates a writer bug; never recovered locally.
    #[error("recovery invariant violated: {detail}")]
    Invariant { detail: String },
}

impl RecoveryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(log: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptLog {
            log: log.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant {
            detail: detail.into(),
        }
    }

    /// True when the caller may retry the recovery after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}
