//! Error types for coordinator operations.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::xa::XaError;

/// The main error type for transaction coordinator operations.
///
/// This enum covers protocol violations, two-phase-commit outcome anomalies
/// and internal failures. Heuristic variants carry a message enumerating the
/// branches involved by resource unique name.
#[derive(Debug, Error, Clone)]
pub enum TransactionError {
    /// Illegal state transition or illegal branch operation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A branch demanded rollback, or prepare voted no; the transaction was
    /// cleanly rolled back.
    #[error("transaction rolled back: {0}")]
    Rollback(String),

    /// Every participant unilaterally rolled back while the coordinator had
    /// decided commit.
    #[error("heuristic rollback: {0}")]
    HeuristicRollback(String),

    /// Participants finished with inconsistent outcomes; the global state of
    /// the transaction is unknown.
    #[error("heuristic mixed: {0}")]
    HeuristicMixed(String),

    /// Internal failure (journal I/O, executor refused a job, ...).
    #[error("system error: {0}")]
    System(String),

    /// The transaction deadline passed.
    #[error("transaction timed out: {0}")]
    Timeout(String),

    /// Invalid or unresolvable configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Per-resource recovery failed; never surfaced to application code.
    #[error("recovery error: {0}")]
    Recovery(String),

    /// An error reported by a resource manager through the XA interface.
    #[error("xa error: {0}")]
    Xa(#[from] XaError),

    /// I/O errors from the standard library (wrapped in `Arc` for `Clone`).
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for TransactionError {
    fn from(err: io::Error) -> Self {
        TransactionError::Io(Arc::new(err))
    }
}

impl TransactionError {
    /// Builds a [`TransactionError::System`] enumerating several branch
    /// failures, one `(unique name, error)` pair per failed branch.
    pub fn multi_system(context: &str, failures: &[(String, String)]) -> Self {
        let detail = failures
            .iter()
            .map(|(name, err)| format!("{name}: {err}"))
            .collect::<Vec<_>>()
            .join(", ");
        TransactionError::System(format!("{context} [{detail}]"))
    }

    /// Returns `true` for errors that leave the transaction outcome unknown
    /// until recovery reconciles it against the journal.
    pub fn leaves_outcome_unknown(&self) -> bool {
        matches!(
            self,
            Self::HeuristicMixed(_) | Self::System(_) | Self::Io(_) | Self::Protocol(_)
        )
    }
}

/// A specialized `Result` type for coordinator operations.
pub type Result<T> = std::result::Result<T, TransactionError>;
