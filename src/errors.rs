//! Error taxonomy for the state engine.
//!
//! Four non-fatal kinds cover what the engine reports at runtime:
//! storage unavailable ([`StateError::Io`]), checksum mismatch
//! ([`StateError::Corruption`]), absent key or window
//! ([`StateError::NotFound`]), and attempted overwrite of an
//! immutable replay record ([`StateError::DuplicateWrite`]).
//! [`StateError::Config`] rejects bad settings up front.
//! [`StateError::Unrecoverable`] is the one fatal condition: every
//! retained manifest failed verification, so the operator must not
//! resume. Retries are the orchestration layer's call; nothing is
//! retried internally.

use std::path::PathBuf;

use crate::model::OperatorId;
use crate::model::WindowId;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Storage unavailable or unreadable. Surfaced to the caller;
    /// the orchestration layer decides whether to retry.
    #[error("storage failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checksum or format verification failed. Unverified data is
    /// never returned; the checkpoint coordinator falls back to the
    /// prior manifest.
    #[error("corrupt data in {path}: {detail}")]
    Corruption { path: PathBuf, detail: String },

    /// A key, window, or handler tag is absent. Not fatal.
    #[error("not found: {0}")]
    NotFound(String),

    /// A replay record already exists for this operator and window.
    /// Always a protocol violation and always surfaced.
    #[error("replay record already written for operator {operator} window {window}")]
    DuplicateWrite {
        operator: OperatorId,
        window: WindowId,
    },

    /// Invalid engine configuration. Reported as its own kind rather
    /// than by matching on message strings.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No retained manifest passed verification. The operator cannot
    /// resume and must be reported to the orchestration layer.
    #[error("no valid checkpoint manifest remains; operator cannot resume")]
    Unrecoverable,

    /// Recovery log (SQLite) failure. A flavor of storage failure.
    #[error("recovery log failure: {0}")]
    RecoveryLog(#[from] rusqlite::Error),

    /// Recovery log schema migration failure.
    #[error("recovery log migration failure: {0}")]
    Migration(#[from] rusqlite_migration::Error),
}

impl StateError {
    /// Wrap an I/O error with the path it occurred at.
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StateError {
        let path = path.into();
        move |source| StateError::Io { path, source }
    }

    pub(crate) fn corruption(path: impl Into<PathBuf>, detail: impl Into<String>) -> StateError {
        StateError::Corruption {
            path: path.into(),
            detail: detail.into(),
        }
    }
}
