//! Delivery log error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the delivery log store.
#[derive(Error, Debug)]
pub enum LogStoreError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating the database directory.
    #[error("IO error for path '{path}': {source}")]
    Io {
        /// Path that could not be created.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The store has been closed.
    #[error("delivery log is closed")]
    Closed,

    /// The connection lock was poisoned.
    #[error("delivery log lock poisoned")]
    LockPoisoned,

    /// A stored row holds a value the store does not recognise.
    #[error("corrupt delivery log row {id}: {reason}")]
    CorruptRow {
        /// Row id.
        id: i64,
        /// What was wrong with it.
        reason: String,
    },
}
