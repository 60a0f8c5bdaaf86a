//! Error types for the download ledger.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while opening, reading or appending to a ledger.
///
/// Every variant is fatal to a download run.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The text ledger could not be opened or hydrated.
    #[error("Failed to open ledger at {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The sqlite ledger could not be opened.
    #[error("Failed to open ledger database at {path}: {source}")]
    OpenDb {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Appending a record failed.
    #[error("Failed to append to ledger at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Ledger migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("Ledger query failed: {0}")]
    Query(String),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Ledger schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// Another process holds the ledger lock.
    #[error("Another pixdl instance is using this tag directory (lock: {path})")]
    Locked { path: PathBuf },

    /// Keys are stored one per line, so they cannot contain line breaks or tabs.
    #[error("Ledger key contains a tab or line break: {0:?}")]
    InvalidKey(String),
}

impl LedgerError {
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
