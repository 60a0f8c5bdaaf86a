//! Persistent record of targets that were fully written to disk.
//!
//! A key is present iff its file was completely written and renamed into
//! place. Entries are inserted once and never updated; only `reset-ledger`
//! removes the store.

pub mod error;
pub mod schema;
pub mod sqlite;
pub mod text;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;

pub use error::LedgerError;
pub use sqlite::SqliteLedger;
pub use text::TextLedger;

use crate::types::LedgerBackend;

pub const TEXT_LEDGER_FILE: &str = "downloaded_images.txt";
pub const SQLITE_LEDGER_FILE: &str = "ledger.db";
const LOCK_FILE: &str = ".ledger.lock";

/// One completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub key: String,
    /// Empty when a plain key-per-line ledger did not record it.
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256; only the sqlite backend keeps it.
    pub digest: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn new(key: String, path: PathBuf, size_bytes: u64, digest: Option<String>) -> Self {
        Self {
            key,
            path,
            size_bytes,
            digest,
            recorded_at: Some(Utc::now()),
        }
    }
}

/// Set-like store of downloaded keys.
///
/// Object-safe so the orchestrator holds an `Arc<dyn Ledger>` regardless of
/// backend.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn contains(&self, key: &str) -> Result<bool, LedgerError>;

    /// Insert `entry` unless its key is already present.
    ///
    /// Returns `true` when a new entry was persisted. Recording an existing
    /// key is a no-op returning `false`.
    async fn record(&self, entry: &LedgerEntry) -> Result<bool, LedgerError>;

    /// All entries in insertion order.
    async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// The earliest entry whose content digest is `digest`.
    ///
    /// Backends that keep no digests never find one.
    async fn find_by_digest(&self, _digest: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(None)
    }

    async fn len(&self) -> Result<usize, LedgerError>;

    /// Backing file, for log and status messages.
    fn location(&self) -> &Path;
}

/// Where `backend` keeps its store inside a tag directory.
pub fn ledger_path(backend: LedgerBackend, tag_dir: &Path) -> PathBuf {
    match backend {
        LedgerBackend::Text => tag_dir.join(TEXT_LEDGER_FILE),
        LedgerBackend::Sqlite => tag_dir.join(SQLITE_LEDGER_FILE),
    }
}

/// Open (creating if needed) the ledger for a tag directory.
pub async fn open(backend: LedgerBackend, tag_dir: &Path) -> Result<Arc<dyn Ledger>, LedgerError> {
    let path = ledger_path(backend, tag_dir);
    let ledger: Arc<dyn Ledger> = match backend {
        LedgerBackend::Text => Arc::new(TextLedger::open(&path).await?),
        LedgerBackend::Sqlite => Arc::new(SqliteLedger::open(&path).await?),
    };
    Ok(ledger)
}

/// Exclusive advisory lock on a tag directory, held for the lifetime of a run.
///
/// Released when dropped, including on panic or early return.
#[derive(Debug)]
pub struct LedgerLock {
    _file: std::fs::File,
}

impl LedgerLock {
    pub async fn acquire(tag_dir: &Path) -> Result<Self, LedgerError> {
        let path = tag_dir.join(LOCK_FILE);
        let lock_path = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&lock_path).map_err(|e| LedgerError::Open {
                path: lock_path.clone(),
                source: e,
            })?;
            file.try_lock_exclusive()
                .map_err(|_| LedgerError::Locked {
                    path: lock_path.clone(),
                })?;
            Ok::<_, LedgerError>(file)
        })
        .await??;
        tracing::debug!("Acquired ledger lock {}", path.display());
        Ok(Self { _file: file })
    }
}
