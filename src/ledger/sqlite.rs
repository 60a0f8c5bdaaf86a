//! Sqlite-backed ledger: one row per downloaded key, with size and digest.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::LedgerError;
use super::schema;
use super::{Ledger, LedgerEntry};

pub struct SqliteLedger {
    /// `rusqlite::Connection` is not `Sync`.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteLedger {
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| LedgerError::OpenDb {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(LedgerError::Migration)?;
            // NORMAL is still crash-safe under WAL.
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(LedgerError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, LedgerError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|e| LedgerError::OpenDb {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Query(e.to_string()))
    }
}

const ENTRY_COLUMNS: &str = "key, saved_path, size_bytes, digest, recorded_at";

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let saved_path: String = row.get(1)?;
    let size_bytes: i64 = row.get(2)?;
    let recorded_at: i64 = row.get(4)?;
    Ok(LedgerEntry {
        key: row.get(0)?,
        path: PathBuf::from(saved_path),
        size_bytes: size_bytes.max(0) as u64,
        digest: row.get(3)?,
        recorded_at: Utc.timestamp_opt(recorded_at, 0).single(),
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn contains(&self, key: &str) -> Result<bool, LedgerError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM images WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(LedgerError::query)?;
        Ok(found.is_some())
    }

    async fn record(&self, entry: &LedgerEntry) -> Result<bool, LedgerError> {
        let recorded_at = entry.recorded_at.unwrap_or_else(Utc::now).timestamp();
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO images (key, saved_path, size_bytes, digest, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    entry.key,
                    entry.path.to_string_lossy(),
                    entry.size_bytes as i64,
                    entry.digest,
                    recorded_at,
                ],
            )
            .map_err(LedgerError::query)?;
        Ok(inserted == 1)
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM images ORDER BY recorded_at, rowid"
            ))
            .map_err(LedgerError::query)?;

        let entries = stmt
            .query_map([], entry_from_row)
            .map_err(LedgerError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerError::query)?;

        Ok(entries)
    }

    async fn find_by_digest(&self, digest: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM images WHERE digest = ?1 ORDER BY rowid LIMIT 1"),
            [digest],
            entry_from_row,
        )
        .optional()
        .map_err(LedgerError::query)
    }

    async fn len(&self) -> Result<usize, LedgerError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))
            .map_err(LedgerError::query)?;
        Ok(count.max(0) as usize)
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("pixdl")
            .join("sqlite_ledger_tests")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entry(key: &str) -> LedgerEntry {
        LedgerEntry::new(
            key.to_string(),
            PathBuf::from(format!("/tmp/{key}.jpg")),
            42,
            Some("ab".repeat(32)),
        )
    }

    #[tokio::test]
    async fn test_open_creates_db() {
        let dir = test_dir("open_creates");
        let path = dir.join("ledger.db");
        let ledger = SqliteLedger::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(ledger.location(), path);
    }

    #[tokio::test]
    async fn test_record_then_contains() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        assert!(!ledger.contains("k1").await.unwrap());
        assert!(ledger.record(&entry("k1")).await.unwrap());
        assert!(ledger.contains("k1").await.unwrap());
        assert_eq!(ledger.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_twice_inserts_once() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        assert!(ledger.record(&entry("k1")).await.unwrap());

        let mut changed = entry("k1");
        changed.size_bytes = 999;
        assert!(!ledger.record(&changed).await.unwrap());

        let entries = ledger.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size_bytes, 42);
    }

    #[tokio::test]
    async fn test_entries_round_trip_fields() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        ledger.record(&entry("k1")).await.unwrap();
        let got = &ledger.entries().await.unwrap()[0];
        assert_eq!(got.key, "k1");
        assert_eq!(got.path, PathBuf::from("/tmp/k1.jpg"));
        assert_eq!(got.digest.as_deref(), Some("ab".repeat(32).as_str()));
        assert!(got.recorded_at.is_some());
    }

    #[tokio::test]
    async fn test_find_by_digest_returns_first_holder() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        ledger.record(&entry("first")).await.unwrap();
        ledger.record(&entry("second")).await.unwrap();

        let found = ledger
            .find_by_digest(&"ab".repeat(32))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.key, "first");
        assert_eq!(found.path, PathBuf::from("/tmp/first.jpg"));
        assert!(ledger.find_by_digest("cd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = test_dir("reopen");
        let path = dir.join("ledger.db");
        {
            let ledger = SqliteLedger::open(&path).await.unwrap();
            ledger.record(&entry("a")).await.unwrap();
            ledger.record(&entry("b")).await.unwrap();
        }
        let ledger = SqliteLedger::open(&path).await.unwrap();
        assert!(ledger.contains("a").await.unwrap());
        assert!(ledger.contains("b").await.unwrap());
        assert_eq!(ledger.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_open_unreadable_path_fails() {
        let dir = test_dir("unreadable");
        // A directory where the database file should be.
        let path = dir.join("ledger.db");
        fs::create_dir_all(&path).unwrap();
        assert!(SqliteLedger::open(&path).await.is_err());
    }
}
