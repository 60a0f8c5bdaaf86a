//! Line-oriented ledger compatible with plain `downloaded_images.txt` files.
//!
//! Each line is `key[\tpath[\tsize]]`. The file is read once at open into an
//! in-memory set; every new key is appended as one line and synced before
//! `record` returns.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::error::LedgerError;
use super::{Ledger, LedgerEntry};

struct TextState {
    keys: HashSet<String>,
    entries: Vec<LedgerEntry>,
    file: File,
}

pub struct TextLedger {
    state: Mutex<TextState>,
    path: PathBuf,
}

impl std::fmt::Debug for TextLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Parse one ledger line. Blank lines yield `None`.
fn parse_line(line: &str) -> Option<LedgerEntry> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }
    let mut fields = line.split('\t');
    let key = fields.next()?.trim().to_string();
    if key.is_empty() {
        return None;
    }
    let path = fields.next().map(PathBuf::from).unwrap_or_default();
    let size_bytes = fields
        .next()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    Some(LedgerEntry {
        key,
        path,
        size_bytes,
        digest: None,
        recorded_at: None,
    })
}

fn format_line(entry: &LedgerEntry) -> String {
    format!(
        "{}\t{}\t{}\n",
        entry.key,
        entry.path.display(),
        entry.size_bytes
    )
}

/// Append `bytes` and sync. On any failure the file is cut back to its
/// previous length so a half-written or unsynced line is never read back.
fn append_synced(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    let len_before = file.metadata()?.len();
    let result = file
        .write_all(bytes)
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_data());
    if result.is_err() {
        if let Err(e) = file.set_len(len_before) {
            tracing::error!("Could not roll back ledger append: {}", e);
        }
    }
    result
}

impl TextLedger {
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();
        let state = tokio::task::spawn_blocking(move || Self::hydrate(&path_clone)).await??;
        tracing::debug!(
            "Loaded {} ledger entries from {}",
            state.entries.len(),
            path.display()
        );
        Ok(Self {
            state: Mutex::new(state),
            path,
        })
    }

    fn hydrate(path: &Path) -> Result<TextState, LedgerError> {
        let open_err = |source| LedgerError::Open {
            path: path.to_path_buf(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(open_err)?;

        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(open_err)?;

        let mut keys = HashSet::new();
        let mut entries = Vec::new();
        for entry in contents.lines().filter_map(parse_line) {
            if keys.insert(entry.key.clone()) {
                entries.push(entry);
            }
        }

        // A file written by another tool may lack the trailing newline.
        if !contents.is_empty() && !contents.ends_with('\n') {
            file.seek(SeekFrom::End(0)).map_err(open_err)?;
            file.write_all(b"\n").map_err(open_err)?;
        }

        Ok(TextState {
            keys,
            entries,
            file,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TextState>, LedgerError> {
        self.state
            .lock()
            .map_err(|e| LedgerError::Query(e.to_string()))
    }
}

#[async_trait]
impl Ledger for TextLedger {
    async fn contains(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.lock()?.keys.contains(key))
    }

    async fn record(&self, entry: &LedgerEntry) -> Result<bool, LedgerError> {
        if entry.key.contains(['\t', '\n', '\r']) {
            return Err(LedgerError::InvalidKey(entry.key.clone()));
        }

        let mut state = self.lock()?;
        if state.keys.contains(&entry.key) {
            return Ok(false);
        }

        let write_err = |source| LedgerError::Write {
            path: self.path.clone(),
            source,
        };
        let line = format_line(entry);
        append_synced(&mut state.file, line.as_bytes()).map_err(write_err)?;

        state.keys.insert(entry.key.clone());
        state.entries.push(entry.clone());
        Ok(true)
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.lock()?.entries.clone())
    }

    async fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.lock()?.keys.len())
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
            .join("text_ledger_tests")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entry(key: &str) -> LedgerEntry {
        LedgerEntry::new(
            key.to_string(),
            PathBuf::from(format!("/save/{}.jpg", key.len())),
            7,
            None,
        )
    }

    #[test]
    fn test_parse_plain_key_line() {
        let e = parse_line("https://i.pximg.net/a.jpg").unwrap();
        assert_eq!(e.key, "https://i.pximg.net/a.jpg");
        assert_eq!(e.path, PathBuf::new());
        assert_eq!(e.size_bytes, 0);
    }

    #[test]
    fn test_parse_full_line() {
        let e = parse_line("k\t/save/1_1_a.jpg\t2048\r").unwrap();
        assert_eq!(e.key, "k");
        assert_eq!(e.path, PathBuf::from("/save/1_1_a.jpg"));
        assert_eq!(e.size_bytes, 2048);
    }

    #[test]
    fn test_parse_blank_line() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let dir = test_dir("creates");
        let path = dir.join("downloaded_images.txt");
        let ledger = TextLedger::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(ledger.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = test_dir("reopen");
        let path = dir.join("downloaded_images.txt");
        {
            let ledger = TextLedger::open(&path).await.unwrap();
            assert!(ledger.record(&entry("https://h/1.jpg")).await.unwrap());
            assert!(ledger.record(&entry("https://h/2.jpg")).await.unwrap());
        }
        let ledger = TextLedger::open(&path).await.unwrap();
        assert!(ledger.contains("https://h/1.jpg").await.unwrap());
        assert!(ledger.contains("https://h/2.jpg").await.unwrap());
        assert!(!ledger.contains("https://h/3.jpg").await.unwrap());
        assert_eq!(ledger.entries().await.unwrap()[0].size_bytes, 7);
    }

    #[tokio::test]
    async fn test_record_twice_appends_once() {
        let dir = test_dir("twice");
        let path = dir.join("downloaded_images.txt");
        let ledger = TextLedger::open(&path).await.unwrap();
        assert!(ledger.record(&entry("k")).await.unwrap());
        assert!(!ledger.record(&entry("k")).await.unwrap());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_reads_plain_ledger_without_trailing_newline() {
        let dir = test_dir("plain");
        let path = dir.join("downloaded_images.txt");
        fs::write(&path, "a\nb\n\na").unwrap();

        let ledger = TextLedger::open(&path).await.unwrap();
        assert_eq!(ledger.len().await.unwrap(), 2);
        ledger.record(&entry("c")).await.unwrap();
        drop(ledger);

        let contents = fs::read_to_string(&path).unwrap();
        let keys: Vec<_> = contents
            .lines()
            .filter_map(parse_line)
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_rejects_key_with_tab() {
        let dir = test_dir("tab_key");
        let ledger = TextLedger::open(&dir.join("downloaded_images.txt"))
            .await
            .unwrap();
        let err = ledger.record(&entry("a\tb")).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidKey(_)));
        assert_eq!(ledger.len().await.unwrap(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_append_leaves_key_absent() {
        // Every write to /dev/full fails with ENOSPC.
        let file = OpenOptions::new().append(true).open("/dev/full").unwrap();
        let ledger = TextLedger {
            state: Mutex::new(TextState {
                keys: HashSet::new(),
                entries: Vec::new(),
                file,
            }),
            path: PathBuf::from("/dev/full"),
        };
        let err = ledger.record(&entry("k")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Write { .. }));
        assert!(!ledger.contains("k").await.unwrap());
        assert_eq!(ledger.len().await.unwrap(), 0);
    }

    #[test]
    fn test_append_synced_writes_whole_line() {
        let dir = test_dir("append_synced");
        let path = dir.join("downloaded_images.txt");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        append_synced(&mut file, b"a\t/p\t1\n").unwrap();
        append_synced(&mut file, b"b\t/q\t2\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\t/p\t1\nb\t/q\t2\n");
    }

    #[tokio::test]
    async fn test_open_in_missing_dir_fails() {
        let dir = test_dir("missing_parent");
        let path = dir.join("nope").join("downloaded_images.txt");
        let err = TextLedger::open(&path).await.unwrap_err();
        assert!(matches!(err, LedgerError::Open { .. }));
    }
}
