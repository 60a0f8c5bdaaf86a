//! JSON-lines log of targets that failed, so `retry-failed` can revisit them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::download::error::{ErrorKind, TargetError};
use crate::download::DownloadTarget;

pub const JOURNAL_FILE: &str = "failed_downloads.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// The target's ledger key (its original-image URL).
    pub key: String,
    /// Listing reference the target came from. Empty in older journals,
    /// where `key` held the reference.
    #[serde(default)]
    pub source_url: String,
    pub page: u32,
    pub sequence_index: u32,
    pub author: String,
    pub kind: ErrorKind,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(target: &DownloadTarget, error: &TargetError) -> Self {
        Self {
            key: target.key().to_string(),
            source_url: target.source_url.clone(),
            page: target.page,
            sequence_index: target.sequence_index,
            author: target.author.clone(),
            kind: error.kind(),
            message: error.to_string(),
            failed_at: Utc::now(),
        }
    }

    pub fn to_target(&self) -> DownloadTarget {
        let reference = if self.source_url.is_empty() {
            &self.key
        } else {
            &self.source_url
        };
        DownloadTarget::new(
            self.page,
            self.sequence_index,
            reference.clone(),
            self.author.clone(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct FailureJournal {
    path: PathBuf,
}

impl FailureJournal {
    pub fn in_dir(tag_dir: &Path) -> Self {
        Self {
            path: tag_dir.join(JOURNAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &FailureRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// All records, oldest first. A missing journal is empty; unparseable
    /// lines are skipped with a warning.
    pub async fn load(&self) -> std::io::Result<Vec<FailureRecord>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FailureRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    "Skipping malformed line {} in {}: {}",
                    lineno + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(records)
    }

    /// Atomically replace the journal with `records`; an empty set removes it.
    pub async fn replace(&self, records: &[FailureRecord]) -> std::io::Result<()> {
        if records.is_empty() {
            return match fs::remove_file(&self.path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
        }

        let mut contents = String::new();
        for record in records {
            contents.push_str(&serde_json::to_string(record).map_err(std::io::Error::other)?);
            contents.push('\n');
        }
        crate::download::file::write_atomically(&self.path, contents.as_bytes()).await?;
        Ok(())
    }
}
