//! Externally supplied listing of discovered image references.
//!
//! Discovery (search pages, AJAX endpoints) happens elsewhere; this module
//! only reads its JSON output and selects the targets for one run.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::config::ItemRange;
use crate::download::DownloadTarget;

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("Failed to read listing {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid listing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Listing is for tag {found:?}, not {expected:?}")]
    TagMismatch { expected: String, found: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub pages: Vec<ListingPage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingPage {
    pub page: u32,
    #[serde(default)]
    pub items: Vec<ListingItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingItem {
    pub url: String,
    #[serde(default)]
    pub author: Option<String>,
}

impl Listing {
    pub async fn load(path: &Path) -> Result<Self, ListingError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ListingError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::parse(&contents).map_err(|e| ListingError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }

    /// Targets for `pages` (in the order given) restricted to `range`.
    ///
    /// Items are numbered from 1 within their page. Pages absent from the
    /// listing and items without a URL are skipped with a warning.
    pub fn targets(
        &self,
        tag: &str,
        pages: &[u32],
        range: ItemRange,
    ) -> Result<Vec<DownloadTarget>, ListingError> {
        if let Some(found) = self.tag.as_deref() {
            if found.trim() != tag.trim() {
                return Err(ListingError::TagMismatch {
                    expected: tag.to_string(),
                    found: found.to_string(),
                });
            }
        }

        let mut targets = Vec::new();
        for &page in pages {
            let Some(listed) = self.pages.iter().find(|p| p.page == page) else {
                tracing::warn!("Page {} is not in the listing, skipping", page);
                continue;
            };

            for (index, item) in listed.items.iter().enumerate() {
                let sequence_index = index as u32 + 1;
                if !range.contains(sequence_index) {
                    continue;
                }
                let url = item.url.trim();
                if url.is_empty() {
                    tracing::warn!("Page {} item {} has no URL, skipping", page, sequence_index);
                    continue;
                }
                // Ledger and journal are line-based.
                if url.chars().any(char::is_control) {
                    tracing::warn!(
                        "Page {} item {} has control characters in its URL, skipping: {:?}",
                        page,
                        sequence_index,
                        url
                    );
                    continue;
                }
                let author = item
                    .author
                    .as_deref()
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .unwrap_or("unknown");
                targets.push(DownloadTarget::new(
                    page,
                    sequence_index,
                    url.to_string(),
                    author.to_string(),
                ));
            }
        }
        Ok(targets)
    }
}
