use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::{DownloadArgs, FetchArgs, StoreArgs};
use crate::download::paths::tag_dir;
use crate::download::DownloadConfig;
use crate::fetch::ClientSettings;
use crate::retry::{BackoffPolicy, RetryConfig};
use crate::types::{BackoffKind, LedgerBackend};

/// Upper bound on the pages one selector may expand to.
const MAX_SELECTED_PAGES: u32 = 10_000;

/// Longest retry delay accepted on the command line: one day.
const MAX_RETRY_DELAY_SECS: u64 = 86_400;

/// Resolved location of a tag's images and bookkeeping.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub tag: String,
    pub tag_dir: PathBuf,
    pub ledger: LedgerBackend,
}

impl StoreConfig {
    pub fn from_args(args: &StoreArgs) -> anyhow::Result<Self> {
        let tag = args.tag.trim();
        if tag.is_empty() {
            anyhow::bail!("--tag must not be empty");
        }
        let save_root = expand_tilde(&args.save_root);
        Ok(Self {
            tag: tag.to_string(),
            tag_dir: tag_dir(&save_root, tag),
            ledger: args.ledger,
        })
    }
}

/// Network, retry and loop settings.
pub struct FetchConfig {
    pub client: ClientSettings,
    pub retry: RetryConfig,
    pub request_delay: Duration,
    pub dry_run: bool,
    pub no_progress_bar: bool,
    pub pause_listener: bool,
}

impl std::fmt::Debug for FetchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ClientSettings redacts the cookie itself.
        f.debug_struct("FetchConfig")
            .field("client", &self.client)
            .field("retry", &self.retry)
            .field("request_delay", &self.request_delay)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl FetchConfig {
    pub fn from_args(args: &FetchArgs) -> anyhow::Result<Self> {
        if args.timeout_secs == 0 {
            anyhow::bail!("--timeout-secs must be at least 1");
        }
        if args.retry_delay_secs > MAX_RETRY_DELAY_SECS || args.max_delay_secs > MAX_RETRY_DELAY_SECS {
            anyhow::bail!(
                "--retry-delay-secs and --max-delay-secs must not exceed {}",
                MAX_RETRY_DELAY_SECS
            );
        }
        let base = Duration::from_secs(args.retry_delay_secs);
        let max = Duration::from_secs(args.max_delay_secs);
        let backoff = match args.backoff {
            BackoffKind::None => BackoffPolicy::None,
            BackoffKind::Fixed => BackoffPolicy::Fixed(base),
            BackoffKind::Exponential => {
                if max < base {
                    anyhow::bail!(
                        "--max-delay-secs ({}) must not be below --retry-delay-secs ({})",
                        args.max_delay_secs,
                        args.retry_delay_secs
                    );
                }
                BackoffPolicy::Exponential { base, max }
            }
        };

        let cookie = args
            .cookie
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        Ok(Self {
            client: ClientSettings {
                timeout: Duration::from_secs(args.timeout_secs),
                cookie,
            },
            retry: RetryConfig {
                max_attempts: args.max_attempts.max(1),
                backoff,
            },
            request_delay: Duration::from_millis(args.request_delay_ms),
            dry_run: args.dry_run,
            no_progress_bar: args.no_progress_bar,
            pause_listener: !args.no_pause_listener,
        })
    }

    pub fn download_config(&self, directory: &Path) -> DownloadConfig {
        DownloadConfig {
            directory: directory.to_path_buf(),
            retry: self.retry,
            request_delay: self.request_delay,
            dry_run: self.dry_run,
            no_progress_bar: self.no_progress_bar,
        }
    }
}

/// Inclusive, 1-based item window applied within each page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemRange {
    pub start: u32,
    pub end: u32,
}

impl ItemRange {
    pub fn all() -> Self {
        Self {
            start: 1,
            end: u32::MAX,
        }
    }

    pub fn contains(&self, index: u32) -> bool {
        (self.start..=self.end).contains(&index)
    }
}

/// Everything `download` needs, validated.
#[derive(Debug)]
pub struct DownloadRequest {
    pub store: StoreConfig,
    pub fetch: FetchConfig,
    pub listing: PathBuf,
    pub pages: Vec<u32>,
    pub range: ItemRange,
}

impl DownloadRequest {
    pub fn from_args(args: &DownloadArgs) -> anyhow::Result<Self> {
        Ok(Self {
            store: StoreConfig::from_args(&args.store)?,
            fetch: FetchConfig::from_args(&args.fetch)?,
            listing: expand_tilde(&args.listing.to_string_lossy()),
            pages: parse_page_selector(&args.pages)?,
            range: args
                .range
                .as_deref()
                .map(parse_item_range)
                .transpose()?
                .unwrap_or_else(ItemRange::all),
        })
    }
}

fn parse_positive(s: &str, what: &str) -> anyhow::Result<u32> {
    let n: u32 = s
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid {} '{}': expected a positive integer", what, s.trim()))?;
    if n == 0 {
        anyhow::bail!("Invalid {} '0': numbering starts at 1", what);
    }
    Ok(n)
}

/// Parse `A-B` into `(A, B)` with `0 < A <= B`, or `A` into `(A, A)`.
fn parse_span(s: &str, what: &str) -> anyhow::Result<(u32, u32)> {
    match s.split_once('-') {
        Some((a, b)) => {
            let start = parse_positive(a, what)?;
            let end = parse_positive(b, what)?;
            if end < start {
                anyhow::bail!("Invalid {} '{}': end is before start", what, s.trim());
            }
            Ok((start, end))
        }
        None => {
            let n = parse_positive(s, what)?;
            Ok((n, n))
        }
    }
}

/// Parse a page selector: `3`, `1-3`, `1,3,5`, combinations like `1-2,5`,
/// and the `P=` prefix. Duplicates are dropped, first occurrence wins.
pub fn parse_page_selector(s: &str) -> anyhow::Result<Vec<u32>> {
    let trimmed = s.trim();
    let body = trimmed
        .strip_prefix("P=")
        .or_else(|| trimmed.strip_prefix("p="))
        .unwrap_or(trimmed);
    if body.trim().is_empty() {
        anyhow::bail!("Empty page selector");
    }

    let mut pages = Vec::new();
    for part in body.split(',') {
        let (start, end) = parse_span(part, "page")?;
        if end - start >= MAX_SELECTED_PAGES {
            anyhow::bail!("Page span '{}' is too large", part.trim());
        }
        for page in start..=end {
            if !pages.contains(&page) {
                pages.push(page);
            }
        }
        if pages.len() as u32 > MAX_SELECTED_PAGES {
            anyhow::bail!("Page selector selects more than {} pages", MAX_SELECTED_PAGES);
        }
    }
    Ok(pages)
}

pub fn parse_item_range(s: &str) -> anyhow::Result<ItemRange> {
    let (start, end) = parse_span(s, "range")?;
    Ok(ItemRange { start, end })
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
