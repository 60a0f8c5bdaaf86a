use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::types::*;

#[derive(Parser, Debug)]
#[command(
    name = "pixdl",
    version,
    about = "Download original-resolution illustrations for a tag, skipping ones already fetched"
)]
pub struct Cli {
    /// Log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download the images of a listing for the selected pages and item range
    Download(DownloadArgs),
    /// Re-attempt targets recorded in the failure journal
    RetryFailed(RetryFailedArgs),
    /// Show ledger size and recorded failures
    Status(StatusArgs),
    /// Check that every recorded file is still on disk
    Verify(VerifyArgs),
    /// Delete the ledger so every image is downloaded again
    ResetLedger(ResetLedgerArgs),
}

/// Where a tag's images and bookkeeping live.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Search tag; images go to `<save-root>/<tag>/`
    #[arg(short = 't', long)]
    pub tag: String,

    /// Root directory for downloads
    #[arg(short = 'd', long, env = "PIXDL_SAVE_ROOT", default_value = "~/pixiv")]
    pub save_root: String,

    /// Ledger storage format
    #[arg(long, value_enum, default_value = "text")]
    pub ledger: LedgerBackend,
}

/// Network and loop behaviour shared by `download` and `retry-failed`.
#[derive(Args, Clone)]
pub struct FetchArgs {
    /// Cookie header sent with every request. Prefer the PIXIV_COOKIE
    /// environment variable; command-line values show up in process listings.
    #[arg(long, env = "PIXIV_COOKIE", hide_env_values = true)]
    pub cookie: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 15)]
    pub timeout_secs: u64,

    /// Attempts per image, including the first
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,

    /// Delay rule between attempts
    #[arg(long, value_enum, default_value = "exponential")]
    pub backoff: BackoffKind,

    /// Fixed delay, or exponential base delay, in seconds
    #[arg(long, default_value_t = 1)]
    pub retry_delay_secs: u64,

    /// Upper bound for the exponential delay, in seconds
    #[arg(long, default_value_t = 60)]
    pub max_delay_secs: u64,

    /// Pause between images that hit the network, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub request_delay_ms: u64,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,

    /// Do not toggle pause on Enter
    #[arg(long)]
    pub no_pause_listener: bool,

    /// List what would be downloaded without fetching or writing anything
    #[arg(long)]
    pub dry_run: bool,
}

impl std::fmt::Debug for FetchArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchArgs")
            .field("cookie", &self.cookie.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub fetch: FetchArgs,

    /// Listing JSON produced by the discovery step
    #[arg(short = 'l', long)]
    pub listing: PathBuf,

    /// Pages to download: `3`, `1-3`, `1,3,5` or `P=3`
    #[arg(short = 'p', long, default_value = "1")]
    pub pages: String,

    /// Items within each page, 1-based: `A-B` or `A` (default: all)
    #[arg(short = 'r', long)]
    pub range: Option<String>,
}

#[derive(Args, Debug)]
pub struct RetryFailedArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub fetch: FetchArgs,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// List every recorded failure
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Also compare SHA-256 digests (sqlite ledger only)
    #[arg(long)]
    pub checksums: bool,
}

#[derive(Args, Debug)]
pub struct ResetLedgerArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}
