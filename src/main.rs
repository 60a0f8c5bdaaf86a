//! pixdl: download original-resolution Pixiv illustrations for a tag.
//!
//! Thumbnail references from a listing are rewritten to original-image URLs,
//! fetched with bounded retries, written atomically into `<save-root>/<tag>/`
//! and recorded in a per-tag ledger so re-runs skip finished work.

#![warn(clippy::all)]

mod cli;
mod config;
mod control;
mod download;
mod fetch;
mod journal;
mod ledger;
mod listing;
pub mod retry;
mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::{DownloadRequest, FetchConfig, StoreConfig};
use download::{BatchSummary, Orchestrator};
use journal::{FailureJournal, FailureRecord};
use ledger::LedgerLock;
use listing::Listing;

/// Lock the tag directory, open its ledger and assemble the download loop.
///
/// The lock must be kept alive until the batch finishes.
async fn prepare_run(
    store: &StoreConfig,
    fetch: &FetchConfig,
) -> anyhow::Result<(LedgerLock, Orchestrator)> {
    tokio::fs::create_dir_all(&store.tag_dir)
        .await
        .with_context(|| format!("Failed to create {}", store.tag_dir.display()))?;

    let lock = LedgerLock::acquire(&store.tag_dir).await?;
    let ledger = ledger::open(store.ledger, &store.tag_dir)
        .await
        .context("Cannot open the ledger; refusing to download without it")?;
    tracing::debug!(
        "Using {} ledger at {}",
        store.ledger.as_str(),
        ledger.location().display()
    );

    let fetcher = fetch::HttpFetcher::new(&fetch.client)?;

    let run_control = control::RunControl::new();
    control::install_signal_handlers(&run_control);
    if fetch.pause_listener && !fetch.dry_run {
        control::spawn_stdin_toggle(&run_control);
    }

    let orchestrator = Orchestrator::new(
        Arc::new(fetcher),
        ledger,
        fetch.download_config(&store.tag_dir),
        run_control,
    );
    Ok((lock, orchestrator))
}

fn finish(summary: &BatchSummary, store: &StoreConfig, dry_run: bool) -> anyhow::Result<()> {
    summary.log(dry_run, &store.tag_dir);
    if summary.failed > 0 {
        anyhow::bail!(
            "{} image(s) failed; run `pixdl retry-failed --tag {:?}` to try them again",
            summary.failed,
            store.tag
        );
    }
    Ok(())
}

/// Run the download command.
async fn run_download(args: cli::DownloadArgs) -> anyhow::Result<()> {
    let request = DownloadRequest::from_args(&args)?;
    let listing = Listing::load(&request.listing).await?;
    let targets = listing.targets(&request.store.tag, &request.pages, request.range)?;

    if targets.is_empty() {
        tracing::info!("No images selected for pages {:?}", request.pages);
        return Ok(());
    }
    tracing::info!(
        tag = %request.store.tag,
        pages = ?request.pages,
        targets = targets.len(),
        "Starting pixdl"
    );

    let (_lock, orchestrator) = prepare_run(&request.store, &request.fetch).await?;
    let orchestrator = if request.fetch.dry_run {
        orchestrator
    } else {
        orchestrator.with_journal(FailureJournal::in_dir(&request.store.tag_dir))
    };

    let summary = orchestrator
        .run(&targets)
        .await
        .context("Ledger failure, batch stopped")?;
    finish(&summary, &request.store, request.fetch.dry_run)
}

/// Latest record per key, in the order the keys last failed.
fn latest_per_key(records: Vec<FailureRecord>) -> Vec<FailureRecord> {
    let mut latest: Vec<FailureRecord> = Vec::with_capacity(records.len());
    for record in records {
        latest.retain(|r| r.key != record.key);
        latest.push(record);
    }
    latest
}

/// Drop failures whose image has since been recorded in the ledger.
async fn unresolved(
    records: Vec<FailureRecord>,
    ledger: &dyn ledger::Ledger,
) -> Result<Vec<FailureRecord>, ledger::LedgerError> {
    let mut open = Vec::with_capacity(records.len());
    for record in records {
        if !ledger.contains(record.to_target().key()).await? {
            open.push(record);
        }
    }
    Ok(open)
}

/// Run the retry-failed command.
async fn run_retry_failed(args: cli::RetryFailedArgs) -> anyhow::Result<()> {
    let store = StoreConfig::from_args(&args.store)?;
    let fetch = FetchConfig::from_args(&args.fetch)?;
    let journal = FailureJournal::in_dir(&store.tag_dir);

    let (_lock, orchestrator) = prepare_run(&store, &fetch).await?;
    let records = latest_per_key(
        journal
            .load()
            .await
            .with_context(|| format!("Failed to read {}", journal.path().display()))?,
    );
    if records.is_empty() {
        println!("No failed downloads recorded for {:?}", store.tag);
        return Ok(());
    }

    tracing::info!("Retrying {} failed image(s)", records.len());
    let targets: Vec<_> = records.iter().map(FailureRecord::to_target).collect();
    let summary = orchestrator
        .run(&targets)
        .await
        .context("Ledger failure, batch stopped")?;

    if !fetch.dry_run {
        let mut remaining = summary.failures.clone();
        remaining.extend(records[summary.processed..].iter().cloned());
        journal
            .replace(&remaining)
            .await
            .with_context(|| format!("Failed to rewrite {}", journal.path().display()))?;
    }
    finish(&summary, &store, fetch.dry_run)
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs) -> anyhow::Result<()> {
    let store = StoreConfig::from_args(&args.store)?;
    let ledger_path = ledger::ledger_path(store.ledger, &store.tag_dir);

    println!("Tag directory: {}", store.tag_dir.display());
    let mut opened = None;
    if ledger_path.exists() {
        let ledger = ledger::open(store.ledger, &store.tag_dir).await?;
        println!(
            "Ledger ({}): {}",
            store.ledger.as_str(),
            ledger_path.display()
        );
        println!("  Downloaded: {}", ledger.len().await?);
        if let Some(last) = ledger
            .entries()
            .await?
            .iter()
            .filter_map(|e| e.recorded_at)
            .max()
        {
            println!("  Last recorded: {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        opened = Some(ledger);
    } else {
        println!("No ledger found at {}", ledger_path.display());
        println!("Run a download first to create it.");
    }

    let journal = FailureJournal::in_dir(&store.tag_dir);
    let mut failures = latest_per_key(journal.load().await?);
    if let Some(ledger) = &opened {
        failures = unresolved(failures, ledger.as_ref()).await?;
    }
    println!("  Failed:     {}", failures.len());

    if args.failed && !failures.is_empty() {
        println!();
        println!("Failed images:");
        for f in &failures {
            println!(
                "  {}_{} ({}) [{}] - {}",
                f.page, f.sequence_index, f.key, f.kind, f.message
            );
        }
    }

    Ok(())
}

/// Run the reset-ledger command.
async fn run_reset_ledger(args: cli::ResetLedgerArgs) -> anyhow::Result<()> {
    let store = StoreConfig::from_args(&args.store)?;
    let ledger_path = ledger::ledger_path(store.ledger, &store.tag_dir);

    if !ledger_path.exists() {
        println!("No ledger found at {}", ledger_path.display());
        return Ok(());
    }

    if !args.yes {
        println!("This will delete the ledger at:");
        println!("  {}", ledger_path.display());
        println!("Every image for this tag will be downloaded again on the next run.");
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let _lock = LedgerLock::acquire(&store.tag_dir).await?;
    std::fs::remove_file(&ledger_path)
        .with_context(|| format!("Failed to delete {}", ledger_path.display()))?;
    println!("Ledger deleted.");

    if store.ledger == types::LedgerBackend::Sqlite {
        let _ = std::fs::remove_file(ledger_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(ledger_path.with_extension("db-shm"));
    }

    Ok(())
}

/// Run the verify command.
async fn run_verify(args: cli::VerifyArgs) -> anyhow::Result<()> {
    let store = StoreConfig::from_args(&args.store)?;
    let ledger_path = ledger::ledger_path(store.ledger, &store.tag_dir);

    if !ledger_path.exists() {
        println!("No ledger found at {}", ledger_path.display());
        println!("Run a download first to create it.");
        return Ok(());
    }

    let ledger = ledger::open(store.ledger, &store.tag_dir).await?;
    let entries = ledger.entries().await?;

    println!("Verifying {} recorded images...", entries.len());
    if args.checksums && store.ledger == types::LedgerBackend::Text {
        println!("The text ledger stores no digests; checking presence and size only.");
    }
    println!();

    let mut missing = 0;
    let mut corrupted = 0;
    let mut verified = 0;

    for entry in &entries {
        if entry.path.as_os_str().is_empty() {
            println!("NO PATH: {} - no local path recorded", entry.key);
            missing += 1;
            continue;
        }

        let metadata = match tokio::fs::metadata(&entry.path).await {
            Ok(m) => m,
            Err(_) => {
                println!("MISSING: {} ({})", entry.path.display(), entry.key);
                missing += 1;
                continue;
            }
        };
        if metadata.len() == 0 {
            println!("EMPTY: {} ({})", entry.path.display(), entry.key);
            corrupted += 1;
            continue;
        }
        if entry.size_bytes > 0 && metadata.len() != entry.size_bytes {
            println!(
                "SIZE MISMATCH: {} (recorded {}, found {})",
                entry.path.display(),
                entry.size_bytes,
                metadata.len()
            );
            corrupted += 1;
            continue;
        }

        match (&entry.digest, args.checksums) {
            (Some(expected), true) => match verify_checksum(&entry.path, expected).await {
                Ok(true) => verified += 1,
                Ok(false) => {
                    println!("CORRUPTED: {} ({})", entry.path.display(), entry.key);
                    corrupted += 1;
                }
                Err(e) => {
                    println!("ERROR: {} - {}", entry.path.display(), e);
                    corrupted += 1;
                }
            },
            _ => verified += 1,
        }
    }

    println!();
    println!("Results:");
    println!("  Verified:  {}", verified);
    println!("  Missing:   {}", missing);
    println!("  Corrupted: {}", corrupted);

    if missing > 0 || corrupted > 0 {
        anyhow::bail!("{} problem(s) found", missing + corrupted);
    }

    Ok(())
}

/// Compare a file's SHA-256 with the recorded digest.
async fn verify_checksum(path: &Path, expected: &str) -> anyhow::Result<bool> {
    let path = path.to_path_buf();
    let expected = expected.to_string();

    tokio::task::spawn_blocking(move || {
        let computed = download::file::sha256_file(&path)?;
        Ok(computed.eq_ignore_ascii_case(&expected))
    })
    .await?
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    match cli.command {
        Command::Download(args) => run_download(args).await,
        Command::RetryFailed(args) => run_retry_failed(args).await,
        Command::Status(args) => run_status(args).await,
        Command::Verify(args) => run_verify(args).await,
        Command::ResetLedger(args) => run_reset_ledger(args).await,
    }
}
