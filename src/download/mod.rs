//! Download engine: a sequential loop that, for each target, consults the
//! ledger, resolves the original URL, fetches with retry, writes atomically
//! and records the result.
//!
//! Per-target failures are logged and journaled. Only a ledger failure
//! aborts the batch.

pub mod error;
pub mod file;
pub mod paths;

use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

use crate::control::RunControl;
use crate::fetch::resolve::{self, extension_of, illust_id, ledger_key, ResolvedUrl};
use crate::fetch::{fetch_with_retry, Fetcher};
use crate::journal::{FailureJournal, FailureRecord};
use crate::ledger::{Ledger, LedgerEntry, LedgerError};
use crate::retry::RetryConfig;

use error::TargetError;

/// One discovered image reference, in the order it will be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    /// Thumbnail or listing URL as discovered.
    pub source_url: String,
    /// Original-image URL the source rewrites to; the ledger key.
    pub key: String,
    /// `{page}_{sequence}_{author}` without extension.
    pub suggested_filename: String,
    pub sequence_index: u32,
    pub page: u32,
    pub author: String,
}

impl DownloadTarget {
    pub fn new(page: u32, sequence_index: u32, source_url: String, author: String) -> Self {
        Self {
            suggested_filename: paths::target_stem(page, sequence_index, &author),
            key: ledger_key(&source_url),
            source_url,
            sequence_index,
            page,
            author,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Subset of application config consumed by the download engine.
/// Decoupled from CLI parsing so the engine can be tested independently.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Tag directory receiving the images.
    pub(crate) directory: PathBuf,
    pub(crate) retry: RetryConfig,
    /// Pause after each target that touched the network.
    pub(crate) request_delay: Duration,
    pub(crate) dry_run: bool,
    pub(crate) no_progress_bar: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InLedger,
    DuplicateInBatch,
}

/// Terminal state of one target.
#[derive(Debug)]
pub enum TargetOutcome {
    Recorded {
        path: PathBuf,
        size_bytes: u64,
        attempts: u32,
        used_fallback: bool,
    },
    /// Same bytes as an earlier download; recorded against that file.
    SameContent {
        path: PathBuf,
        existing_key: String,
    },
    Skipped(SkipReason),
    /// Dry run: what would be fetched and where it would go.
    Planned { url: String, path: PathBuf },
    Failed(TargetError),
}

impl TargetOutcome {
    fn touched_network(&self) -> bool {
        matches!(
            self,
            TargetOutcome::Recorded { .. }
                | TargetOutcome::SameContent { .. }
                | TargetOutcome::Failed(_)
        )
    }
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub recorded: usize,
    /// Recorded against an existing file with identical content.
    pub deduplicated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub planned: usize,
    /// Targets that reached a terminal state; the rest were cut off by shutdown.
    pub processed: usize,
    pub interrupted: bool,
    pub failures: Vec<FailureRecord>,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn log(&self, dry_run: bool, directory: &std::path::Path) {
        if dry_run {
            tracing::info!("── Dry Run Summary ──");
            tracing::info!(
                "  {} would be downloaded, {} already recorded",
                self.planned,
                self.skipped
            );
        } else {
            tracing::info!("── Summary ──");
            tracing::info!(
                "  {} recorded, {} skipped, {} failed",
                self.recorded,
                self.skipped,
                self.failed
            );
            if self.deduplicated > 0 {
                tracing::info!(
                    "  {} identical to earlier downloads, no new file written",
                    self.deduplicated
                );
            }
        }
        if self.interrupted {
            tracing::info!("  Interrupted after {} target(s)", self.processed);
        }
        tracing::info!("  destination: {}", directory.display());
        tracing::info!("  elapsed: {}", format_duration(self.elapsed));
    }
}

pub struct Orchestrator {
    fetcher: Arc<dyn Fetcher>,
    ledger: Arc<dyn Ledger>,
    config: DownloadConfig,
    control: RunControl,
    journal: Option<FailureJournal>,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        ledger: Arc<dyn Ledger>,
        config: DownloadConfig,
        control: RunControl,
    ) -> Self {
        Self {
            fetcher,
            ledger,
            config,
            control,
            journal: None,
        }
    }

    /// Append each failure to `journal` as it happens.
    pub fn with_journal(mut self, journal: FailureJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Process `targets` in order.
    ///
    /// Stops early (with `interrupted` set) on shutdown. Returns `Err` only
    /// when the ledger fails.
    pub async fn run(&self, targets: &[DownloadTarget]) -> Result<BatchSummary, LedgerError> {
        let started = Instant::now();
        let pb = create_progress_bar(self.config.no_progress_bar, targets.len() as u64);
        let mut seen: HashSet<&str> = HashSet::with_capacity(targets.len());
        let mut summary = BatchSummary::default();

        for (index, target) in targets.iter().enumerate() {
            if !self.control.checkpoint().await {
                summary.interrupted = true;
                pb.suspend(|| {
                    tracing::info!(
                        "Shutdown requested, {} target(s) not started",
                        targets.len() - index
                    )
                });
                break;
            }

            pb.set_message(target.suggested_filename.clone());
            let outcome = if seen.insert(target.key()) {
                match self.process_target(target).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        pb.finish_and_clear();
                        return Err(e);
                    }
                }
            } else {
                TargetOutcome::Skipped(SkipReason::DuplicateInBatch)
            };
            summary.processed += 1;

            let touched_network = outcome.touched_network();
            self.account(target, outcome, &mut summary, &pb).await;
            pb.inc(1);

            let more_remaining = index + 1 < targets.len();
            if touched_network && more_remaining && !self.config.request_delay.is_zero() {
                self.control.pause_for(self.config.request_delay).await;
            }
        }

        pb.finish_and_clear();
        summary.elapsed = started.elapsed();
        Ok(summary)
    }

    async fn account(
        &self,
        target: &DownloadTarget,
        outcome: TargetOutcome,
        summary: &mut BatchSummary,
        pb: &ProgressBar,
    ) {
        match outcome {
            TargetOutcome::Recorded {
                path,
                size_bytes,
                attempts,
                used_fallback,
            } => {
                summary.recorded += 1;
                pb.suspend(|| {
                    tracing::info!(
                        "Saved {} ({} bytes, {} attempt(s){})",
                        path.display(),
                        size_bytes,
                        attempts,
                        if used_fallback { ", png fallback" } else { "" }
                    )
                });
            }
            TargetOutcome::SameContent { path, existing_key } => {
                summary.deduplicated += 1;
                pb.suspend(|| {
                    tracing::info!(
                        "{} has the same content as {}, recorded against {}",
                        target.suggested_filename,
                        existing_key,
                        path.display()
                    )
                });
            }
            TargetOutcome::Skipped(reason) => {
                summary.skipped += 1;
                tracing::debug!(
                    "Skipping {} ({:?}): {}",
                    target.suggested_filename,
                    reason,
                    target.source_url
                );
            }
            TargetOutcome::Planned { url, path } => {
                summary.planned += 1;
                pb.suspend(|| tracing::info!("[DRY RUN] Would download {} -> {}", url, path.display()));
            }
            TargetOutcome::Failed(e) => {
                summary.failed += 1;
                pb.suspend(|| {
                    tracing::warn!(
                        page = target.page,
                        sequence = target.sequence_index,
                        kind = %e.kind(),
                        "Download failed: {}: {}",
                        target.suggested_filename,
                        e
                    )
                });
                let record = FailureRecord::new(target, &e);
                if let Some(journal) = &self.journal {
                    if let Err(err) = journal.append(&record).await {
                        pb.suspend(|| {
                            tracing::warn!(
                                "Could not append to {}: {}",
                                journal.path().display(),
                                err
                            )
                        });
                    }
                }
                summary.failures.push(record);
            }
        }
    }

    /// Where `target` is written. The key is not in the ledger yet, so a file
    /// already at the plain name belongs to another download and is left alone:
    /// the new file gets the illustration id (or a key hash) as a suffix.
    async fn output_path(&self, target: &DownloadTarget, resolved: &ResolvedUrl) -> PathBuf {
        let directory = &self.config.directory;
        let plain = paths::final_path(directory, &target.suggested_filename, &resolved.extension);
        if !tokio::fs::try_exists(&plain).await.unwrap_or(false) {
            return plain;
        }

        let suffix = match illust_id(&resolved.url) {
            Some(id) => id.to_string(),
            None => file::sha256_hex(target.key().as_bytes())[..12].to_string(),
        };
        let deduped = paths::final_path(
            directory,
            &paths::insert_suffix(&target.suggested_filename, &suffix),
            &resolved.extension,
        );
        tracing::debug!(
            "{} already exists, saving as {}",
            plain.display(),
            deduped.display()
        );
        deduped
    }

    /// Drive one target to a terminal state.
    async fn process_target(&self, target: &DownloadTarget) -> Result<TargetOutcome, LedgerError> {
        if target.key().chars().any(char::is_control) {
            return Ok(TargetOutcome::Failed(TargetError::InvalidReference(
                target.key().to_string(),
            )));
        }
        if self.ledger.contains(target.key()).await? {
            return Ok(TargetOutcome::Skipped(SkipReason::InLedger));
        }

        if self.config.dry_run {
            let url = target.key().to_string();
            let path = paths::final_path(
                &self.config.directory,
                &target.suggested_filename,
                &extension_of(&url),
            );
            return Ok(TargetOutcome::Planned { url, path });
        }

        let resolved = match resolve::resolve(self.fetcher.as_ref(), &target.source_url).await {
            Ok(r) => r,
            Err(e) => return Ok(TargetOutcome::Failed(e.into())),
        };

        tracing::debug!(url = %resolved.url, "fetching");
        let fetched =
            match fetch_with_retry(self.fetcher.as_ref(), &resolved.url, &self.config.retry).await {
                Ok(f) => f,
                Err(e) => {
                    return Ok(TargetOutcome::Failed(TargetError::from_retry(
                        &resolved.url,
                        e,
                    )))
                }
            };

        let digest = file::sha256_hex(&fetched.value);
        if let Some(existing) = self.ledger.find_by_digest(&digest).await? {
            if tokio::fs::try_exists(&existing.path).await.unwrap_or(false) {
                let entry = LedgerEntry::new(
                    target.key().to_string(),
                    existing.path.clone(),
                    existing.size_bytes,
                    Some(digest),
                );
                self.ledger.record(&entry).await?;
                return Ok(TargetOutcome::SameContent {
                    path: existing.path,
                    existing_key: existing.key,
                });
            }
        }

        let path = self.output_path(target, &resolved).await;
        let size_bytes = match file::write_atomically(&path, &fetched.value).await {
            Ok(n) => n,
            Err(e) => return Ok(TargetOutcome::Failed(TargetError::Io { path, source: e })),
        };

        let entry = LedgerEntry::new(target.key().to_string(), path.clone(), size_bytes, Some(digest));
        if let Err(e) = self.ledger.record(&entry).await {
            // Keep "file on disk" and "key in ledger" in step: the file goes
            // only if the key did not make it in.
            if matches!(self.ledger.contains(target.key()).await, Ok(true)) {
                tracing::error!(
                    "Ledger reported an error but holds {}; keeping {}",
                    target.key(),
                    path.display()
                );
            } else if let Err(rm) = tokio::fs::remove_file(&path).await {
                tracing::error!("Could not remove unrecorded {}: {}", path.display(), rm);
            }
            return Err(e);
        }

        Ok(TargetOutcome::Recorded {
            path,
            size_bytes,
            attempts: fetched.attempts,
            used_fallback: resolved.used_fallback,
        })
    }
}

/// Create a progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar` or
/// stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use crate::ledger::{SqliteLedger, TextLedger};
    use crate::retry::BackoffPolicy;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::error::ErrorKind;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("pixdl")
            .join("orchestrator_tests")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn thumb(id: u32) -> String {
        format!(
            "https://i.pximg.net/c/250x250_80_a2/img-master/img/2024/01/02/03/04/05/{id}_p0_square1200.jpg"
        )
    }

    fn original(id: u32, ext: &str) -> String {
        format!("https://i.pximg.net/img-original/img/2024/01/02/03/04/05/{id}_p0.{ext}")
    }

    /// In-memory image host. Probes succeed for URLs with a body; fetches can
    /// be scripted to fail transiently or with a fixed status.
    #[derive(Default)]
    struct StubFetcher {
        bodies: HashMap<String, Vec<u8>>,
        transient_failures: Mutex<HashMap<String, u32>>,
        fixed_status: HashMap<String, u16>,
        fetches: AtomicU32,
        probes: AtomicU32,
    }

    impl StubFetcher {
        fn with_images(images: &[(u32, &str)]) -> Self {
            let mut stub = Self::default();
            for &(id, ext) in images {
                stub.bodies
                    .insert(original(id, ext), format!("image-{id}").into_bytes());
            }
            stub
        }

        fn fail_transiently(self, url: String, times: u32) -> Self {
            self.transient_failures.lock().unwrap().insert(url, times);
            self
        }

        fn fetches(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }

        fn probes(&self) -> u32 {
            self.probes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(remaining) = self.transient_failures.lock().unwrap().get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Connection {
                        url: url.into(),
                        reason: "connection reset".into(),
                    });
                }
            }
            if let Some(&status) = self.fixed_status.get(url) {
                return Err(FetchError::HttpStatus {
                    status,
                    url: url.into(),
                });
            }
            self.bodies
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus {
                    status: 404,
                    url: url.into(),
                })
        }

        async fn probe(&self, url: &str) -> Result<(), FetchError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.bodies.contains_key(url) {
                Ok(())
            } else {
                Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.into(),
                })
            }
        }
    }

    /// Ledger whose writes always fail.
    struct BrokenLedger;

    #[async_trait]
    impl Ledger for BrokenLedger {
        async fn contains(&self, _key: &str) -> Result<bool, LedgerError> {
            Ok(false)
        }
        async fn record(&self, _entry: &LedgerEntry) -> Result<bool, LedgerError> {
            Err(LedgerError::Write {
                path: PathBuf::from("/broken"),
                source: std::io::Error::other("disk full"),
            })
        }
        async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
            Ok(Vec::new())
        }
        async fn len(&self) -> Result<usize, LedgerError> {
            Ok(0)
        }
        fn location(&self) -> &Path {
            Path::new("/broken")
        }
    }

    fn config(directory: &Path) -> DownloadConfig {
        DownloadConfig {
            directory: directory.to_path_buf(),
            retry: RetryConfig {
                max_attempts: 3,
                backoff: BackoffPolicy::None,
            },
            request_delay: Duration::ZERO,
            dry_run: false,
            no_progress_bar: true,
        }
    }

    fn targets(ids: &[u32]) -> Vec<DownloadTarget> {
        ids.iter()
            .enumerate()
            .map(|(i, &id)| DownloadTarget::new(1, i as u32 + 1, thumb(id), "artist".into()))
            .collect()
    }

    async fn text_ledger(dir: &Path) -> Arc<dyn Ledger> {
        Arc::new(
            TextLedger::open(&dir.join(crate::ledger::TEXT_LEDGER_FILE))
                .await
                .unwrap(),
        )
    }

    fn orchestrator(
        fetcher: &Arc<StubFetcher>,
        ledger: &Arc<dyn Ledger>,
        config: DownloadConfig,
    ) -> Orchestrator {
        Orchestrator::new(
            fetcher.clone(),
            ledger.clone(),
            config,
            RunControl::new(),
        )
    }

    #[test]
    fn test_target_stem_and_key() {
        let t = DownloadTarget::new(2, 7, "https://h/a.jpg".into(), "a/b".into());
        assert_eq!(t.suggested_filename, "2_7_a_b");
        assert_eq!(t.key(), "https://h/a.jpg");
    }

    #[tokio::test]
    async fn test_three_targets_recorded() {
        let dir = test_dir("three_recorded");
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg"), (2, "jpg"), (3, "jpg")]));
        let ledger = text_ledger(&dir).await;
        let targets = targets(&[1, 2, 3]);

        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets)
            .await
            .unwrap();

        assert_eq!(summary.recorded, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(ledger.len().await.unwrap(), 3);
        for t in &targets {
            assert!(ledger.contains(t.key()).await.unwrap());
            let path = dir.join(format!("{}.jpg", t.suggested_filename));
            assert!(std::fs::metadata(&path).unwrap().len() > 0);
        }
    }

    #[tokio::test]
    async fn test_rerun_performs_zero_fetches() {
        let dir = test_dir("rerun");
        let targets = targets(&[1, 2, 3]);
        {
            let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg"), (2, "jpg"), (3, "jpg")]));
            let ledger = text_ledger(&dir).await;
            orchestrator(&fetcher, &ledger, config(&dir))
                .run(&targets)
                .await
                .unwrap();
        }

        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg"), (2, "jpg"), (3, "jpg")]));
        let ledger = text_ledger(&dir).await;
        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.recorded, 0);
        assert_eq!(fetcher.fetches(), 0);
        assert_eq!(fetcher.probes(), 0);
        assert_eq!(ledger.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_not_found_leaves_no_trace() {
        let dir = test_dir("not_found");
        let fetcher = Arc::new(StubFetcher::default());
        let ledger = text_ledger(&dir).await;
        let targets = targets(&[9]);

        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets)
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].kind, ErrorKind::NotFound);
        assert_eq!(fetcher.fetches(), 0);
        assert!(!ledger.contains(targets[0].key()).await.unwrap());
        for ext in ["jpg", "png", "jpg.part", "png.part"] {
            assert!(!dir.join(format!("1_1_artist.{ext}")).exists());
        }
    }

    #[tokio::test]
    async fn test_png_fallback_sets_extension() {
        let dir = test_dir("png_fallback");
        let fetcher = Arc::new(StubFetcher::with_images(&[(5, "png")]));
        let ledger = text_ledger(&dir).await;
        let orch = orchestrator(&fetcher, &ledger, config(&dir));

        match orch.process_target(&targets(&[5])[0]).await.unwrap() {
            TargetOutcome::Recorded {
                path,
                used_fallback,
                ..
            } => {
                assert_eq!(path, dir.join("1_1_artist.png"));
                assert!(used_fallback);
                assert_eq!(std::fs::read(&path).unwrap(), b"image-5");
            }
            other => panic!("expected Recorded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let dir = test_dir("transient");
        let fetcher = Arc::new(
            StubFetcher::with_images(&[(1, "jpg")]).fail_transiently(original(1, "jpg"), 1),
        );
        let ledger = text_ledger(&dir).await;
        let orch = orchestrator(&fetcher, &ledger, config(&dir));

        match orch.process_target(&targets(&[1])[0]).await.unwrap() {
            TargetOutcome::Recorded { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected Recorded, got {:?}", other),
        }
        assert_eq!(fetcher.fetches(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_records_nothing() {
        let dir = test_dir("exhausted");
        let fetcher = Arc::new(
            StubFetcher::with_images(&[(1, "jpg")]).fail_transiently(original(1, "jpg"), 5),
        );
        let ledger = text_ledger(&dir).await;
        let targets = targets(&[1]);

        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets)
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].kind, ErrorKind::Exhausted);
        assert_eq!(fetcher.fetches(), 3);
        assert_eq!(ledger.len().await.unwrap(), 0);
        assert!(!dir.join("1_1_artist.jpg").exists());
    }

    #[tokio::test]
    async fn test_forbidden_is_not_retried() {
        let dir = test_dir("forbidden");
        let mut stub = StubFetcher::with_images(&[(1, "jpg")]);
        stub.fixed_status.insert(original(1, "jpg"), 403);
        let fetcher = Arc::new(stub);
        let ledger = text_ledger(&dir).await;

        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets(&[1]))
            .await
            .unwrap();

        assert_eq!(summary.failures[0].kind, ErrorKind::HttpStatus);
        assert_eq!(fetcher.fetches(), 1);
    }

    #[tokio::test]
    async fn test_disk_error_is_per_target() {
        let dir = test_dir("disk_error");
        // The image directory is a regular file, so every write fails.
        let blocked = dir.join("blocked");
        std::fs::write(&blocked, b"not a directory").unwrap();
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg"), (2, "jpg")]));
        let ledger = text_ledger(&dir).await;

        let summary = orchestrator(&fetcher, &ledger, config(&blocked))
            .run(&targets(&[1, 2]))
            .await
            .unwrap();

        assert_eq!(summary.failed, 2);
        assert!(summary.failures.iter().all(|f| f.kind == ErrorKind::Io));
        assert_eq!(ledger.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ledger_write_failure_is_fatal_and_removes_file() {
        let dir = test_dir("ledger_fatal");
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg"), (2, "jpg")]));
        let ledger: Arc<dyn Ledger> = Arc::new(BrokenLedger);

        let result = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets(&[1, 2]))
            .await;

        assert!(matches!(result, Err(LedgerError::Write { .. })));
        assert!(!dir.join("1_1_artist.jpg").exists());
        // The batch stopped at the first target.
        assert_eq!(fetcher.fetches(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_in_batch_fetched_once() {
        let dir = test_dir("duplicate");
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg")]));
        let ledger = text_ledger(&dir).await;
        let mut targets = targets(&[1]);
        targets.push(DownloadTarget::new(2, 1, thumb(1), "artist".into()));

        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets)
            .await
            .unwrap();

        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(fetcher.fetches(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = test_dir("dry_run");
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg"), (2, "jpg")]));
        let ledger = text_ledger(&dir).await;
        let mut cfg = config(&dir);
        cfg.dry_run = true;

        let summary = orchestrator(&fetcher, &ledger, cfg)
            .run(&targets(&[1, 2]))
            .await
            .unwrap();

        assert_eq!(summary.planned, 2);
        assert_eq!(fetcher.fetches() + fetcher.probes(), 0);
        assert_eq!(ledger.len().await.unwrap(), 0);
        assert!(!dir.join("1_1_artist.jpg").exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = test_dir("cancelled");
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg"), (2, "jpg")]));
        let ledger = text_ledger(&dir).await;
        let control = RunControl::new();
        control.request_shutdown();

        let summary = Orchestrator::new(fetcher.clone(), ledger.clone(), config(&dir), control)
            .run(&targets(&[1, 2]))
            .await
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.processed, 0);
        assert_eq!(fetcher.fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_until_cleared() {
        let dir = test_dir("paused");
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg")]));
        let ledger = text_ledger(&dir).await;
        let control = RunControl::new();
        control.set_paused(true);

        let orch = Arc::new(Orchestrator::new(
            fetcher.clone(),
            ledger.clone(),
            config(&dir),
            control.clone(),
        ));
        let handle = tokio::spawn({
            let orch = orch.clone();
            async move { orch.run(&targets(&[1])).await }
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fetcher.probes() + fetcher.fetches(), 0);

        control.set_paused(false);
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.recorded, 1);
    }

    #[tokio::test]
    async fn test_failures_appended_to_journal() {
        let dir = test_dir("journal");
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg")]));
        let ledger = text_ledger(&dir).await;
        let journal = FailureJournal::in_dir(&dir);

        orchestrator(&fetcher, &ledger, config(&dir))
            .with_journal(journal.clone())
            .run(&targets(&[1, 2]))
            .await
            .unwrap();

        let records = journal.load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, original(2, "jpg"));
        assert_eq!(records[0].source_url, thumb(2));
        assert_eq!(records[0].sequence_index, 2);
    }

    #[tokio::test]
    async fn test_thumbnail_sizes_share_one_key() {
        let dir = test_dir("thumbnail_sizes");
        let other_size = "https://i.pximg.net/c/540x540_70/img-master/img/2024/01/02/03/04/05/1_p0_master1200.jpg";
        let mut batch = targets(&[1]);
        batch.push(DownloadTarget::new(1, 2, other_size.into(), "artist".into()));

        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg")]));
        let ledger = text_ledger(&dir).await;
        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&batch)
            .await
            .unwrap();
        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(fetcher.fetches(), 1);
        assert!(ledger.contains(&original(1, "jpg")).await.unwrap());

        // A later listing showing only the other size is still a skip.
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg")]));
        let ledger = text_ledger(&dir).await;
        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&[DownloadTarget::new(3, 4, other_size.into(), "artist".into())])
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(fetcher.fetches() + fetcher.probes(), 0);
    }

    #[tokio::test]
    async fn test_slot_collision_keeps_recorded_file() {
        let dir = test_dir("slot_collision");
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg"), (2, "jpg")]));
        let ledger = text_ledger(&dir).await;
        orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets(&[1]))
            .await
            .unwrap();

        // Listing shifted: image 2 now occupies page 1, item 1.
        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets(&[2]))
            .await
            .unwrap();
        assert_eq!(summary.recorded, 1);

        assert_eq!(std::fs::read(dir.join("1_1_artist.jpg")).unwrap(), b"image-1");
        assert_eq!(std::fs::read(dir.join("1_1_artist-2.jpg")).unwrap(), b"image-2");
        let entries = ledger.entries().await.unwrap();
        let path_of = |key: &str| {
            entries
                .iter()
                .find(|e| e.key == key)
                .map(|e| e.path.clone())
                .unwrap()
        };
        assert_eq!(path_of(&original(1, "jpg")), dir.join("1_1_artist.jpg"));
        assert_eq!(path_of(&original(2, "jpg")), dir.join("1_1_artist-2.jpg"));
    }

    /// Ledger that stores the key and then reports a write error, like an
    /// append whose sync failed after the bytes landed.
    #[derive(Default)]
    struct PersistThenFailLedger {
        keys: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl Ledger for PersistThenFailLedger {
        async fn contains(&self, key: &str) -> Result<bool, LedgerError> {
            Ok(self.keys.lock().unwrap().contains(key))
        }
        async fn record(&self, entry: &LedgerEntry) -> Result<bool, LedgerError> {
            self.keys.lock().unwrap().insert(entry.key.clone());
            Err(LedgerError::Write {
                path: PathBuf::from("/flaky"),
                source: std::io::Error::other("sync failed"),
            })
        }
        async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
            Ok(Vec::new())
        }
        async fn len(&self) -> Result<usize, LedgerError> {
            Ok(self.keys.lock().unwrap().len())
        }
        fn location(&self) -> &Path {
            Path::new("/flaky")
        }
    }

    #[tokio::test]
    async fn test_file_kept_when_key_persisted_despite_error() {
        let dir = test_dir("persist_then_fail");
        let fetcher = Arc::new(StubFetcher::with_images(&[(1, "jpg")]));
        let ledger: Arc<dyn Ledger> = Arc::new(PersistThenFailLedger::default());

        let result = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets(&[1]))
            .await;

        assert!(matches!(result, Err(LedgerError::Write { .. })));
        assert!(ledger.contains(&original(1, "jpg")).await.unwrap());
        assert_eq!(std::fs::read(dir.join("1_1_artist.jpg")).unwrap(), b"image-1");
    }

    #[tokio::test]
    async fn test_same_content_reuses_recorded_file() {
        let dir = test_dir("same_content");
        let mut stub = StubFetcher::with_images(&[(1, "jpg")]);
        stub.bodies.insert(original(2, "jpg"), b"image-1".to_vec());
        let fetcher = Arc::new(stub);
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::open_in_memory().unwrap());

        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&targets(&[1, 2]))
            .await
            .unwrap();

        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.deduplicated, 1);
        assert!(!dir.join("1_2_artist.jpg").exists());
        let entries = ledger.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.path == dir.join("1_1_artist.jpg")));
    }

    #[tokio::test]
    async fn test_control_chars_fail_one_target_only() {
        let dir = test_dir("control_chars");
        let fetcher = Arc::new(StubFetcher::with_images(&[(2, "jpg")]));
        let ledger = text_ledger(&dir).await;
        let batch = vec![
            DownloadTarget::new(1, 1, "https://i.pximg.net/bad\tname.jpg".into(), "artist".into()),
            DownloadTarget::new(1, 2, thumb(2), "artist".into()),
        ];

        let summary = orchestrator(&fetcher, &ledger, config(&dir))
            .run(&batch)
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].kind, ErrorKind::InvalidReference);
        assert_eq!(summary.recorded, 1);
        assert!(ledger.contains(&original(2, "jpg")).await.unwrap());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 02m 05s");
    }

    #[test]
    fn test_create_progress_bar_hidden_when_disabled() {
        let pb = create_progress_bar(true, 100);
        assert!(pb.is_hidden());
    }
}
