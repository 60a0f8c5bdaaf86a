//! Run control shared between the download loop and its external triggers.
//!
//! Shutdown: the first SIGINT (Ctrl+C) or SIGTERM cancels a
//! [`CancellationToken`] so the loop stops before its next target; a second
//! signal force-exits.
//!
//! Pause: an atomic flag flipped by a line on an interactive stdin or by
//! SIGUSR1. The loop only looks at it between targets, so a pause never
//! interrupts a write.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How often a paused loop re-checks the flag.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct RunControl {
    paused: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the pause flag and return the new state.
    pub fn toggle_pause(&self) -> bool {
        !self.paused.fetch_xor(true, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Sleep for `delay` unless shutdown arrives first. Returns `false` on shutdown.
    pub async fn pause_for(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Gate between two targets.
    ///
    /// Returns `false` when the run should stop. While paused, waits in
    /// [`PAUSE_POLL_INTERVAL`] steps and still reacts to shutdown.
    pub async fn checkpoint(&self) -> bool {
        if self.is_shutdown() {
            return false;
        }
        if !self.is_paused() {
            return true;
        }

        tracing::info!("Paused. Press Enter or send SIGUSR1 to resume");
        while self.is_paused() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
            }
        }
        tracing::info!("Resumed");
        !self.is_shutdown()
    }
}

/// Wire SIGINT / SIGTERM to shutdown and SIGUSR1 to the pause toggle.
///
/// A handler that cannot be registered is logged and skipped.
pub(crate) fn install_signal_handlers(control: &RunControl) {
    let count = Arc::new(AtomicU32::new(0));
    let token = control.shutdown.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!("Could not register SIGTERM handler: {}", e);
                    None
                }
            }
        };

        loop {
            #[cfg(unix)]
            {
                let term = async {
                    match sigterm.as_mut() {
                        Some(s) => {
                            s.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            tracing::warn!("Could not listen for Ctrl+C: {}", e);
                            return;
                        }
                    }
                    _ = term => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Could not listen for Ctrl+C: {}", e);
                    return;
                }
            }

            let prev = count.fetch_add(1, Ordering::SeqCst);
            if prev == 0 {
                tracing::info!("Received shutdown signal, stopping after the current image...");
                tracing::info!("Press Ctrl+C again to force exit");
                token.cancel();
            } else {
                tracing::warn!("Force exit requested");
                std::process::exit(130);
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::user_defined1()) {
            Ok(mut usr1) => {
                let control = control.clone();
                tokio::spawn(async move {
                    while usr1.recv().await.is_some() {
                        log_toggle(control.toggle_pause());
                    }
                });
            }
            Err(e) => tracing::warn!("Could not register SIGUSR1 handler: {}", e),
        }
    }
}

/// Toggle pause on every line typed into an interactive stdin.
///
/// Runs on a plain thread because a blocking stdin read inside the runtime
/// would hold up its shutdown. Does nothing when stdin is not a terminal.
pub(crate) fn spawn_stdin_toggle(control: &RunControl) {
    if !std::io::stdin().is_terminal() {
        tracing::debug!("stdin is not a terminal, pause listener disabled");
        return;
    }
    let control = control.clone();
    let spawned = std::thread::Builder::new()
        .name("pause-listener".into())
        .spawn(move || {
            let mut line = String::new();
            loop {
                line.clear();
                match std::io::stdin().read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => log_toggle(control.toggle_pause()),
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Could not start pause listener: {}", e);
    } else {
        tracing::info!("Press Enter to pause or resume between images");
    }
}

fn log_toggle(paused: bool) {
    if paused {
        tracing::info!("Pause requested, will pause before the next image");
    } else {
        tracing::info!("Resume requested");
    }
}
