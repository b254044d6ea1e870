/// Signal handling for graceful shutdown.
///
/// Handles SIGINT (Ctrl-C), SIGTERM, and STOP file detection.
/// First SIGINT: cancel the current wait, skip remaining runs, then exit.
/// Second SIGINT (within 3s): exit immediately.
/// SIGTERM: same as single SIGINT.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Window in which a second Ctrl-C forces an immediate exit.
const DOUBLE_SIGINT_WINDOW: Duration = Duration::from_secs(3);

/// Cooperative cancellation shared between the signal listener and the engine.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
    stop_file: Option<PathBuf>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also treat the existence of `path` as a shutdown request.
    pub fn with_stop_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stop_file = Some(path.into());
        self
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        if self.requested.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.stop_file {
            if path.exists() {
                tracing::info!(path = %path.display(), "STOP file detected");
                self.request();
                return true;
            }
        }
        false
    }
}

/// Listen for SIGINT/SIGTERM and flip `flag`. Must be called inside a tokio runtime.
pub fn install(flag: ShutdownFlag) {
    let on_ctrl_c = flag.clone();
    tokio::spawn(async move {
        let mut last: Option<tokio::time::Instant> = None;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("failed to listen for Ctrl-C");
                return;
            }
            let now = tokio::time::Instant::now();
            if let Some(prev) = last {
                if now.duration_since(prev) <= DOUBLE_SIGINT_WINDOW {
                    tracing::warn!("second interrupt, exiting immediately");
                    std::process::exit(130);
                }
            }
            last = Some(now);
            tracing::warn!("interrupt received, stopping after the current step (Ctrl-C again to force)");
            on_ctrl_c.request();
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                return;
            }
        };
        while term.recv().await.is_some() {
            tracing::warn!("SIGTERM received, shutting down");
            flag.request();
        }
    });
}
