//! Observer interface for detector and wait-loop events.
//!
//! The engine never logs through a global; it reports to whatever observer it was
//! built with. `TracingObserver` is the default, `Observers` fans out to several.

use crate::detector::{DetectionMethod, Phase};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Something worth reporting during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// `start()` recorded a baseline and began waiting.
    Started {
        port: u16,
        pattern: String,
        baseline_processes: usize,
        baseline_established: usize,
    },
    /// Waiting → Running.
    RunDetected {
        method: DetectionMethod,
        pid: Option<u32>,
    },
    /// First sub-threshold sample of a potential quiet period.
    LowCpu { max_cpu: f32 },
    /// A sample at/above the low threshold cancelled the quiet period.
    LowCpuReset { max_cpu: f32 },
    /// Running → Idle with `finished = true`.
    Finished {
        method: DetectionMethod,
        duration: Option<Duration>,
    },
    /// Periodic liveness tick while waiting or running.
    Heartbeat {
        phase: Phase,
        elapsed: Duration,
        processes: usize,
        max_cpu: Option<f32>,
    },
    /// The fallback artifact check found a qualifying report.
    ArtifactFound { path: PathBuf, size: u64 },
    /// The wait deadline passed without completion.
    TimedOut { elapsed: Duration, phase: Phase },
    /// The operator interrupted the wait.
    Cancelled { elapsed: Duration },
}

pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Emits events as structured `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_event(&self, event: &RunEvent) {
        match event {
            RunEvent::Started {
                port,
                pattern,
                baseline_processes,
                baseline_established,
            } => tracing::info!(
                port,
                pattern = %pattern,
                baseline_processes,
                baseline_established,
                "monitor started, waiting for run"
            ),
            RunEvent::RunDetected { method, pid } => {
                tracing::info!(method = %method, pid = ?pid, "run started")
            }
            RunEvent::LowCpu { max_cpu } => {
                tracing::debug!(max_cpu, "cpu below threshold, confirming")
            }
            RunEvent::LowCpuReset { max_cpu } => {
                tracing::debug!(max_cpu, "cpu back above threshold, quiet period reset")
            }
            RunEvent::Finished { method, duration } => tracing::info!(
                method = %method,
                duration_secs = duration.map(|d| d.as_secs_f64()),
                "run finished"
            ),
            RunEvent::Heartbeat {
                phase,
                elapsed,
                processes,
                max_cpu,
            } => tracing::info!(
                phase = %phase,
                elapsed_secs = elapsed.as_secs(),
                processes,
                max_cpu = ?max_cpu,
                "still monitoring"
            ),
            RunEvent::ArtifactFound { path, size } => tracing::info!(
                path = %path.display(),
                size,
                "fallback: report artifact confirms completion"
            ),
            RunEvent::TimedOut { elapsed, phase } => tracing::warn!(
                elapsed_secs = elapsed.as_secs_f64(),
                phase = %phase,
                "timed out waiting for run completion"
            ),
            RunEvent::Cancelled { elapsed } => {
                tracing::warn!(elapsed_secs = elapsed.as_secs_f64(), "wait cancelled")
            }
        }
    }
}

/// Forwards each event to every contained observer in order.
#[derive(Default, Clone)]
pub struct Observers {
    inner: Vec<Arc<dyn RunObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.inner.push(observer);
        self
    }
}

impl RunObserver for Observers {
    fn on_event(&self, event: &RunEvent) {
        for observer in &self.inner {
            observer.on_event(event);
        }
    }
}
