//! Bounded polling loop around the run detector.
//!
//! Each iteration takes a fresh snapshot, feeds it to the detector and sleeps a
//! fixed interval. The loop ends when the run is confirmed finished, when the
//! fallback artifact corroborates completion, when the deadline passes, or when
//! the operator cancels. Only the first two count as `finished`; none of them is
//! an error.

use crate::artifact::FallbackCorroborator;
use crate::config::{ArtifactConfig, WaitConfig};
use crate::detector::{DetectionMethod, Phase, RunDetector};
use crate::observer::{RunEvent, RunObserver};
use crate::signal_source::SignalSource;
use crate::signals::ShutdownFlag;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How the fallback artifact check is parameterized for one run.
#[derive(Debug, Clone)]
pub struct ArtifactCheck {
    pub corroborator: FallbackCorroborator,
    pub fragment: String,
    pub min_size_bytes: u64,
    pub max_age: Duration,
}

impl ArtifactCheck {
    pub fn from_config(config: &ArtifactConfig, fragment: impl Into<String>) -> Self {
        Self {
            corroborator: FallbackCorroborator::from_config(config),
            fragment: fragment.into(),
            min_size_bytes: config.min_size_bytes,
            max_age: config.max_age(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WaitSettings {
    pub poll_interval: Duration,
    /// How long the detector may sit in `Waiting` before the artifact is consulted.
    pub fallback_grace: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        WaitSettings::from(&WaitConfig::default())
    }
}

impl From<&WaitConfig> for WaitSettings {
    fn from(c: &WaitConfig) -> Self {
        Self {
            poll_interval: c.poll_interval(),
            fallback_grace: c.fallback_grace(),
        }
    }
}

/// What the wait loop concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    pub finished: bool,
    pub cancelled: bool,
    pub method: Option<DetectionMethod>,
    pub duration: Option<Duration>,
    pub elapsed: Duration,
}

pub struct WaitController {
    settings: WaitSettings,
    observer: Arc<dyn RunObserver>,
}

impl WaitController {
    pub fn new(settings: WaitSettings, observer: Arc<dyn RunObserver>) -> Self {
        Self { settings, observer }
    }

    /// Poll until the run finishes, `timeout` elapses (counted from
    /// `detector.start()`), or `shutdown` is requested.
    pub fn wait(
        &self,
        detector: &mut RunDetector,
        source: &mut dyn SignalSource,
        timeout: Duration,
        artifact: Option<&ArtifactCheck>,
        shutdown: &ShutdownFlag,
    ) -> WaitOutcome {
        let origin = detector.started_at().unwrap_or_else(Instant::now);
        let port = detector.settings().port;
        let pattern = detector.settings().process_pattern.clone();

        loop {
            if shutdown.is_requested() {
                let elapsed = origin.elapsed();
                self.observer.on_event(&RunEvent::Cancelled { elapsed });
                return WaitOutcome {
                    finished: false,
                    cancelled: true,
                    method: detector.detection_method(),
                    duration: None,
                    elapsed,
                };
            }

            let snapshot = source.snapshot(port, &pattern);
            let result = detector.poll(&snapshot);
            if result.finished {
                return self.outcome(detector, origin);
            }

            let elapsed = origin.elapsed();
            if let Some(check) = artifact {
                if detector.phase() == Phase::Waiting && elapsed >= self.settings.fallback_grace {
                    if let Some(found) = check.corroborator.find(
                        &check.fragment,
                        check.min_size_bytes,
                        check.max_age,
                    ) {
                        self.observer.on_event(&RunEvent::ArtifactFound {
                            path: found.path,
                            size: found.size,
                        });
                        detector.confirm_external(DetectionMethod::FallbackArtifact);
                        return self.outcome(detector, origin);
                    }
                }
            }

            if elapsed >= timeout {
                let phase = detector.phase();
                detector.expire();
                self.observer.on_event(&RunEvent::TimedOut { elapsed, phase });
                return WaitOutcome {
                    finished: false,
                    cancelled: false,
                    method: Some(DetectionMethod::Timeout),
                    duration: None,
                    elapsed,
                };
            }

            let remaining = timeout.saturating_sub(elapsed);
            std::thread::sleep(self.settings.poll_interval.min(remaining));
        }
    }

    fn outcome(&self, detector: &RunDetector, origin: Instant) -> WaitOutcome {
        WaitOutcome {
            finished: true,
            cancelled: false,
            method: detector.detection_method(),
            duration: detector.duration(),
            elapsed: origin.elapsed(),
        }
    }
}
