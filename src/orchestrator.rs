//! Drives one or more runs end to end: baseline, start, wait, export.
//!
//! A run that times out is not an error. Its (possibly incomplete) result is
//! still exported and the batch moves on. Only an operator cancellation stops
//! the batch.

use crate::config::{ArtifactConfig, WatchConfig};
use crate::detector::{DetectionMethod, DetectorSettings, RunDetector};
use crate::hooks::RunDriver;
use crate::observer::RunObserver;
use crate::signal_source::SignalSource;
use crate::signals::ShutdownFlag;
use crate::status::StatusObserver;
use crate::wait::{ArtifactCheck, WaitController, WaitSettings};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One unit of work handed to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunInput {
    pub label: String,
    pub path: Option<PathBuf>,
    pub stem: String,
    /// Expected substring of the artifact name.
    pub fragment: String,
}

impl RunInput {
    /// Derive a run from an input file; `{stem}` in the template is the file stem.
    pub fn from_path(path: &Path, fragment_template: &str) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let label = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            fragment: expand_fragment(fragment_template, &stem),
            label,
            path: Some(path.to_path_buf()),
            stem,
        }
    }

    /// A run without an input file (started by hand or by an external tool).
    pub fn labelled(label: &str, fragment_template: &str) -> Self {
        Self {
            label: label.to_string(),
            path: None,
            stem: label.to_string(),
            fragment: expand_fragment(fragment_template, label),
        }
    }

    /// Placeholder values for hook commands.
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        let input = self
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| self.label.clone());
        vec![
            ("input", input),
            ("stem", self.stem.clone()),
            ("fragment", self.fragment.clone()),
        ]
    }
}

fn expand_fragment(template: &str, stem: &str) -> String {
    template.replace("{stem}", stem)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Finished,
    TimedOut,
    Cancelled,
    StartFailed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Finished => "finished",
            RunStatus::TimedOut => "timed out",
            RunStatus::Cancelled => "cancelled",
            RunStatus::StartFailed => "start failed",
        };
        f.write_str(s)
    }
}

/// Summary of one run, printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub input: String,
    pub status: RunStatus,
    pub method: Option<DetectionMethod>,
    pub detected_pid: Option<u32>,
    pub duration_secs: Option<f64>,
    pub elapsed_secs: f64,
    pub start_error: Option<String>,
    pub export_error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn finished(&self) -> bool {
        self.status == RunStatus::Finished
    }
}

pub struct Orchestrator<S, D> {
    detector: RunDetector,
    source: S,
    driver: D,
    controller: WaitController,
    timeout: Duration,
    artifact: Option<ArtifactConfig>,
    shutdown: ShutdownFlag,
    status: Option<Arc<StatusObserver>>,
}

impl<S: SignalSource, D: RunDriver> Orchestrator<S, D> {
    pub fn new(
        config: &WatchConfig,
        source: S,
        driver: D,
        observer: Arc<dyn RunObserver>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            detector: RunDetector::new(DetectorSettings::from(&config.detector), observer.clone()),
            source,
            driver,
            controller: WaitController::new(WaitSettings::from(&config.wait), observer),
            timeout: config.wait.timeout(),
            artifact: config.artifact.enabled.then(|| config.artifact.clone()),
            shutdown,
            status: None,
        }
    }

    /// Label status-file updates with the current input.
    pub fn with_status(mut self, status: Arc<StatusObserver>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn run_one(&mut self, run: &RunInput) -> RunReport {
        if let Some(status) = &self.status {
            status.set_input(Some(run.label.clone()));
        }
        tracing::info!(input = %run.label, fragment = %run.fragment, "starting run");

        self.detector.reset();
        let settings = self.detector.settings();
        let baseline = self.source.snapshot(settings.port, &settings.process_pattern);
        self.detector.start(&baseline);

        if let Err(e) = self.driver.start_computation(run) {
            tracing::error!(input = %run.label, error = %e, "failed to start computation, skipping");
            let elapsed = self
                .detector
                .started_at()
                .map(|t| t.elapsed())
                .unwrap_or_default();
            return RunReport {
                input: run.label.clone(),
                status: RunStatus::StartFailed,
                method: None,
                detected_pid: None,
                duration_secs: None,
                elapsed_secs: elapsed.as_secs_f64(),
                start_error: Some(e.to_string()),
                export_error: None,
                finished_at: Utc::now(),
            };
        }

        let check = self
            .artifact
            .as_ref()
            .map(|cfg| ArtifactCheck::from_config(cfg, run.fragment.clone()));
        let outcome = self.controller.wait(
            &mut self.detector,
            &mut self.source,
            self.timeout,
            check.as_ref(),
            &self.shutdown,
        );

        let status = if outcome.finished {
            RunStatus::Finished
        } else if outcome.cancelled {
            RunStatus::Cancelled
        } else {
            tracing::warn!(
                input = %run.label,
                timeout_secs = self.timeout.as_secs(),
                "run not confirmed finished, exported result may be incomplete"
            );
            RunStatus::TimedOut
        };

        let export_error = if outcome.cancelled {
            tracing::info!(input = %run.label, "cancelled, skipping export");
            None
        } else {
            match self.driver.export_result(run, &outcome) {
                Ok(()) => None,
                Err(e) => {
                    tracing::error!(input = %run.label, error = %e, "export failed");
                    Some(e.to_string())
                }
            }
        };

        RunReport {
            input: run.label.clone(),
            status,
            method: outcome.method,
            detected_pid: self.detector.detected_pid(),
            duration_secs: outcome.duration.map(|d| d.as_secs_f64()),
            elapsed_secs: outcome.elapsed.as_secs_f64(),
            start_error: None,
            export_error,
            finished_at: Utc::now(),
        }
    }

    /// Run every input in order, stopping early on cancellation.
    pub fn run_batch(&mut self, runs: &[RunInput]) -> Vec<RunReport> {
        let mut reports = Vec::with_capacity(runs.len());
        for (i, run) in runs.iter().enumerate() {
            if self.shutdown.is_requested() {
                tracing::warn!(remaining = runs.len() - i, "shutdown requested, skipping remaining runs");
                break;
            }
            tracing::info!(index = i + 1, total = runs.len(), input = %run.label, "run");
            reports.push(self.run_one(run));
        }
        if let Some(status) = &self.status {
            status.set_input(None);
        }
        reports
    }
}
