/// Status file: writes the monitor state as JSON on every phase change.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::detector::{DetectionMethod, Phase};
use crate::observer::{RunEvent, RunObserver};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Monitor-level state; finer than the detector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Waiting,
    Running,
    ConfirmingLowCpu,
    Finished,
    TimedOut,
    Cancelled,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: MonitorState,
    pub input: Option<String>,
    pub method: Option<DetectionMethod>,
    pub detected_pid: Option<u32>,
    pub run_started: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub finished: bool,
    pub last_update: DateTime<Utc>,
}

/// Errors that can occur while writing the status file.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => {
                write!(f, "failed to serialize status: {}", source)
            }
            StatusError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            StatusError::Rename { from, to, source } => write!(
                f,
                "failed to rename {} to {}: {}",
                from.display(),
                to.display(),
                source
            ),
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}

/// Manages the status file on disk.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".runwatch.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

struct Tracked {
    state: MonitorState,
    input: Option<String>,
    method: Option<DetectionMethod>,
    detected_pid: Option<u32>,
    run_started: Option<DateTime<Utc>>,
    duration_secs: Option<f64>,
    finished: bool,
}

/// Observer that mirrors detector events into the status file.
///
/// Heartbeats are not written; only state changes are.
pub struct StatusObserver {
    file: StatusFile,
    tracked: Mutex<Tracked>,
}

impl StatusObserver {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: StatusFile::new(path),
            tracked: Mutex::new(Tracked {
                state: MonitorState::Idle,
                input: None,
                method: None,
                detected_pid: None,
                run_started: None,
                duration_secs: None,
                finished: false,
            }),
        }
    }

    /// Label the runs that follow (e.g. the input file name).
    pub fn set_input(&self, input: Option<String>) {
        if let Ok(mut t) = self.tracked.lock() {
            t.input = input;
        }
    }

    pub fn file(&self) -> &StatusFile {
        &self.file
    }

    fn apply(t: &mut Tracked, event: &RunEvent) -> bool {
        match event {
            RunEvent::Started { .. } => {
                t.state = MonitorState::Waiting;
                t.method = None;
                t.detected_pid = None;
                t.run_started = None;
                t.duration_secs = None;
                t.finished = false;
            }
            RunEvent::RunDetected { method, pid } => {
                t.state = MonitorState::Running;
                t.method = Some(*method);
                t.detected_pid = *pid;
                t.run_started = Some(Utc::now());
            }
            RunEvent::LowCpu { .. } => t.state = MonitorState::ConfirmingLowCpu,
            RunEvent::LowCpuReset { .. } => t.state = MonitorState::Running,
            RunEvent::Finished { method, duration } => {
                t.state = MonitorState::Finished;
                t.method = Some(*method);
                t.duration_secs = duration.map(|d| d.as_secs_f64());
                t.finished = true;
            }
            RunEvent::TimedOut { .. } => {
                t.state = MonitorState::TimedOut;
                t.method = Some(DetectionMethod::Timeout);
            }
            RunEvent::Cancelled { .. } => t.state = MonitorState::Cancelled,
            RunEvent::Heartbeat { .. } | RunEvent::ArtifactFound { .. } => return false,
        }
        true
    }
}

impl RunObserver for StatusObserver {
    fn on_event(&self, event: &RunEvent) {
        let Ok(mut t) = self.tracked.lock() else {
            return;
        };
        if !Self::apply(&mut t, event) {
            return;
        }
        let data = StatusData {
            pid: std::process::id(),
            state: t.state,
            input: t.input.clone(),
            method: t.method,
            detected_pid: t.detected_pid,
            run_started: t.run_started,
            duration_secs: t.duration_secs,
            finished: t.finished,
            last_update: Utc::now(),
        };
        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }
}
