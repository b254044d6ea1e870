use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from runwatch.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct WatchConfig {
    pub detector: DetectorConfig,
    pub wait: WaitConfig,
    pub artifact: ArtifactConfig,
    pub hooks: HooksConfig,
    pub shutdown: ShutdownConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub port: u16,
    pub process_pattern: String,
    pub high_cpu_percent: f32,
    pub low_cpu_percent: f32,
    pub low_cpu_confirm_secs: f64,
    pub cpu_sample_ms: u64,
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WaitConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub fallback_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub pattern: String,
    /// Template for the expected file-name fragment; `{stem}` is the run input stem.
    pub fragment: String,
    pub min_size_bytes: u64,
    pub max_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HooksConfig {
    pub start: Vec<String>,
    pub export: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub stop_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct StatusConfig {
    pub file: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            process_pattern: "metatester64".to_string(),
            high_cpu_percent: 20.0,
            low_cpu_percent: 5.0,
            low_cpu_confirm_secs: 2.0,
            cpu_sample_ms: 50,
            heartbeat_secs: 10,
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 240,
            poll_interval_ms: 500,
            fallback_grace_secs: 25,
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("reports"),
            pattern: "*.html".to_string(),
            fragment: "{stem}".to_string(),
            min_size_bytes: 5_000,
            max_age_secs: 120,
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            start: Vec::new(),
            export: Vec::new(),
            timeout_secs: 120,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_file: PathBuf::from("STOP"),
        }
    }
}

impl DetectorConfig {
    pub fn low_cpu_confirm(&self) -> Duration {
        Duration::try_from_secs_f64(self.low_cpu_confirm_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn cpu_sample_window(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl WaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fallback_grace(&self) -> Duration {
        Duration::from_secs(self.fallback_grace_secs)
    }
}

impl ArtifactConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value is out of its allowed range.
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value for {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

/// Load and validate the config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<WatchConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(WatchConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let config: WatchConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}

impl WatchConfig {
    /// Reject values the detector cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        if d.low_cpu_percent.is_nan() || d.low_cpu_percent < 0.0 {
            return Err(invalid("detector.low_cpu_percent", "must be >= 0"));
        }
        if d.high_cpu_percent.is_nan() || d.high_cpu_percent < 0.0 {
            return Err(invalid("detector.high_cpu_percent", "must be >= 0"));
        }
        if d.low_cpu_percent > d.high_cpu_percent {
            return Err(invalid(
                "detector.low_cpu_percent",
                format!(
                    "{} exceeds high_cpu_percent {}",
                    d.low_cpu_percent, d.high_cpu_percent
                ),
            ));
        }
        if !d.low_cpu_confirm_secs.is_finite() || d.low_cpu_confirm_secs < 0.0 {
            return Err(invalid("detector.low_cpu_confirm_secs", "must be >= 0"));
        }
        if Duration::try_from_secs_f64(d.low_cpu_confirm_secs).is_err() {
            return Err(invalid(
                "detector.low_cpu_confirm_secs",
                format!("{} seconds is out of range", d.low_cpu_confirm_secs),
            ));
        }
        if d.cpu_sample_ms == 0 {
            return Err(invalid("detector.cpu_sample_ms", "must be > 0"));
        }
        if d.process_pattern.trim().is_empty() {
            return Err(invalid("detector.process_pattern", "must not be empty"));
        }
        if self.wait.poll_interval_ms == 0 {
            return Err(invalid("wait.poll_interval_ms", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
