/// Fallback completion evidence: the report file the external application writes
/// when a run completes.
///
/// A file only counts when its name carries the expected fragment, it is large
/// enough to be a complete report, and it was modified recently enough not to be a
/// leftover from an earlier run.
use crate::config::ArtifactConfig;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// A file that satisfied every corroboration criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMatch {
    pub path: PathBuf,
    pub size: u64,
    pub age: Duration,
}

#[derive(Debug, Clone)]
pub struct FallbackCorroborator {
    dir: PathBuf,
    pattern: String,
}

impl FallbackCorroborator {
    /// `pattern` is a glob evaluated inside `dir` (e.g. `*.html`).
    pub fn new(dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            pattern: pattern.into(),
        }
    }

    pub fn from_config(config: &ArtifactConfig) -> Self {
        Self::new(&config.dir, &config.pattern)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn check(&self, fragment: &str, min_size_bytes: u64, max_age: Duration) -> bool {
        self.find(fragment, min_size_bytes, max_age).is_some()
    }

    /// Return the freshest qualifying file, if any.
    pub fn find(
        &self,
        fragment: &str,
        min_size_bytes: u64,
        max_age: Duration,
    ) -> Option<ArtifactMatch> {
        let escaped_dir = glob::Pattern::escape(&self.dir.to_string_lossy());
        let full = format!("{}/{}", escaped_dir.trim_end_matches('/'), self.pattern);
        let paths = match glob::glob(&full) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, pattern = %full, "invalid artifact glob pattern");
                return None;
            }
        };

        let fragment = fragment.to_lowercase();
        let now = SystemTime::now();
        let mut best: Option<ArtifactMatch> = None;

        for path in paths.flatten() {
            let name_matches = path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase().contains(&fragment))
                .unwrap_or(false);
            if !name_matches {
                continue;
            }

            let meta = match std::fs::metadata(&path) {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, path = %path.display(), "artifact vanished during scan");
                    continue;
                }
            };
            let size = meta.len();
            // Future mtimes (clock skew) count as brand new.
            let age = meta
                .modified()
                .ok()
                .map(|m| now.duration_since(m).unwrap_or(Duration::ZERO));
            let Some(age) = age else { continue };

            if size < min_size_bytes {
                tracing::debug!(path = %path.display(), size, min_size_bytes, "artifact too small, likely partial");
                continue;
            }
            if age > max_age {
                tracing::debug!(
                    path = %path.display(),
                    age_secs = age.as_secs(),
                    "artifact too old, ignoring leftover"
                );
                continue;
            }

            if best.as_ref().map_or(true, |b| age < b.age) {
                best = Some(ArtifactMatch { path, size, age });
            }
        }
        best
    }
}
