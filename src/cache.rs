//! Content-addressed output directories with mtime-based staleness.
//!
//! Layout: `{data_root}/{project}/{stage}/{cache_key}/`. The key is a BLAKE3
//! digest of the canonical parameter JSON, so identical parameter sets map to
//! the same directory across process restarts. A directory is reused only if
//! it is non-empty and its newest file is younger than the stage's cache
//! duration; stale directories are kept and overwritten, never removed.
//!
//! No locking: two processes resolving the same key will write into the same
//! directory concurrently.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::PipelineError;
use crate::params::Params;

/// Where a stage's invocations live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLocation {
    pub data_root: PathBuf,
    pub project: String,
    pub stage: String,
}

impl CacheLocation {
    pub fn new(
        data_root: impl Into<PathBuf>,
        project: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            data_root: data_root.into(),
            project: project.into(),
            stage: stage.into(),
        }
    }

    pub fn base_path(&self) -> PathBuf {
        self.data_root.join(&self.project).join(&self.stage)
    }
}

/// Resolves parameter sets to output directories for one stage.
#[derive(Debug, Clone)]
pub struct CacheStore {
    location: CacheLocation,
    cache_duration: Duration,
}

impl CacheStore {
    pub fn new(location: CacheLocation, cache_duration: Duration) -> Self {
        Self {
            location,
            cache_duration,
        }
    }

    pub fn location(&self) -> &CacheLocation {
        &self.location
    }

    pub fn cache_duration(&self) -> Duration {
        self.cache_duration
    }

    /// Resolve `params` to its output directory, creating it if missing.
    ///
    /// Returns `(dir, is_valid)`; `is_valid` is true only when the directory
    /// already existed and passes the staleness check.
    pub fn resolve(&self, params: &Params) -> Result<(PathBuf, bool), PipelineError> {
        let base = self.location.base_path();
        fs::create_dir_all(&base).map_err(|e| PipelineError::io(&base, e))?;

        let dir = base.join(cache_key(params));
        let existed = dir.is_dir();
        if !existed {
            fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
            info!(dir = %dir.display(), "created output directory");
            return Ok((dir, false));
        }

        let valid = self.is_valid_at(&dir, SystemTime::now())?;
        if valid {
            info!(dir = %dir.display(), "using valid cache");
        } else {
            info!(dir = %dir.display(), "cache stale or empty; repopulating");
        }
        Ok((dir, valid))
    }

    /// Staleness check against an explicit clock.
    pub fn is_valid_at(&self, dir: &Path, now: SystemTime) -> Result<bool, PipelineError> {
        let Some(newest) = newest_mtime(dir)? else {
            return Ok(false);
        };
        // A file stamped in the future counts as age zero.
        let age = now.duration_since(newest).unwrap_or(Duration::ZERO);
        debug!(
            dir = %dir.display(),
            newest = %DateTime::<Utc>::from(newest).to_rfc3339(),
            age_secs = age.as_secs(),
            max_secs = self.cache_duration.as_secs(),
            "staleness check"
        );
        Ok(age <= self.cache_duration)
    }
}

/// Deterministic directory name for a parameter set.
pub fn cache_key(params: &Params) -> String {
    blake3::hash(params.canonical().as_bytes()).to_hex().to_string()
}

/// Most recent modification time of any file under `dir`, or `None` when the
/// directory holds no files.
pub fn newest_mtime(dir: &Path) -> Result<Option<SystemTime>, PipelineError> {
    let mut newest: Option<SystemTime> = None;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            PipelineError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .map_err(|e| PipelineError::io(entry.path(), e.into()))?
            .modified()
            .map_err(|e| PipelineError::io(entry.path(), e))?;
        if newest.map_or(true, |n| modified > n) {
            newest = Some(modified);
        }
    }
    Ok(newest)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn store(root: &Path) -> CacheStore {
        CacheStore::new(CacheLocation::new(root, "proj", "get_html"), HOUR)
    }

    fn touch(path: &Path, mtime: SystemTime) {
        let f = File::create(path).unwrap();
        f.set_modified(mtime).unwrap();
    }

    #[test]
    fn key_ignores_insertion_order() {
        let a = Params::new().with("execute_js", false).with("input_path", "/x");
        let b = Params::new().with("input_path", "/x").with("execute_js", false);
        assert_eq!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn key_changes_with_any_value() {
        let a = Params::new().with("execute_js", false).with("input_path", "/x");
        let b = Params::new().with("execute_js", true).with("input_path", "/x");
        let c = Params::new().with("execute_js", false).with("input_path", "/y");
        assert_ne!(cache_key(&a), cache_key(&b));
        assert_ne!(cache_key(&a), cache_key(&c));
        assert_eq!(cache_key(&a).len(), 64);
    }

    #[test]
    fn first_resolve_creates_and_is_invalid() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        let (dir, valid) = s.resolve(&Params::new().with("a", 1)).unwrap();
        assert!(!valid);
        assert!(dir.is_dir());
        assert!(dir.starts_with(tmp.path().join("proj").join("get_html")));
    }

    #[test]
    fn empty_existing_dir_is_invalid() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        let params = Params::new().with("a", 1);
        s.resolve(&params).unwrap();
        let (_, valid) = s.resolve(&params).unwrap();
        assert!(!valid);
    }

    #[test]
    fn fresh_file_makes_dir_valid() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        let params = Params::new().with("a", 1);
        let (dir, _) = s.resolve(&params).unwrap();
        std::fs::write(dir.join("all.json"), "[]").unwrap();
        let (again, valid) = s.resolve(&params).unwrap();
        assert_eq!(dir, again);
        assert!(valid);
    }

    #[test]
    fn staleness_boundary() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        let now = SystemTime::now();

        let fresh = tmp.path().join("fresh");
        std::fs::create_dir_all(&fresh).unwrap();
        touch(&fresh.join("all.json"), now - Duration::from_secs(59 * 60));
        assert!(s.is_valid_at(&fresh, now).unwrap());

        let stale = tmp.path().join("stale");
        std::fs::create_dir_all(&stale).unwrap();
        touch(&stale.join("all.json"), now - Duration::from_secs(61 * 60));
        assert!(!s.is_valid_at(&stale, now).unwrap());
    }

    #[test]
    fn newest_file_wins() {
        let tmp = tempdir().unwrap();
        let s = store(tmp.path());
        let now = SystemTime::now();
        let dir = tmp.path().join("mixed");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        touch(&dir.join("payload_0.html"), now - Duration::from_secs(5 * 60 * 60));
        touch(&dir.join("nested").join("x"), now - Duration::from_secs(10 * 60));
        assert!(s.is_valid_at(&dir, now).unwrap());
    }
}
