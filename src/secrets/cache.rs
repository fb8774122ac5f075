//! On-disk fallback cache for the last successful secrets snapshot.
//!
//! Single JSON file, written atomically (temp file + rename). The file
//! mtime is the freshness proxy; classification is informational and never
//! gates reads.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SecretsError;

const FRESH_MAX: Duration = Duration::from_secs(12 * 60 * 60);
const WARNING_MAX: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheFreshness {
    Fresh,
    Warning,
    Critical,
}

impl CacheFreshness {
    pub fn classify(age: Duration) -> Self {
        if age < FRESH_MAX {
            CacheFreshness::Fresh
        } else if age <= WARNING_MAX {
            CacheFreshness::Warning
        } else {
            CacheFreshness::Critical
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    secrets: HashMap<String, String>,
    #[serde(rename = "fetchedAt")]
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FallbackCache {
    path: PathBuf,
}

impl FallbackCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<Option<(HashMap<String, String>, DateTime<Utc>)>, SecretsError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| SecretsError::Cache(format!("{}: {e}", self.path.display())))?;
        let file: CacheFile = serde_json::from_str(&contents)
            .map_err(|e| SecretsError::Cache(format!("{}: {e}", self.path.display())))?;
        Ok(Some((file.secrets, file.fetched_at)))
    }

    pub fn store(&self, secrets: &HashMap<String, String>) -> Result<(), SecretsError> {
        let file = CacheFile {
            secrets: secrets.clone(),
            fetched_at: Utc::now(),
        };
        let payload = serde_json::to_string_pretty(&file)
            .map_err(|e| SecretsError::Cache(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SecretsError::Cache(format!("{}: {e}", parent.display())))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)
            .map_err(|e| SecretsError::Cache(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| SecretsError::Cache(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }

    /// Age of the cache file based on its mtime.
    pub fn age(&self) -> Option<Duration> {
        let modified = fs::metadata(&self.path).ok()?.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }

    pub fn freshness(&self) -> Option<CacheFreshness> {
        self.age().map(CacheFreshness::classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FallbackCache::new(dir.path().join("fallback.json"));

        let mut secrets = HashMap::new();
        secrets.insert("maxConcurrent".to_string(), "5".to_string());
        cache.store(&secrets).unwrap();

        let (loaded, fetched_at) = cache.load().unwrap().unwrap();
        assert_eq!(loaded, secrets);
        assert!(fetched_at <= Utc::now());
        // No leftover temp file after the atomic rename.
        assert!(!dir.path().join("fallback.json.tmp").exists());
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FallbackCache::new(dir.path().join("absent.json"));
        assert!(cache.load().unwrap().is_none());
        assert!(cache.age().is_none());
    }

    #[test]
    fn corrupt_cache_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.json");
        fs::write(&path, "not json").unwrap();
        let cache = FallbackCache::new(path);
        assert!(cache.load().is_err());
    }

    #[test]
    fn freshness_thresholds() {
        assert_eq!(
            CacheFreshness::classify(Duration::from_secs(60)),
            CacheFreshness::Fresh
        );
        assert_eq!(
            CacheFreshness::classify(Duration::from_secs(13 * 60 * 60)),
            CacheFreshness::Warning
        );
        assert_eq!(
            CacheFreshness::classify(Duration::from_secs(25 * 60 * 60)),
            CacheFreshness::Critical
        );
    }
}
