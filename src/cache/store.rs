//! Persisted cache tier: one pretty-printed JSON file per key

use super::{CacheEntry, CacheError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const EXTENSION: &str = "json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub(crate) struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub(crate) fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            debug!("Created cache directory {}", dir.display());
        }
        Ok(Self { dir })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, EXTENSION))
    }

    /// Entry for `key`; unreadable or malformed files count as absent
    pub(crate) fn read(&self, key: &str) -> Option<CacheEntry> {
        read_entry(&self.path(key))
    }

    /// Write through a temp file so readers never see a partial entry
    pub(crate) fn write(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let data = serde_json::to_string_pretty(entry)?;
        let temp_path = self.dir.join(format!(
            "{}.{}.{}.{}.tmp",
            key,
            EXTENSION,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        fs::write(&temp_path, data)?;
        if let Err(e) = fs::rename(&temp_path, self.path(key)) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete `key`; false when it was already gone
    pub(crate) fn remove(&self, key: &str) -> Result<bool, CacheError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys of every persisted entry, optionally restricted to `{prefix}_`
    pub(crate) fn keys(&self, prefix: Option<&str>) -> Vec<String> {
        let dir = match fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Failed to list cache directory {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        let mut keys: Vec<String> = dir
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let key = name.strip_suffix(".json")?;
                match prefix {
                    Some(prefix) if !is_under_prefix(key, prefix) => None,
                    _ => Some(key.to_string()),
                }
            })
            .collect();
        keys.sort();
        keys
    }

    /// Persisted entries under `{prefix}_` that parse
    pub(crate) fn scan(&self, prefix: &str) -> Vec<(String, CacheEntry)> {
        self.keys(Some(prefix))
            .into_iter()
            .filter_map(|key| self.read(&key).map(|entry| (key, entry)))
            .collect()
    }
}

pub(crate) fn is_under_prefix(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .map(|rest| rest.starts_with('_'))
        .unwrap_or(false)
}

fn read_entry(path: &Path) -> Option<CacheEntry> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read cache file {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str(&content) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!("Skipping malformed cache file {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(payload: &str) -> CacheEntry {
        CacheEntry {
            fingerprint: "prompt_abc".to_string(),
            timestamp: Utc::now(),
            payload: json!(payload),
            original_params: json!({"prompt": "hi"}),
            cost_estimate: 0.01,
        }
    }

    #[test]
    fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().join("nested")).unwrap();

        store.write("prompt_abc", &entry("answer")).unwrap();
        assert_eq!(store.read("prompt_abc").unwrap().payload, json!("answer"));
        assert!(store.remove("prompt_abc").unwrap());
        assert!(!store.remove("prompt_abc").unwrap());
        assert!(store.read("prompt_abc").is_none());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.write("prompt_abc", &entry("one")).unwrap();
        store.write("prompt_abc", &entry("two")).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["prompt_abc.json"]);
        assert_eq!(store.read("prompt_abc").unwrap().payload, json!("two"));
    }

    #[test]
    fn test_malformed_file_is_absent_and_kept() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("prompt_bad.json"), "{not json").unwrap();

        assert!(store.read("prompt_bad").is_none());
        assert!(store.scan("prompt").is_empty());
        assert!(dir.path().join("prompt_bad.json").exists());
    }

    #[test]
    fn test_keys_filter_by_prefix() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.write("prompt_a", &entry("a")).unwrap();
        store.write("promptx_b", &entry("b")).unwrap();
        store.write("chat_c", &entry("c")).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(store.keys(Some("prompt")), vec!["prompt_a"]);
        assert_eq!(store.keys(None), vec!["chat_c", "prompt_a", "promptx_b"]);
    }
}
