//! Response cache for model calls
//!
//! Results are keyed by a fingerprint of the normalized call parameters and
//! kept in two tiers: an in-process map and a directory of JSON files. For
//! prompt-shaped prefixes an exact miss falls back to a fuzzy scan that
//! accepts calls whose wording overlaps closely enough.
//!
//! Cache I/O never fails a call: read errors are misses, write errors are
//! logged and the memory tier keeps the value for the rest of the process.

mod fingerprint;
mod similarity;
mod store;
mod tracker;

pub use fingerprint::{fingerprint, normalize, normalize_text};
pub use similarity::SimilarityRule;
pub use tracker::CacheStats;

use crate::config::CacheSettings;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;
use store::{is_under_prefix, DiskStore};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One cached result, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub original_params: Value,
    #[serde(default)]
    pub cost_estimate: f64,
}

impl CacheEntry {
    /// Time since the entry was stored; zero for timestamps in the future
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    fn is_fresh(&self, max_age: Option<Duration>, now: DateTime<Utc>) -> bool {
        max_age.map_or(true, |max_age| self.age(now) <= max_age)
    }
}

/// Two-tier response cache with exact and fuzzy lookup
#[derive(Debug)]
pub struct ResponseCache {
    memory: RwLock<HashMap<String, CacheEntry>>,
    disk: Option<DiskStore>,
    stats: Mutex<CacheStats>,
    fuzzy_prefixes: Vec<String>,
    similarity: SimilarityRule,
}

impl ResponseCache {
    /// Cache persisted under the configured (or default) directory
    pub fn new(settings: &CacheSettings) -> Result<Self, CacheError> {
        let disk = DiskStore::open(settings.resolved_directory())?;
        info!("Response cache at {}", disk.dir().display());
        Ok(Self::build(settings, Some(disk)))
    }

    /// Cache persisted under `dir`, other settings at their defaults
    pub fn with_directory(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let settings = CacheSettings {
            directory: Some(dir.into()),
            ..CacheSettings::default()
        };
        Self::new(&settings)
    }

    /// Cache without a persisted tier
    pub fn in_memory(settings: &CacheSettings) -> Self {
        Self::build(settings, None)
    }

    fn build(settings: &CacheSettings, disk: Option<DiskStore>) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            disk,
            stats: Mutex::new(CacheStats::default()),
            fuzzy_prefixes: settings.fuzzy_prefixes.clone(),
            similarity: SimilarityRule::from(settings),
        }
    }

    /// Directory of the persisted tier, if any
    pub fn directory(&self) -> Option<&Path> {
        self.disk.as_ref().map(DiskStore::dir)
    }

    fn stats_mut(&self) -> MutexGuard<'_, CacheStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn memory_get(&self, key: &str) -> Option<CacheEntry> {
        let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
        memory.get(key).cloned()
    }

    fn memory_put(&self, key: String, entry: CacheEntry) {
        let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
        memory.insert(key, entry);
    }

    fn is_fuzzy_eligible(&self, prefix: &str, params: &Value) -> bool {
        self.fuzzy_prefixes.iter().any(|p| p == prefix)
            && (params.get("prompt").is_some() || params.get("messages").is_some())
    }

    /// Cached result for `params`, or `None`.
    ///
    /// Checks memory then disk under the exact fingerprint. For fuzzy
    /// prefixes an exact miss scans both tiers for a similar call.
    pub fn lookup(&self, prefix: &str, params: &Value, max_age: Option<Duration>) -> Option<Value> {
        let key = fingerprint(prefix, params);
        let now = Utc::now();

        if let Some(entry) = self.memory_get(&key).filter(|e| e.is_fresh(max_age, now)) {
            self.stats_mut().record_hit(false);
            debug!("Cache hit (memory): {}", key);
            return Some(entry.payload);
        }

        if let Some(disk) = &self.disk {
            if let Some(entry) = disk.read(&key).filter(|e| e.is_fresh(max_age, now)) {
                let payload = entry.payload.clone();
                self.memory_put(key.clone(), entry);
                self.stats_mut().record_hit(false);
                debug!("Cache hit (disk): {}", key);
                return Some(payload);
            }
        }

        if self.is_fuzzy_eligible(prefix, params) {
            if let Some(payload) = self.fuzzy_lookup(prefix, params, max_age, now) {
                self.stats_mut().record_hit(true);
                return Some(payload);
            }
        }

        self.stats_mut().record_miss();
        debug!("Cache miss: {}", key);
        None
    }

    fn fuzzy_lookup(
        &self,
        prefix: &str,
        params: &Value,
        max_age: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<Value> {
        {
            let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
            let found = memory.iter().find(|(key, entry)| {
                is_under_prefix(key, prefix)
                    && entry.is_fresh(max_age, now)
                    && self.similarity.params_similar(params, &entry.original_params)
            });
            if let Some((key, entry)) = found {
                info!("Cache hit (fuzzy, memory): {}", key);
                return Some(entry.payload.clone());
            }
        }

        let disk = self.disk.as_ref()?;
        let (key, entry) = disk.scan(prefix).into_iter().find(|(_, entry)| {
            entry.is_fresh(max_age, now)
                && self.similarity.params_similar(params, &entry.original_params)
        })?;

        info!("Cache hit (fuzzy, disk): {}", key);
        let payload = entry.payload.clone();
        self.memory_put(key, entry);
        Some(payload)
    }

    /// Store `value` under the exact fingerprint of `params` in both tiers.
    ///
    /// `cost_estimate` is added to the running estimated savings.
    pub fn store(&self, prefix: &str, params: &Value, value: Value, cost_estimate: f64) {
        let key = fingerprint(prefix, params);
        let entry = CacheEntry {
            fingerprint: key.clone(),
            timestamp: Utc::now(),
            payload: value,
            original_params: params.clone(),
            cost_estimate,
        };
        self.insert_entry(key, entry);
        self.stats_mut().record_store(cost_estimate);
    }

    /// Write a prepared entry to both tiers
    pub(crate) fn insert_entry(&self, key: String, entry: CacheEntry) {
        if let Some(disk) = &self.disk {
            match disk.write(&key, &entry) {
                Ok(()) => debug!("Cached {}", key),
                Err(e) => error!("Failed to persist cache entry {}: {}", key, e),
            }
        }
        self.memory_put(key, entry);
    }

    /// Return the cached result for `params` or compute, store and return it.
    ///
    /// `call` receives the parameters by value. Errors from `call` are
    /// returned unchanged and nothing is stored. A cached value that no
    /// longer deserializes into `T` is treated as a miss.
    pub async fn call_with_cache<T, E, F, Fut>(
        &self,
        prefix: &str,
        params: Value,
        max_age: Option<Duration>,
        cost_estimate: f64,
        call: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.lookup(prefix, &params, max_age) {
            match serde_json::from_value(cached) {
                Ok(value) => return Ok(value),
                Err(e) => warn!("Cached value for prefix {} no longer decodes: {}", prefix, e),
            }
        }

        let result = call(params.clone()).await?;
        match serde_json::to_value(&result) {
            Ok(value) => self.store(prefix, &params, value, cost_estimate),
            Err(e) => warn!("Result for prefix {} is not cacheable: {}", prefix, e),
        }
        Ok(result)
    }

    /// Remove entries older than `max_age` from both tiers.
    ///
    /// Returns the number of distinct keys removed. Malformed files are
    /// left in place.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut removed: HashSet<String> = HashSet::new();

        {
            let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
            memory.retain(|key, entry| {
                let keep = entry.age(now) <= max_age;
                if !keep {
                    removed.insert(key.clone());
                }
                keep
            });
        }

        if let Some(disk) = &self.disk {
            for key in disk.keys(None) {
                let Some(entry) = disk.read(&key) else {
                    continue;
                };
                if entry.age(now) <= max_age {
                    continue;
                }
                match disk.remove(&key) {
                    Ok(_) => {
                        removed.insert(key);
                    }
                    Err(e) => warn!("Failed to remove expired cache file {}: {}", key, e),
                }
            }
        }

        info!("Evicted {} expired cache entries", removed.len());
        removed.len()
    }

    /// Drop every entry from both tiers, returning how many keys were removed
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut removed: HashSet<String> = {
            let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
            memory.drain().map(|(key, _)| key).collect()
        };

        if let Some(disk) = &self.disk {
            for key in disk.keys(None) {
                disk.remove(&key)?;
                removed.insert(key);
            }
        }

        info!("Cleared {} cache entries", removed.len());
        Ok(removed.len())
    }

    /// Distinct keys across both tiers
    pub fn entry_count(&self) -> usize {
        let mut keys: HashSet<String> = {
            let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
            memory.keys().cloned().collect()
        };
        if let Some(disk) = &self.disk {
            keys.extend(disk.keys(None));
        }
        keys.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats_mut().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const LONG: &str = "Write a detailed overview of the history of the printing press \
                        and its influence on literacy across early modern Europe";

    fn disk_cache() -> (TempDir, ResponseCache) {
        let dir = TempDir::new().unwrap();
        let cache = ResponseCache::with_directory(dir.path()).unwrap();
        (dir, cache)
    }

    fn backdated(cache: &ResponseCache, prefix: &str, params: Value, secs: i64) -> String {
        let key = fingerprint(prefix, &params);
        cache.insert_entry(
            key.clone(),
            CacheEntry {
                fingerprint: key.clone(),
                timestamp: Utc::now() - chrono::Duration::seconds(secs),
                payload: json!("old"),
                original_params: params,
                cost_estimate: 0.0,
            },
        );
        key
    }

    #[test]
    fn test_normalized_params_hit() {
        let (_dir, cache) = disk_cache();
        let stored = json!({"prompt": "Summarize quantum computing advances in 2024 for a general audience"});
        let later = json!({"prompt": "summarize   quantum computing   advances in 2024 for a general audience"});

        cache.store("prompt", &stored, json!("summary"), 0.02);
        assert_eq!(cache.lookup("prompt", &later, None), Some(json!("summary")));

        let stats = cache.stats();
        assert_eq!(stats.saved_calls, 1);
        assert_eq!(stats.fuzzy_hits, 0);
        assert!((stats.estimated_savings - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_disk_tier_survives_restart() {
        let dir = TempDir::new().unwrap();
        let params = json!({"query": "rust async"});
        {
            let cache = ResponseCache::with_directory(dir.path()).unwrap();
            cache.store("search", &params, json!(["result"]), 0.0);
        }

        let cache = ResponseCache::with_directory(dir.path()).unwrap();
        assert_eq!(cache.lookup("search", &params, None), Some(json!(["result"])));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_fuzzy_hit_for_prompt_prefixes_only() {
        let (_dir, cache) = disk_cache();
        let reworded = LONG.replace("detailed", "thorough");

        cache.store("prompt", &json!({"prompt": LONG}), json!("essay"), 0.0);
        cache.store("search", &json!({"prompt": LONG}), json!("links"), 0.0);

        assert_eq!(
            cache.lookup("prompt", &json!({"prompt": reworded}), None),
            Some(json!("essay"))
        );
        assert_eq!(cache.lookup("search", &json!({"prompt": reworded}), None), None);
        assert_eq!(cache.stats().fuzzy_hits, 1);
    }

    #[test]
    fn test_fuzzy_hit_from_disk_backfills_own_key() {
        let dir = TempDir::new().unwrap();
        let original = json!({"prompt": LONG});
        {
            let cache = ResponseCache::with_directory(dir.path()).unwrap();
            cache.store("prompt", &original, json!("essay"), 0.0);
        }

        let cache = ResponseCache::with_directory(dir.path()).unwrap();
        let reworded = json!({"prompt": LONG.replace("detailed", "thorough")});
        assert_eq!(cache.lookup("prompt", &reworded, None), Some(json!("essay")));

        let memory = cache.memory.read().unwrap();
        assert!(memory.contains_key(&fingerprint("prompt", &original)));
        assert!(!memory.contains_key(&fingerprint("prompt", &reworded)));
    }

    #[test]
    fn test_params_without_text_are_exact_only() {
        let cache = ResponseCache::in_memory(&CacheSettings::default());
        cache.store("chat", &json!({"query": "a"}), json!(1), 0.0);
        assert_eq!(cache.lookup("chat", &json!({"query": "b"}), None), None);
        assert_eq!(cache.lookup("chat", &json!({"query": "a"}), None), Some(json!(1)));
    }

    #[test]
    fn test_max_age_filters_lookups() {
        let cache = ResponseCache::in_memory(&CacheSettings::default());
        let params = json!({"prompt": "status"});
        backdated(&cache, "prompt", params.clone(), 120);

        assert_eq!(cache.lookup("prompt", &params, Some(Duration::from_secs(60))), None);
        assert_eq!(
            cache.lookup("prompt", &params, Some(Duration::from_secs(180))),
            Some(json!("old"))
        );
        assert_eq!(cache.lookup("prompt", &params, None), Some(json!("old")));
    }

    #[test]
    fn test_eviction_boundaries() {
        let (_dir, cache) = disk_cache();
        let max_age = 3600;
        let young = backdated(&cache, "prompt", json!({"prompt": "young"}), max_age - 1);
        let old = backdated(&cache, "prompt", json!({"prompt": "old"}), max_age + 1);

        let removed = cache.evict_older_than(Duration::from_secs(max_age as u64));
        assert_eq!(removed, 1);

        let disk = cache.disk.as_ref().unwrap();
        assert!(disk.read(&young).is_some());
        assert!(disk.read(&old).is_none());
        assert!(cache.memory_get(&young).is_some());
        assert!(cache.memory_get(&old).is_none());
    }

    #[test]
    fn test_malformed_file_is_a_miss() {
        let (dir, cache) = disk_cache();
        let params = json!({"prompt": "broken"});
        let key = fingerprint("prompt", &params);
        std::fs::write(dir.path().join(format!("{}.json", key)), "garbage").unwrap();

        assert_eq!(cache.lookup("prompt", &params, None), None);
        assert_eq!(cache.evict_older_than(Duration::ZERO), 0);
        assert!(dir.path().join(format!("{}.json", key)).exists());
    }

    #[test]
    fn test_clear_and_entry_count() {
        let (_dir, cache) = disk_cache();
        cache.store("prompt", &json!({"prompt": "a"}), json!(1), 0.0);
        cache.store("chat", &json!({"prompt": "b"}), json!(2), 0.0);
        assert_eq!(cache.entry_count(), 2);

        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_call_with_cache_invokes_once() {
        let (_dir, cache) = disk_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let params = json!({"prompt": "What is the capital of France?"});

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let answer: Result<String, std::io::Error> = cache
                .call_with_cache("prompt", params.clone(), None, 0.01, |p| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("answer to {}", p["prompt"].as_str().unwrap_or_default()))
                })
                .await;
            assert_eq!(answer.unwrap(), "answer to What is the capital of France?");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_call_with_cache_does_not_store_errors() {
        let cache = ResponseCache::in_memory(&CacheSettings::default());
        let params = json!({"prompt": "fails"});

        let result: Result<String, String> = cache
            .call_with_cache("prompt", params.clone(), None, 0.0, |_| async {
                Err("boom".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_concurrent_stores_do_not_corrupt() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ResponseCache::with_directory(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..10 {
                        let params = json!({"prompt": format!("task {} {}", i, j)});
                        cache.store("prompt", &params, json!(j), 0.0);
                        if j % 3 == 0 {
                            cache.evict_older_than(Duration::from_secs(3600));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.entry_count(), 80);
        let reopened = ResponseCache::with_directory(dir.path()).unwrap();
        assert_eq!(
            reopened.lookup("prompt", &json!({"prompt": "task 3 7"}), None),
            Some(json!(7))
        );
    }
}
