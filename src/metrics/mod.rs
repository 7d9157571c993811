//! Usage records and cost accounting for model calls

use crate::config::ModelSettings;
use crate::selector::QuotaSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

/// One completed model call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsageRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost: f64,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
}

impl ModelUsageRecord {
    pub fn token_count(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Static per-model prices
#[derive(Debug, Clone)]
pub struct CostTable {
    cost_per_1k: BTreeMap<String, f64>,
    default_cost: f64,
}

impl CostTable {
    pub fn new(models: &ModelSettings) -> Self {
        Self {
            cost_per_1k: models.cost_per_1k.clone(),
            default_cost: models.default_cost,
        }
    }

    pub fn knows(&self, model: &str) -> bool {
        self.cost_per_1k.contains_key(model)
    }

    /// USD for a call; unknown models cost the flat default
    pub fn estimate_cost(&self, model: &str, input_tokens: usize, output_tokens: usize) -> f64 {
        match self.cost_per_1k.get(model) {
            Some(per_1k) => (input_tokens + output_tokens) as f64 / 1000.0 * per_1k,
            None => {
                warn!(
                    "No price for {}, using the default estimate of ${}",
                    model, self.default_cost
                );
                self.default_cost
            }
        }
    }
}

impl Default for CostTable {
    fn default() -> Self {
        Self::new(&ModelSettings::default())
    }
}

/// Aggregate view over the usage log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub total_calls: usize,
    pub total_cost: f64,
    pub total_tokens: usize,
    pub calls_per_model: BTreeMap<String, usize>,
    pub cost_per_model: BTreeMap<String, f64>,
    pub quota_used: BTreeMap<String, u32>,
    pub quota_limits: BTreeMap<String, u32>,
}

impl UsageStats {
    /// Mean cost of one call, 0.0 before any call
    pub fn average_call_cost(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_cost / self.total_calls as f64
    }

    fn from_records(records: &[ModelUsageRecord], quotas: QuotaSnapshot) -> Self {
        let mut stats = UsageStats {
            quota_used: quotas.quota_used,
            quota_limits: quotas.quota_limits,
            ..Default::default()
        };

        for record in records {
            stats.total_calls += 1;
            stats.total_cost += record.cost;
            stats.total_tokens += record.token_count();
            *stats.calls_per_model.entry(record.model.clone()).or_insert(0) += 1;
            *stats.cost_per_model.entry(record.model.clone()).or_insert(0.0) += record.cost;
        }

        stats
    }
}

impl std::fmt::Display for UsageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Model Usage ===")?;
        writeln!(f, "Total calls: {}", self.total_calls)?;
        writeln!(f, "Total tokens: {}", self.total_tokens)?;
        writeln!(f, "Total cost: ${:.4}", self.total_cost)?;
        for (model, calls) in &self.calls_per_model {
            let cost = self.cost_per_model.get(model).copied().unwrap_or_default();
            writeln!(f, "  {}: {} calls, ${:.4}", model, calls, cost)?;
        }
        Ok(())
    }
}

/// Thread-safe append-only usage log
#[derive(Debug, Clone, Default)]
pub struct UsageLog {
    inner: Arc<Mutex<Vec<ModelUsageRecord>>>,
}

impl UsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ModelUsageRecord>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, record: ModelUsageRecord) {
        self.lock().push(record);
    }

    /// Copy of every record so far
    pub fn records(&self) -> Vec<ModelUsageRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregates over the log, with quota usage alongside
    pub fn stats(&self, quotas: QuotaSnapshot) -> UsageStats {
        UsageStats::from_records(&self.lock(), quotas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str, tokens: usize, cost: f64) -> ModelUsageRecord {
        ModelUsageRecord {
            timestamp: Utc::now(),
            model: model.to_string(),
            input_tokens: tokens,
            output_tokens: 0,
            cost,
            latency: Duration::from_millis(120),
        }
    }

    #[test]
    fn test_estimate_cost() {
        let table = CostTable::default();
        let cost = table.estimate_cost("gpt-4", 1000, 500);
        assert!((cost - 0.09).abs() < 1e-12);
        assert!((table.estimate_cost("mystery-model", 1_000_000, 0) - 0.01).abs() < 1e-12);
        assert!(!table.knows("mystery-model"));
    }

    #[test]
    fn test_usage_stats_aggregate() {
        let log = UsageLog::new();
        log.append(record("gpt-4", 100, 0.006));
        log.append(record("gpt-4", 50, 0.003));
        log.append(record("deepseek-chat", 1000, 0.0005));

        let mut quotas = QuotaSnapshot::default();
        quotas.quota_limits.insert("gpt-4".to_string(), 10);
        quotas.quota_used.insert("gpt-4".to_string(), 2);

        let stats = log.stats(quotas);
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.total_tokens, 1150);
        assert_eq!(stats.calls_per_model["gpt-4"], 2);
        assert!((stats.cost_per_model["gpt-4"] - 0.009).abs() < 1e-12);
        assert!((stats.total_cost - 0.0095).abs() < 1e-12);
        assert_eq!(stats.quota_limits["gpt-4"], 10);
        assert!(stats.to_string().contains("gpt-4: 2 calls"));
    }

    #[test]
    fn test_concurrent_appends_are_all_kept() {
        let log = UsageLog::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        log.append(record("gpt-4", 1, 0.0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(log.len(), 100);
    }

    #[test]
    fn test_poisoned_log_keeps_recording() {
        let log = UsageLog::new();
        log.append(record("gpt-4", 10, 0.001));

        let poisoner = log.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.lock().unwrap();
            panic!("poison the log");
        })
        .join();
        assert!(log.inner.is_poisoned());

        log.append(record("gpt-4", 20, 0.002));
        assert_eq!(log.len(), 2);
        assert_eq!(log.records().len(), 2);
        assert_eq!(log.stats(QuotaSnapshot::default()).total_calls, 2);
    }

    #[test]
    fn test_record_serializes_latency_as_millis() {
        let json = serde_json::to_value(record("gpt-4", 1, 0.0)).unwrap();
        assert_eq!(json["latency"], 120);
    }
}
