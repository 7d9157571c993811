//! Hit/miss accounting for the response cache

use serde::{Deserialize, Serialize};

/// Counters for one cache instance; never decrease within a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered from either tier (exact or fuzzy)
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Hits answered by the fuzzy scan
    pub fuzzy_hits: u64,
    /// Model calls avoided
    pub saved_calls: u64,
    /// Sum of the cost estimates of every stored entry (USD)
    pub estimated_savings: f64,
}

impl CacheStats {
    pub(crate) fn record_hit(&mut self, fuzzy: bool) {
        self.hits += 1;
        self.saved_calls += 1;
        if fuzzy {
            self.fuzzy_hits += 1;
        }
    }

    pub(crate) fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub(crate) fn record_store(&mut self, cost_estimate: f64) {
        self.estimated_savings += cost_estimate;
    }

    /// Share of lookups that hit, 0.0 when nothing was looked up yet
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Response Cache ===")?;
        writeln!(f, "Hits: {} ({} fuzzy)", self.hits, self.fuzzy_hits)?;
        writeln!(f, "Misses: {}", self.misses)?;
        writeln!(f, "Hit rate: {:.1}%", self.hit_rate() * 100.0)?;
        writeln!(f, "Calls saved: {}", self.saved_calls)?;
        writeln!(f, "Est. savings: ${:.4}", self.estimated_savings)?;
        Ok(())
    }
}
