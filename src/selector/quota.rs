//! Per-model call quotas on one shared window

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::info;

/// Counters for every quota-limited model plus the shared window clock.
///
/// The window resets lazily: whoever touches the state first after the
/// window has elapsed zeroes every counter.
#[derive(Debug)]
pub(crate) struct QuotaState {
    limits: HashMap<String, u32>,
    used: HashMap<String, u32>,
    window_start: Instant,
    window: Duration,
}

/// Point-in-time view of quota usage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuotaSnapshot {
    pub quota_used: BTreeMap<String, u32>,
    pub quota_limits: BTreeMap<String, u32>,
    pub window_secs: u64,
}

impl QuotaState {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            limits: HashMap::new(),
            used: HashMap::new(),
            window_start: Instant::now(),
            window,
        }
    }

    /// Configure `model`; the latest window wins for every model
    pub(crate) fn set_limit(&mut self, model: &str, limit: u32, window: Duration) {
        self.limits.insert(model.to_string(), limit);
        self.used.entry(model.to_string()).or_insert(0);
        self.window = window;
        info!(
            "Quota for {}: {} calls every {}s",
            model,
            limit,
            window.as_secs()
        );
    }

    pub(crate) fn reset_if_elapsed(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= self.window {
            for count in self.used.values_mut() {
                *count = 0;
            }
            self.window_start = now;
            info!("Model quotas reset");
        }
    }

    /// Models without a quota are always usable
    pub(crate) fn can_use(&self, model: &str) -> bool {
        match self.limits.get(model) {
            Some(limit) => self.used.get(model).copied().unwrap_or(0) < *limit,
            None => true,
        }
    }

    pub(crate) fn record(&mut self, model: &str) {
        *self.used.entry(model.to_string()).or_insert(0) += 1;
    }

    /// Give back one counted call, e.g. for a selection that was abandoned
    pub(crate) fn release(&mut self, model: &str) {
        if let Some(count) = self.used.get_mut(model) {
            *count = count.saturating_sub(1);
        }
    }

    pub(crate) fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            quota_used: self.used.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            quota_limits: self.limits.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            window_secs: self.window.as_secs(),
        }
    }
}
