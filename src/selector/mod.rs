//! Model selection across capability tiers
//!
//! Tier 0 holds the most capable (and most expensive) models, the last tier
//! the cheapest. A task name with a configured tier overrides the caller's
//! complexity. Quotas bound how often a model may be picked per window; an
//! exhausted tier falls through to cheaper ones and selection never blocks.

mod classify;
mod quota;

pub use classify::{classify, preferred_provider, Complexity};
pub use quota::QuotaSnapshot;

use crate::config::{ModelSettings, QuotaSettings};
use quota::QuotaState;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Separator between subtask names in merged task names
pub const DEFAULT_TASK_SEPARATOR: &str = "_and_";

/// Picks the cheapest capable model that still has quota
#[derive(Debug)]
pub struct ModelSelector {
    tiers: Vec<Vec<String>>,
    task_tiers: BTreeMap<String, usize>,
    provider_aliases: BTreeMap<String, String>,
    task_separator: String,
    quotas: Mutex<QuotaState>,
}

impl ModelSelector {
    pub fn new(models: &ModelSettings, quotas: &QuotaSettings) -> Self {
        let mut tiers: Vec<Vec<String>> = models
            .tiers
            .iter()
            .filter(|tier| !tier.is_empty())
            .cloned()
            .collect();
        if tiers.is_empty() {
            warn!("No model tiers configured, using the built-in catalogue");
            tiers = ModelSettings::default().tiers;
        }

        let mut state = QuotaState::new(Duration::from_secs(quotas.reset_interval_secs));
        let window = Duration::from_secs(quotas.reset_interval_secs);
        for (model, limit) in &quotas.limits {
            state.set_limit(model, *limit, window);
        }

        Self {
            tiers,
            task_tiers: models.task_tiers.clone(),
            provider_aliases: models.provider_aliases.clone(),
            task_separator: DEFAULT_TASK_SEPARATOR.to_string(),
            quotas: Mutex::new(state),
        }
    }

    /// Use `separator` to split merged task names
    pub fn with_task_separator(mut self, separator: impl Into<String>) -> Self {
        self.task_separator = separator.into();
        self
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    fn quotas(&self) -> MutexGuard<'_, QuotaState> {
        self.quotas.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tier index a request resolves to before quotas are considered
    pub fn resolve_tier(&self, complexity: Option<Complexity>, task_name: Option<&str>) -> usize {
        let index = match task_name.and_then(|task| self.task_tiers.get(task)) {
            Some(tier) => *tier,
            None => complexity
                .or_else(|| task_name.map(|task| classify(task, &self.task_separator)))
                .unwrap_or(Complexity::Medium)
                .tier_index(),
        };
        index.min(self.tiers.len() - 1)
    }

    /// Choose a model and count it against its quota.
    ///
    /// Scans the resolved tier (narrowed to `provider_preference` when any
    /// model matches), then every cheaper tier. When nothing has quota left
    /// the first model of the resolved tier is returned anyway.
    pub fn select(
        &self,
        complexity: Option<Complexity>,
        provider_preference: Option<&str>,
        task_name: Option<&str>,
    ) -> String {
        let tier_index = self.resolve_tier(complexity, task_name);
        let candidates = self.preferred_models(tier_index, provider_preference);

        let mut quotas = self.quotas();
        quotas.reset_if_elapsed(Instant::now());

        if let Some(model) = candidates.iter().find(|m| quotas.can_use(m)) {
            quotas.record(model);
            debug!("Selected {} from tier {}", model, tier_index);
            return model.to_string();
        }

        for tier in &self.tiers[tier_index + 1..] {
            if let Some(model) = tier.iter().find(|m| quotas.can_use(m)) {
                quotas.record(model);
                warn!("Using lower-tier model {} because of quota limits", model);
                return model.clone();
            }
        }

        let fallback = candidates[0].to_string();
        quotas.record(&fallback);
        warn!(
            "Every model has reached its quota, using {} anyway",
            fallback
        );
        fallback
    }

    fn preferred_models(&self, tier_index: usize, provider_preference: Option<&str>) -> Vec<&str> {
        let tier = &self.tiers[tier_index];
        let filtered: Vec<&str> = match provider_preference {
            Some(provider) => tier
                .iter()
                .filter(|m| self.matches_provider(m, provider))
                .map(String::as_str)
                .collect(),
            None => Vec::new(),
        };

        if filtered.is_empty() {
            tier.iter().map(String::as_str).collect()
        } else {
            filtered
        }
    }

    /// Substring match on the model id, directly or through a provider alias
    pub fn matches_provider(&self, model: &str, provider: &str) -> bool {
        let model = model.to_lowercase();
        let provider = provider.to_lowercase();
        if model.contains(&provider) {
            return true;
        }
        self.provider_aliases
            .get(&provider)
            .map(|needle| model.contains(&needle.to_lowercase()))
            .unwrap_or(false)
    }

    /// Configure or replace a model's quota; `window` becomes the shared window
    pub fn set_quota(&self, model: &str, limit: u32, window: Duration) {
        self.quotas().set_limit(model, limit, window);
    }

    /// Whether `model` has quota left in the current window
    pub fn is_available(&self, model: &str) -> bool {
        let mut quotas = self.quotas();
        quotas.reset_if_elapsed(Instant::now());
        quotas.can_use(model)
    }

    /// Count a call made with a model that did not come from [`select`](Self::select)
    pub fn record_call(&self, model: &str) {
        let mut quotas = self.quotas();
        quotas.reset_if_elapsed(Instant::now());
        quotas.record(model);
    }

    /// Undo the count of a selected model that ended up unused
    pub fn release(&self, model: &str) {
        self.quotas().release(model);
    }

    pub fn quota_snapshot(&self) -> QuotaSnapshot {
        self.quotas().snapshot()
    }

    /// Tier containing `model`
    pub fn tier_of(&self, model: &str) -> Option<usize> {
        self.tiers.iter().position(|tier| tier.iter().any(|m| m == model))
    }

    /// First model of the tier below `model`'s, if there is one
    pub fn downgrade(&self, model: &str) -> Option<String> {
        let tier = self.tier_of(model)?;
        self.tiers.get(tier + 1).map(|next| next[0].clone())
    }
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(&ModelSettings::default(), &QuotaSettings::default())
    }
}
