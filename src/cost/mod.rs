//! One entry point for every cost optimization
//!
//! [`CostOptimizer`] owns the response cache, the call optimizer, the
//! workflow planner and a [`DailyBudget`], and reports on all of them.

mod budget;

pub use budget::DailyBudget;

use crate::api::{InvokeError, ModelInvoker, ModelRequest, ModelResponse, Payload};
use crate::cache::{CacheError, CacheStats, ResponseCache};
use crate::config::Config;
use crate::metrics::UsageStats;
use crate::orchestrator::{CallOptimizer, OptimizedInvoker};
use crate::workflow::{ContentChunker, PlannerStats, WorkflowStep, WorkflowStepPlanner};
use anyhow::Context;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Snapshot of everything the optimizer has saved and spent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostReport {
    pub runtime_seconds: f64,
    pub total_api_calls: usize,
    pub total_cached_calls: u64,
    pub total_cost: f64,
    /// Cache savings plus merged workflow steps valued at the average call cost
    pub total_saved_cost: f64,
    pub cost_reduction_percentage: f64,
    pub cache: CacheStats,
    pub llm: UsageStats,
    pub workflow: PlannerStats,
}

impl std::fmt::Display for CostReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Cost Optimization ===")?;
        writeln!(f, "Runtime: {:.0}s", self.runtime_seconds)?;
        writeln!(
            f,
            "API calls: {} ({} served from cache)",
            self.total_api_calls, self.total_cached_calls
        )?;
        writeln!(f, "Total cost: ${:.4}", self.total_cost)?;
        writeln!(
            f,
            "Saved: ${:.4} ({:.1}%)",
            self.total_saved_cost, self.cost_reduction_percentage
        )?;
        writeln!(f)?;
        write!(f, "{}", self.cache)?;
        writeln!(f)?;
        write!(f, "{}", self.llm)?;
        writeln!(f)?;
        write!(f, "{}", self.workflow)
    }
}

/// Facade over the cache, call optimizer, workflow planner and budget
pub struct CostOptimizer {
    config: Config,
    cache: Arc<ResponseCache>,
    calls: Arc<CallOptimizer>,
    planner: WorkflowStepPlanner,
    chunker: ContentChunker,
    budget: Arc<DailyBudget>,
    started: Instant,
}

impl CostOptimizer {
    /// Optimizer with a persisted cache under the configured directory
    pub fn new(config: Config) -> Result<Self, CacheError> {
        let cache = ResponseCache::new(&config.cache)?;
        Ok(Self::assemble(config, cache))
    }

    /// Optimizer whose cache lives in memory only
    pub fn in_memory(config: Config) -> Self {
        let cache = ResponseCache::in_memory(&config.cache);
        Self::assemble(config, cache)
    }

    fn assemble(config: Config, cache: ResponseCache) -> Self {
        let budget = Arc::new(DailyBudget::unlimited());
        let calls = CallOptimizer::from_config(&config).with_budget(budget.clone());

        info!("Cost optimizer ready");
        Self {
            planner: WorkflowStepPlanner::new(config.workflow.clone()),
            chunker: ContentChunker::from_config(&config),
            cache: Arc::new(cache),
            calls: Arc::new(calls),
            budget,
            started: Instant::now(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn call_optimizer(&self) -> &Arc<CallOptimizer> {
        &self.calls
    }

    pub fn planner(&self) -> &WorkflowStepPlanner {
        &self.planner
    }

    pub fn chunker(&self) -> &ContentChunker {
        &self.chunker
    }

    pub fn budget(&self) -> &Arc<DailyBudget> {
        &self.budget
    }

    /// Plan every workflow, keyed by name
    pub fn optimize_workflows(
        &self,
        workflows: &BTreeMap<String, Vec<WorkflowStep>>,
    ) -> BTreeMap<String, Vec<WorkflowStep>> {
        let planned: BTreeMap<_, _> = workflows
            .iter()
            .map(|(name, steps)| (name.clone(), self.planner.plan(name, steps)))
            .collect();

        info!("Optimized {} workflows", planned.len());
        planned
    }

    /// Cached call; `max_age` defaults to the configured freshness bound
    pub async fn cached_call<T, E, F, Fut>(
        &self,
        prefix: &str,
        params: serde_json::Value,
        max_age: Option<Duration>,
        cost_estimate: f64,
        call: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(serde_json::Value) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_age = max_age.or_else(|| self.default_max_age());
        self.cache
            .call_with_cache(prefix, params, max_age, cost_estimate, call)
            .await
    }

    fn default_max_age(&self) -> Option<Duration> {
        self.config.cache.default_max_age_secs.map(Duration::from_secs)
    }

    /// Model call through both the response cache and the call optimizer.
    ///
    /// Prompts are cached under "prompt", chat histories under "chat", so
    /// both are eligible for fuzzy hits.
    pub async fn invoke_cached<I>(
        &self,
        invoker: &I,
        request: ModelRequest,
        max_age: Option<Duration>,
    ) -> Result<ModelResponse, InvokeError>
    where
        I: ModelInvoker + ?Sized,
    {
        let prefix = match request.payload {
            Payload::Prompt(_) => "prompt",
            Payload::Messages(_) => "chat",
        };
        let cost_estimate = self.estimate_cost(&request);
        let params = request.cache_params();

        self.cached_call(prefix, params, max_age, cost_estimate, |_| {
            self.calls.call(invoker, request)
        })
        .await
    }

    fn estimate_cost(&self, request: &ModelRequest) -> f64 {
        let prompts = self.calls.prompts();
        let input = prompts.tokens().count_payload(&request.payload, &request.model);
        let output = (input as f64 * prompts.settings().output_ratio) as usize;
        self.calls.costs().estimate_cost(&request.model, input, output)
    }

    /// Route every call of `inner` through the call optimizer
    pub fn wrap<I: ModelInvoker>(&self, inner: I) -> OptimizedInvoker<I> {
        self.calls.wrap(inner)
    }

    pub fn set_model_quotas(&self, quotas: &BTreeMap<String, u32>, reset_interval: Duration) {
        let selector = self.calls.selector();
        for (model, limit) in quotas {
            selector.set_quota(model, *limit, reset_interval);
        }
    }

    /// Cap spending per calendar day; today's spend starts over
    pub fn set_daily_budget(&self, limit: f64) {
        self.budget.set_limit(limit);
    }

    pub fn get_optimization_stats(&self) -> CostReport {
        let cache = self.cache.stats();
        let llm = self.calls.usage_stats();
        let workflow = self.planner.stats();

        let mut total_saved_cost = cache.estimated_savings;
        if workflow.total_api_calls_saved > 0 {
            total_saved_cost += workflow.total_api_calls_saved as f64 * llm.average_call_cost();
        }

        let spent_and_saved = llm.total_cost + total_saved_cost;
        let cost_reduction_percentage = if spent_and_saved > 0.0 {
            total_saved_cost / spent_and_saved * 100.0
        } else {
            0.0
        };

        CostReport {
            runtime_seconds: self.started.elapsed().as_secs_f64(),
            total_api_calls: llm.total_calls,
            total_cached_calls: cache.saved_calls,
            total_cost: llm.total_cost,
            total_saved_cost,
            cost_reduction_percentage,
            cache,
            llm,
            workflow,
        }
    }

    /// Write the current report as pretty JSON, stamped with the time
    pub fn save_stats_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let mut report = serde_json::to_value(self.get_optimization_stats())
            .context("Failed to serialize optimization stats")?;
        report["timestamp"] = serde_json::Value::String(Utc::now().to_rfc3339());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let contents = serde_json::to_string_pretty(&report)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move stats into {}", path.display()))?;

        info!("Saved optimization stats to {}", path.display());
        Ok(())
    }

    /// Drop cache entries older than `max_age` (default: the configured expiry)
    pub fn clear_expired_cache(&self, max_age: Option<Duration>) -> usize {
        let max_age = max_age.unwrap_or(Duration::from_secs(self.config.cache.expiry_secs));
        let removed = self.cache.evict_older_than(max_age);
        if removed > 0 {
            info!("Cleared {} expired cache entries", removed);
        }
        removed
    }
}

impl std::fmt::Debug for CostOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostOptimizer")
            .field("cache", &self.cache.directory())
            .field("calls", &self.calls)
            .field("budget", &self.budget)
            .finish()
    }
}

/// Stats file contents as read back by tooling
#[derive(Debug, Clone, Deserialize)]
pub struct SavedReport {
    pub timestamp: chrono::DateTime<Utc>,
    pub total_api_calls: usize,
    pub total_cost: f64,
    pub total_saved_cost: f64,
    pub cost_reduction_percentage: f64,
}

impl SavedReport {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Malformed stats file {}", path.display()))
    }
}
