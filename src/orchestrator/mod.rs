//! Call optimization around a model invoker
//!
//! [`CallOptimizer`] sits between a caller and any [`ModelInvoker`]:
//! - Picks the cheapest capable model (unless the request pins one)
//! - Downgrades one tier when an attached [`BudgetGuard`] rejects the estimate
//! - Trims prompts and chat histories that approach the model window
//! - Records actual usage and cost for every successful call
//! - Retries once with an emergency cut when a provider reports a context overflow

use crate::api::{InvokeError, Message, ModelInvoker, ModelRequest, ModelResponse, Payload};
use crate::config::Config;
use crate::metrics::{CostTable, ModelUsageRecord, UsageLog, UsageStats};
use crate::optimization::PromptOptimizer;
use crate::selector::ModelSelector;
use crate::tokens::{TokenAccountant, MESSAGE_OVERHEAD_TOKENS};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Spending limit consulted before a call and told about its actual cost after
pub trait BudgetGuard: Send + Sync {
    /// Whether a call estimated at `estimated_cost` USD may go ahead
    fn allows(&self, estimated_cost: f64) -> bool;

    /// Account for a completed call
    fn record_spend(&self, actual_cost: f64);
}

/// Applies model selection, budget checks and prompt trimming to every call
pub struct CallOptimizer {
    selector: Arc<ModelSelector>,
    prompts: PromptOptimizer,
    costs: CostTable,
    usage: UsageLog,
    budget: Option<Arc<dyn BudgetGuard>>,
}

impl CallOptimizer {
    pub fn new(selector: Arc<ModelSelector>, prompts: PromptOptimizer, costs: CostTable) -> Self {
        Self {
            selector,
            prompts,
            costs,
            usage: UsageLog::new(),
            budget: None,
        }
    }

    /// Optimizer built from the model, quota and optimizer sections of `config`
    pub fn from_config(config: &Config) -> Self {
        let selector = ModelSelector::new(&config.models, &config.quotas)
            .with_task_separator(config.workflow.task_separator.clone());
        let prompts = PromptOptimizer::new(
            TokenAccountant::new(&config.models),
            config.optimizer.clone(),
        );
        Self::new(Arc::new(selector), prompts, CostTable::new(&config.models))
    }

    pub fn with_budget(mut self, budget: Arc<dyn BudgetGuard>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Share an existing usage log instead of starting a new one
    pub fn with_usage_log(mut self, usage: UsageLog) -> Self {
        self.usage = usage;
        self
    }

    pub fn selector(&self) -> &Arc<ModelSelector> {
        &self.selector
    }

    pub fn prompts(&self) -> &PromptOptimizer {
        &self.prompts
    }

    pub fn costs(&self) -> &CostTable {
        &self.costs
    }

    pub fn usage_log(&self) -> &UsageLog {
        &self.usage
    }

    /// Totals over every recorded call, with current quota usage
    pub fn usage_stats(&self) -> UsageStats {
        self.usage.stats(self.selector.quota_snapshot())
    }

    /// An invoker that routes every request through this optimizer
    pub fn wrap<I: ModelInvoker>(self: &Arc<Self>, inner: I) -> OptimizedInvoker<I> {
        OptimizedInvoker {
            optimizer: Arc::clone(self),
            inner,
        }
    }

    /// Run one request through `invoker` with every optimization applied
    pub async fn call<I>(&self, invoker: &I, mut request: ModelRequest) -> Result<ModelResponse, InvokeError>
    where
        I: ModelInvoker + ?Sized,
    {
        let original_payload = request.payload.clone();
        let tokens = self.prompts.tokens();
        let input_tokens = tokens.count_payload(&request.payload, &request.model);
        debug!(
            "Request for {}: {} tokens of {} allowed",
            request.model,
            input_tokens,
            tokens.limit(&request.model)
        );

        let mut selected = None;
        if request.hints.auto_select_model {
            let model = self.selector.select(
                request.hints.complexity,
                request.hints.provider_preference.as_deref(),
                request.hints.task_name.as_deref(),
            );
            if model != request.model {
                info!("Selected {} instead of {}", model, request.model);
            }
            request.model = model.clone();
            selected = Some(model);
        }

        if let Some(budget) = &self.budget {
            let estimate = self.preliminary_cost(&request.model, input_tokens);
            if !budget.allows(estimate) {
                warn!(
                    "Estimated cost ${:.4} for {} exceeds the budget",
                    estimate, request.model
                );
                match self.selector.downgrade(&request.model) {
                    Some(cheaper) => {
                        if let Some(abandoned) = selected.take() {
                            self.selector.release(&abandoned);
                        }
                        info!("Downgraded from {} to {}", request.model, cheaper);
                        request.model = cheaper;

                        let estimate = self.preliminary_cost(&request.model, input_tokens);
                        if !budget.allows(estimate) {
                            warn!(
                                "Estimated cost ${:.4} for {} still exceeds the budget, proceeding",
                                estimate, request.model
                            );
                        }
                    }
                    None => warn!("No cheaper model than {}, proceeding", request.model),
                }
            }
        }

        if selected.is_none() {
            self.selector.record_call(&request.model);
        }

        request.payload = self.fit_payload(request.payload, &request.model);

        let started = Instant::now();
        match invoker.invoke(request.clone()).await {
            Ok(response) => {
                self.record_usage(&request, &response, started);
                Ok(response)
            }
            Err(e) if e.is_context_overflow() => {
                error!("Context overflow on {}: {}", request.model, e);
                self.retry_after_overflow(invoker, request, original_payload, e).await
            }
            Err(e) => Err(e),
        }
    }

    /// USD estimate before the call, assuming a proportional response
    fn preliminary_cost(&self, model: &str, input_tokens: usize) -> f64 {
        let output_tokens = (input_tokens as f64 * self.prompts.settings().output_ratio) as usize;
        self.costs.estimate_cost(model, input_tokens, output_tokens)
    }

    /// Trim the payload when it passes the optimize threshold of the model
    /// window, otherwise apply the light pass only
    fn fit_payload(&self, payload: Payload, model: &str) -> Payload {
        let tokens = self.prompts.tokens();
        let max_allowed = self.prompts.max_allowed(tokens.limit(model));
        let current = tokens.count_payload(&payload, model);

        if current <= max_allowed {
            return match payload {
                Payload::Prompt(prompt) => Payload::Prompt(self.prompts.light_optimize(&prompt)),
                Payload::Messages(messages) => Payload::Messages(
                    messages
                        .into_iter()
                        .map(|m| Message::new(m.role, self.prompts.light_optimize(&m.content)))
                        .collect(),
                ),
            };
        }

        warn!(
            "Payload for {} uses {} tokens, optimizing to {}",
            model, current, max_allowed
        );
        match payload {
            Payload::Prompt(prompt) => {
                let optimized = self.prompts.optimize_prompt(&prompt, model);
                Payload::Prompt(tokens.truncate(&optimized, max_allowed, model))
            }
            Payload::Messages(messages) => {
                let fitted = self.prompts.optimize_messages(&messages, model, None);
                if tokens.count_messages(&fitted, model) <= max_allowed {
                    return Payload::Messages(fitted);
                }

                warn!("Messages still too long, keeping only system and last user message");
                let essentials = self.prompts.reduce_to_essentials(&fitted, model);
                match fitted.last() {
                    Some(last) if essentials.is_empty() => {
                        warn!("No system or user message left, truncating the last message");
                        let budget = max_allowed.saturating_sub(MESSAGE_OVERHEAD_TOKENS);
                        Payload::Messages(vec![Message::new(
                            last.role,
                            tokens.truncate(&last.content, budget, model),
                        )])
                    }
                    _ => Payload::Messages(essentials),
                }
            }
        }
    }

    async fn retry_after_overflow<I>(
        &self,
        invoker: &I,
        mut request: ModelRequest,
        original_payload: Payload,
        cause: InvokeError,
    ) -> Result<ModelResponse, InvokeError>
    where
        I: ModelInvoker + ?Sized,
    {
        let provider = &self.prompts.settings().overflow_retry_provider;
        let retryable = !provider.is_empty() && self.selector.matches_provider(&request.model, provider);

        let Payload::Messages(messages) = original_payload else {
            return Err(cause);
        };
        if !retryable {
            return Err(cause);
        }

        let emergency = self.prompts.emergency_messages(&messages, &request.model);
        warn!(
            "Retrying {} once with {} emergency-trimmed messages",
            request.model,
            emergency.len()
        );
        request.payload = Payload::Messages(emergency);

        let started = Instant::now();
        match invoker.invoke(request.clone()).await {
            Ok(response) => {
                self.record_usage(&request, &response, started);
                Ok(response)
            }
            Err(e) => {
                error!("Emergency retry on {} failed: {}", request.model, e);
                Err(e)
            }
        }
    }

    fn record_usage(&self, request: &ModelRequest, response: &ModelResponse, started: Instant) {
        let (input_tokens, output_tokens) = match response.usage {
            Some(usage) => (usage.prompt_tokens as usize, usage.completion_tokens as usize),
            None => {
                let input = self.prompts.tokens().count_payload(&request.payload, &request.model);
                let output = (input as f64 * self.prompts.settings().output_ratio) as usize;
                (input, output)
            }
        };

        let cost = self.costs.estimate_cost(&request.model, input_tokens, output_tokens);
        self.usage.append(ModelUsageRecord {
            timestamp: Utc::now(),
            model: request.model.clone(),
            input_tokens,
            output_tokens,
            cost,
            latency: started.elapsed(),
        });

        if let Some(budget) = &self.budget {
            budget.record_spend(cost);
        }

        info!(
            "{}: {} in / {} out tokens, ${:.4}",
            request.model, input_tokens, output_tokens, cost
        );
    }
}

impl std::fmt::Debug for CallOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptimizer")
            .field("selector", &self.selector)
            .field("calls", &self.usage.len())
            .field("budget", &self.budget.is_some())
            .finish()
    }
}

/// A [`ModelInvoker`] whose calls go through a shared [`CallOptimizer`]
pub struct OptimizedInvoker<I> {
    optimizer: Arc<CallOptimizer>,
    inner: I,
}

impl<I> OptimizedInvoker<I> {
    pub fn optimizer(&self) -> &Arc<CallOptimizer> {
        &self.optimizer
    }

    pub fn into_inner(self) -> I {
        self.inner
    }
}

#[async_trait]
impl<I: ModelInvoker> ModelInvoker for OptimizedInvoker<I> {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, InvokeError> {
        self.optimizer.call(&self.inner, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Role;
    use crate::config::{ModelSettings, OptimizerSettings};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockInvoker {
        requests: Mutex<Vec<ModelRequest>>,
        failures: Mutex<VecDeque<InvokeError>>,
        usage: Option<(u32, u32)>,
    }

    impl MockInvoker {
        fn failing(errors: Vec<InvokeError>) -> Self {
            Self {
                failures: Mutex::new(errors.into()),
                ..Default::default()
            }
        }

        fn requests(&self) -> Vec<ModelRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelInvoker for MockInvoker {
        async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, InvokeError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let response = ModelResponse::new(request.model, json!({"text": "ok"}));
            Ok(match self.usage {
                Some((input, output)) => response.with_usage(input, output),
                None => response,
            })
        }
    }

    #[derive(Default)]
    struct RejectAll {
        spent: Mutex<Vec<f64>>,
    }

    impl BudgetGuard for RejectAll {
        fn allows(&self, _estimated_cost: f64) -> bool {
            false
        }

        fn record_spend(&self, actual_cost: f64) {
            self.spent.lock().unwrap().push(actual_cost);
        }
    }

    fn optimizer() -> CallOptimizer {
        let mut models = ModelSettings::default();
        models.token_limits.insert("tiny".to_string(), 100);
        CallOptimizer::new(
            Arc::new(ModelSelector::default()),
            PromptOptimizer::new(TokenAccountant::word_estimate(&models), OptimizerSettings::default()),
            CostTable::new(&models),
        )
    }

    fn words(n: usize, word: &str) -> String {
        vec![word; n].join(" ")
    }

    fn overflow() -> InvokeError {
        InvokeError::Provider("This model's maximum context length is 8192 tokens".to_string())
    }

    #[tokio::test]
    async fn test_auto_select_replaces_model() {
        let optimizer = optimizer();
        let invoker = MockInvoker::default();
        let request = ModelRequest::prompt("gpt-4", "Outline the talk").with_task("outline");

        let response = optimizer.call(&invoker, request).await.unwrap();
        assert_eq!(response.model, "gpt-3.5-turbo");

        let stats = optimizer.usage_stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.calls_per_model["gpt-3.5-turbo"], 1);
        assert_eq!(stats.quota_used["gpt-3.5-turbo"], 1);
    }

    #[tokio::test]
    async fn test_fixed_model_is_kept_and_counted() {
        let optimizer = optimizer();
        let invoker = MockInvoker::default();
        let request = ModelRequest::prompt("gpt-4", "Outline the talk")
            .with_task("outline")
            .with_fixed_model();

        optimizer.call(&invoker, request).await.unwrap();
        assert_eq!(invoker.requests()[0].model, "gpt-4");
        assert_eq!(optimizer.usage_stats().quota_used["gpt-4"], 1);
    }

    #[tokio::test]
    async fn test_budget_rejection_downgrades_one_tier() {
        let budget = Arc::new(RejectAll::default());
        let optimizer = optimizer().with_budget(budget.clone());
        let invoker = MockInvoker::default();
        let request = ModelRequest::prompt("gpt-4", "Review the proof").with_task("expert_review");

        optimizer.call(&invoker, request).await.unwrap();

        assert_eq!(invoker.requests()[0].model, "gpt-4-turbo");
        let stats = optimizer.usage_stats();
        // the abandoned pick gives its quota back
        assert_eq!(stats.quota_used["gpt-4"], 0);
        assert_eq!(stats.quota_used["gpt-4-turbo"], 1);
        assert_eq!(budget.spent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cheapest_tier_cannot_downgrade() {
        let optimizer = optimizer().with_budget(Arc::new(RejectAll::default()));
        let invoker = MockInvoker::default();
        let request = ModelRequest::prompt("deepseek-chat", "hi").with_fixed_model();

        optimizer.call(&invoker, request).await.unwrap();
        assert_eq!(invoker.requests()[0].model, "deepseek-chat");
    }

    #[tokio::test]
    async fn test_light_pass_under_threshold() {
        let optimizer = optimizer();
        let invoker = MockInvoker::default();
        let request = ModelRequest::chat(
            "gpt-4",
            vec![
                Message::system("Please provide   short answers"),
                Message::user("What   is Rust?"),
            ],
        )
        .with_fixed_model();

        optimizer.call(&invoker, request).await.unwrap();
        assert_eq!(
            invoker.requests()[0].payload,
            Payload::Messages(vec![
                Message::system("short answers"),
                Message::user("What is Rust?"),
            ])
        );
    }

    #[tokio::test]
    async fn test_long_prompt_is_trimmed_to_threshold() {
        let optimizer = optimizer();
        let invoker = MockInvoker::default();
        let request = ModelRequest::prompt("tiny", words(200, "context")).with_fixed_model();

        optimizer.call(&invoker, request).await.unwrap();
        let sent = &invoker.requests()[0].payload;
        assert!(optimizer.prompts().tokens().count_payload(sent, "tiny") <= 80);
    }

    #[tokio::test]
    async fn test_long_history_is_trimmed_to_threshold() {
        let optimizer = optimizer();
        let invoker = MockInvoker::default();
        let request = ModelRequest::chat(
            "tiny",
            vec![
                Message::system(words(40, "rules")),
                Message::user(words(30, "first")),
                Message::assistant(words(30, "reply")),
                Message::user(words(60, "second")),
            ],
        )
        .with_fixed_model();

        optimizer.call(&invoker, request).await.unwrap();
        let sent = &invoker.requests()[0].payload;
        assert!(optimizer.prompts().tokens().count_payload(sent, "tiny") <= 80);

        let Payload::Messages(messages) = sent else {
            panic!("expected messages");
        };
        assert_eq!(messages.first().unwrap().role, Role::System);
        assert!(messages.last().unwrap().content.starts_with("second"));
    }

    #[tokio::test]
    async fn test_assistant_only_history_is_never_emptied() {
        let optimizer = optimizer();
        let invoker = MockInvoker::default();
        let request =
            ModelRequest::chat("tiny", vec![Message::assistant(words(200, "recap"))]).with_fixed_model();

        optimizer.call(&invoker, request).await.unwrap();
        let sent = &invoker.requests()[0].payload;
        let Payload::Messages(messages) = sent else {
            panic!("expected messages");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert!(messages[0].content.starts_with("recap"));
        assert!(optimizer.prompts().tokens().count_payload(sent, "tiny") <= 80);
    }

    #[tokio::test]
    async fn test_usage_from_response() {
        let optimizer = optimizer();
        let invoker = MockInvoker {
            usage: Some((1200, 300)),
            ..Default::default()
        };
        let request = ModelRequest::prompt("gpt-4", "hi").with_fixed_model();

        optimizer.call(&invoker, request).await.unwrap();
        let record = &optimizer.usage_log().records()[0];
        assert_eq!(record.input_tokens, 1200);
        assert_eq!(record.output_tokens, 300);
        assert!((record.cost - 0.09).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_usage_falls_back_to_estimate() {
        let optimizer = optimizer();
        let invoker = MockInvoker::default();
        let request = ModelRequest::prompt("gpt-4", words(100, "token")).with_fixed_model();

        optimizer.call(&invoker, request).await.unwrap();
        let record = &optimizer.usage_log().records()[0];
        assert_eq!(record.input_tokens, 130);
        assert_eq!(record.output_tokens, 65);
    }

    #[tokio::test]
    async fn test_overflow_retries_once_for_deepseek() {
        let optimizer = optimizer();
        let invoker = MockInvoker::failing(vec![overflow()]);
        let request = ModelRequest::chat(
            "deepseek-chat",
            vec![
                Message::system(words(2000, "rules")),
                Message::user("first question"),
                Message::assistant("first answer"),
                Message::user(words(5000, "second")),
            ],
        )
        .with_fixed_model();

        optimizer.call(&invoker, request).await.unwrap();

        let requests = invoker.requests();
        assert_eq!(requests.len(), 2);
        let Payload::Messages(retried) = &requests[1].payload else {
            panic!("expected messages");
        };
        let tokens = optimizer.prompts().tokens();
        assert_eq!(retried.len(), 2);
        assert!(tokens.count(&retried[0].content, "deepseek-chat") <= 1000);
        assert!(tokens.count(&retried[1].content, "deepseek-chat") <= 3000);
        assert_eq!(optimizer.usage_log().len(), 1);
    }

    #[tokio::test]
    async fn test_overflow_on_other_providers_propagates() {
        let optimizer = optimizer();
        let invoker = MockInvoker::failing(vec![overflow()]);
        let request = ModelRequest::chat("gpt-4", vec![Message::user("hi")]).with_fixed_model();

        let err = optimizer.call(&invoker, request).await.unwrap_err();
        assert!(err.is_context_overflow());
        assert_eq!(invoker.requests().len(), 1);
        assert!(optimizer.usage_log().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_retry_needs_messages() {
        let optimizer = optimizer();
        let invoker = MockInvoker::failing(vec![overflow()]);
        let request = ModelRequest::prompt("deepseek-chat", "hi").with_fixed_model();

        assert!(optimizer.call(&invoker, request).await.is_err());
        assert_eq!(invoker.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_second_failure_propagates() {
        let optimizer = optimizer();
        let invoker = MockInvoker::failing(vec![
            overflow(),
            InvokeError::Timeout("30s elapsed".to_string()),
        ]);
        let request =
            ModelRequest::chat("deepseek-chat", vec![Message::user("hi")]).with_fixed_model();

        let err = optimizer.call(&invoker, request).await.unwrap_err();
        assert!(matches!(err, InvokeError::Timeout(_)));
        assert_eq!(invoker.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let optimizer = optimizer();
        let invoker = MockInvoker::failing(vec![InvokeError::RateLimited { retry_after_secs: 3 }]);
        let request =
            ModelRequest::chat("deepseek-chat", vec![Message::user("hi")]).with_fixed_model();

        let err = optimizer.call(&invoker, request).await.unwrap_err();
        assert!(matches!(err, InvokeError::RateLimited { retry_after_secs: 3 }));
        assert_eq!(invoker.requests().len(), 1);
    }

    #[test]
    fn test_wrapped_invoker() {
        let optimizer = Arc::new(optimizer());
        let wrapped = optimizer.wrap(MockInvoker::default());

        let response = tokio_test::block_on(
            wrapped.invoke(ModelRequest::prompt("gpt-4", "Draft it").with_task("draft")),
        )
        .unwrap();

        assert_eq!(response.model, "gpt-4-turbo");
        assert_eq!(wrapped.optimizer().usage_log().len(), 1);
        assert_eq!(wrapped.into_inner().requests().len(), 1);
    }
}
