//! LLM cost optimizer - spend less on paid model endpoints
//!
//! This library sits between an application and its model provider and
//! cuts the number and size of paid calls.
//!
//! ## Key Features
//!
//! - **Response Cache**: Exact and fuzzy lookups over an in-memory and an on-disk tier
//! - **Token Accounting**: Per-model counting, truncation and chunking
//! - **Model Selection**: Cheapest capable tier, with per-model call quotas
//! - **Call Optimization**: Budget downgrades, prompt trimming and overflow recovery around any [`ModelInvoker`]
//! - **Workflow Planning**: Merge compatible pipeline steps into fewer calls
//! - **Reporting**: Usage, cache and workflow statistics with a JSON snapshot

pub mod api;
pub mod cache;
pub mod config;
pub mod cost;
pub mod logging;
pub mod metrics;
pub mod optimization;
pub mod orchestrator;
pub mod selector;
pub mod tokens;
pub mod workflow;

pub use api::{
    InvokeError, Message, ModelInvoker, ModelRequest, ModelResponse, Payload, Role, TaskHints,
    TokenUsage,
};
pub use cache::{CacheEntry, CacheError, CacheStats, ResponseCache};
pub use config::{Config, ConfigBuilder, ConfigError};
pub use cost::{CostOptimizer, CostReport, DailyBudget};
pub use metrics::{CostTable, ModelUsageRecord, UsageLog, UsageStats};
pub use optimization::{OptimizationStats, PromptOptimizer};
pub use orchestrator::{BudgetGuard, CallOptimizer, OptimizedInvoker};
pub use selector::{Complexity, ModelSelector, QuotaSnapshot};
pub use tokens::TokenAccountant;
pub use workflow::{ChunkInfo, ContentChunker, PlannerStats, WorkflowStats, WorkflowStep, WorkflowStepPlanner};
