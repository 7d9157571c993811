//! Configuration management for the cost optimizer
//!
//! Supports configuration via:
//! 1. Config file (~/.config/llm-cost-optimizer/config.toml)
//! 2. Environment variables (LLM_COST_CACHE_DIR, LLM_COST_LOG_LEVEL)
//! 3. The [`ConfigBuilder`] for programmatic setups
//!
//! Every section has complete defaults, so a missing file or a partial file
//! is always valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model catalogue: tiers, ceilings, prices
    pub models: ModelSettings,

    /// Response cache settings
    pub cache: CacheSettings,

    /// Per-model call quotas
    pub quotas: QuotaSettings,

    /// Call optimizer thresholds and prompt rewriting
    pub optimizer: OptimizerSettings,

    /// Workflow step planner settings
    pub workflow: WorkflowSettings,

    /// Log output
    pub logging: LogSettings,
}

/// Static model catalogue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Ranked tiers, index 0 = most capable and most expensive
    pub tiers: Vec<Vec<String>>,

    /// Context ceiling per model id
    pub token_limits: BTreeMap<String, usize>,

    /// Ceiling for model ids missing from `token_limits`
    pub default_token_limit: usize,

    /// USD per 1000 tokens (input and output priced alike)
    pub cost_per_1k: BTreeMap<String, f64>,

    /// Flat per-call estimate for model ids missing from `cost_per_1k`
    pub default_cost: f64,

    /// Task name -> tier index, overrides the complexity passed by callers
    pub task_tiers: BTreeMap<String, usize>,

    /// Provider name -> substring found in that provider's model ids
    pub provider_aliases: BTreeMap<String, String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let tiers = vec![
            vec!["gpt-4".to_string(), "claude-3-opus-20240229".to_string()],
            vec![
                "gpt-4-turbo".to_string(),
                "claude-3-sonnet-20240229".to_string(),
            ],
            vec![
                "gpt-3.5-turbo".to_string(),
                "claude-3-haiku-20240307".to_string(),
                "deepseek-chat".to_string(),
                "deepseek-coder".to_string(),
            ],
        ];

        let token_limits = [
            ("gpt-4", 8192),
            ("gpt-4-turbo", 128_000),
            ("gpt-3.5-turbo", 16_384),
            ("claude-3-opus-20240229", 200_000),
            ("claude-3-sonnet-20240229", 200_000),
            ("claude-3-haiku-20240307", 200_000),
            ("deepseek-chat", 8192),
            ("deepseek-coder", 8192),
        ]
        .into_iter()
        .map(|(model, limit)| (model.to_string(), limit))
        .collect();

        let cost_per_1k = [
            ("gpt-4", 0.06),
            ("gpt-4-turbo", 0.03),
            ("gpt-3.5-turbo", 0.0015),
            ("claude-3-opus-20240229", 0.045),
            ("claude-3-sonnet-20240229", 0.015),
            ("claude-3-haiku-20240307", 0.0025),
            ("deepseek-chat", 0.0005),
            ("deepseek-coder", 0.0008),
        ]
        .into_iter()
        .map(|(model, cost)| (model.to_string(), cost))
        .collect();

        let task_tiers = [
            ("expert_review", 0),
            ("technical_draft", 0),
            ("research", 1),
            ("draft", 1),
            ("edit", 1),
            ("review", 1),
            ("outline", 2),
            ("finalize", 2),
            ("optimize", 2),
            ("brainstorm", 2),
            ("research_and_outline", 1),
            ("outline_and_draft", 1),
            ("draft_and_review", 1),
            ("review_and_finalize", 1),
            ("edit_and_finalize", 2),
            ("brainstorm_and_draft", 1),
            ("optimize_and_finalize", 2),
        ]
        .into_iter()
        .map(|(task, tier)| (task.to_string(), tier))
        .collect();

        let provider_aliases = [("openai", "gpt"), ("anthropic", "claude")]
            .into_iter()
            .map(|(provider, needle)| (provider.to_string(), needle.to_string()))
            .collect();

        Self {
            tiers,
            token_limits,
            default_token_limit: 4096,
            cost_per_1k,
            default_cost: 0.01,
            task_tiers,
            provider_aliases,
        }
    }
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Directory of the persisted tier; `None` means the user cache directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    /// Prefixes eligible for fuzzy lookup
    pub fuzzy_prefixes: Vec<String>,

    /// Minimum word overlap (common / larger set) for a fuzzy match
    pub similarity_threshold: f64,

    /// Texts shorter than this many characters must match exactly
    pub short_text_chars: usize,

    /// Default freshness bound applied by the facade's cached calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_max_age_secs: Option<u64>,

    /// Age used by maintenance sweeps
    pub expiry_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            directory: None,
            fuzzy_prefixes: vec![
                "prompt".to_string(),
                "completion".to_string(),
                "chat".to_string(),
            ],
            similarity_threshold: 0.7,
            short_text_chars: 50,
            default_max_age_secs: None,
            expiry_secs: 86_400,
        }
    }
}

impl CacheSettings {
    /// Directory for persisted entries, falling back to the user cache dir
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("llm-cost-optimizer")
        })
    }
}

/// Per-model call quotas sharing one reset window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    /// Window length shared by every quota
    pub reset_interval_secs: u64,

    /// Calls allowed per window, by model id
    pub limits: BTreeMap<String, u32>,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            reset_interval_secs: 3600,
            limits: BTreeMap::new(),
        }
    }
}

/// Call optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Share of the model ceiling above which prompts are trimmed
    pub optimize_threshold: f64,

    /// Share of the ceiling above which prompt rewriting turns aggressive
    pub aggressive_threshold: f64,

    /// Assumed output size relative to input, for pre-call estimates
    pub output_ratio: f64,

    /// Share of the window kept free for the response when fitting messages
    pub response_reserve: f64,

    /// Largest share of the remaining window a system message may keep
    pub system_share: f64,

    /// Provider whose context overflows get one emergency retry
    pub overflow_retry_provider: String,

    /// Token cap for the system message on the emergency retry
    pub emergency_system_tokens: usize,

    /// Token cap for the last user message on the emergency retry
    pub emergency_user_tokens: usize,

    /// Embedded examples longer than this many characters get cut
    pub example_max_chars: usize,

    /// Boilerplate always stripped from prompts
    pub redundant_phrases: Vec<String>,

    /// Extra boilerplate stripped from prompts near the ceiling
    pub aggressive_phrases: Vec<String>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        let redundant_phrases = [
            "Please provide",
            "Please make sure to",
            "Make sure to",
            "Remember to",
            "It is important that you",
            "I would like you to",
            "I'd like you to",
            "Could you please",
        ];
        let aggressive_phrases = [
            "Keep in mind that",
            "Don't forget to",
            "Do not forget to",
            "Consider that",
            "Bear in mind that",
            "Pay attention to",
        ];

        Self {
            optimize_threshold: 0.8,
            aggressive_threshold: 0.7,
            output_ratio: 0.5,
            response_reserve: 0.2,
            system_share: 0.3,
            overflow_retry_provider: "deepseek".to_string(),
            emergency_system_tokens: 1000,
            emergency_user_tokens: 3000,
            example_max_chars: 200,
            redundant_phrases: redundant_phrases.iter().map(|p| p.to_string()).collect(),
            aggressive_phrases: aggressive_phrases.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Workflow step planner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Prefer the cheapest provider when annotating steps
    pub economic_mode: bool,

    /// Joins task names of merged steps
    pub task_separator: String,

    /// Joins descriptions of merged steps
    pub description_separator: String,

    /// Unordered task pairs that may share one call
    pub mergeable_pairs: Vec<[String; 2]>,

    /// Tasks cheap enough to merge with each other regardless of pairing
    pub low_complexity_tasks: Vec<String>,

    /// Share of the model ceiling a content chunk may use
    pub chunk_share: f64,

    /// Tokens repeated between consecutive content chunks
    pub chunk_overlap: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        let pairs = [
            ("research", "outline"),
            ("outline", "draft"),
            ("draft", "review"),
            ("edit", "finalize"),
            ("brainstorm", "draft"),
            ("review", "finalize"),
            ("optimize", "finalize"),
            ("review", "edit"),
        ];

        Self {
            economic_mode: false,
            task_separator: "_and_".to_string(),
            description_separator: " + ".to_string(),
            mergeable_pairs: pairs
                .iter()
                .map(|(a, b)| [a.to_string(), b.to_string()])
                .collect(),
            low_complexity_tasks: ["finalize", "optimize", "brainstorm", "outline"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            chunk_share: 0.7,
            chunk_overlap: 100,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llm-cost-optimizer")
            .join("config.toml")
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config from specific path
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default().with_env_overrides());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        let config = config.with_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load config from a file that must exist
    pub fn load_required(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        Self::load_from(path)
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("LLM_COST_CACHE_DIR") {
            self.cache.directory = Some(PathBuf::from(dir));
        }
        if let Ok(level) = std::env::var("LLM_COST_LOG_LEVEL") {
            self.logging.level = level;
        }

        self
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    /// Save config to specific path
    pub fn save_to(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.tiers.is_empty() || self.models.tiers.iter().any(|t| t.is_empty()) {
            return Err(ConfigError::Invalid(
                "models.tiers must contain at least one non-empty tier".to_string(),
            ));
        }

        let tier_count = self.models.tiers.len();
        if let Some((task, tier)) = self
            .models
            .task_tiers
            .iter()
            .find(|(_, tier)| **tier >= tier_count)
        {
            return Err(ConfigError::Invalid(format!(
                "task '{}' maps to tier {} but only {} tiers exist",
                task, tier, tier_count
            )));
        }

        let ratios = [
            ("cache.similarity_threshold", self.cache.similarity_threshold),
            ("optimizer.optimize_threshold", self.optimizer.optimize_threshold),
            ("optimizer.aggressive_threshold", self.optimizer.aggressive_threshold),
            ("optimizer.response_reserve", self.optimizer.response_reserve),
            ("optimizer.system_share", self.optimizer.system_share),
            ("workflow.chunk_share", self.workflow.chunk_share),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must lie between 0 and 1, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }

    /// Generate example config content
    pub fn example() -> String {
        let example = Config::default();
        toml::to_string_pretty(&example).unwrap_or_default()
    }
}

/// Builder for creating Config programmatically
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache.directory = Some(dir.into());
        self
    }

    pub fn similarity_threshold(mut self, threshold: f64) -> Self {
        self.config.cache.similarity_threshold = threshold;
        self
    }

    pub fn quota(mut self, model: impl Into<String>, limit: u32) -> Self {
        self.config.quotas.limits.insert(model.into(), limit);
        self
    }

    pub fn quota_reset_interval_secs(mut self, secs: u64) -> Self {
        self.config.quotas.reset_interval_secs = secs;
        self
    }

    pub fn token_limit(mut self, model: impl Into<String>, limit: usize) -> Self {
        self.config.models.token_limits.insert(model.into(), limit);
        self
    }

    pub fn economic_mode(mut self, enabled: bool) -> Self {
        self.config.workflow.economic_mode = enabled;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
