//! Model response structures

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response returned by a model invoker.
///
/// The body is opaque to the optimizer; only `usage` is read, for cost
/// accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Provider output, untouched
    pub body: Value,

    /// Token usage, when the provider reports it
    #[serde(default)]
    pub usage: Option<TokenUsage>,

    /// Model that produced the response
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens in the response
    pub completion_tokens: u32,
}

impl ModelResponse {
    pub fn new(model: impl Into<String>, body: Value) -> Self {
        Self {
            body,
            usage: None,
            model: model.into(),
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = Some(TokenUsage::new(prompt_tokens, completion_tokens));
        self
    }
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}
