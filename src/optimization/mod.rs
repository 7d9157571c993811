//! Prompt and chat-history trimming
//!
//! Two levels of rewriting: a light pass (whitespace, boilerplate phrases)
//! for prompts comfortably inside the model window, and an aggressive pass
//! (extended phrase list, example truncation, hard truncation) for prompts
//! near the ceiling. Chat histories are fitted by dropping older turns.

mod strategies;

pub use strategies::{collapse_whitespace, strip_phrases, truncate_chars, truncate_examples};

use crate::api::{Message, Role};
use crate::config::OptimizerSettings;
use crate::tokens::{TokenAccountant, MESSAGE_OVERHEAD_TOKENS};
use serde::Serialize;
use tracing::{info, warn};

/// Token counts before and after one rewrite
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OptimizationStats {
    pub original_tokens: usize,
    pub optimized_tokens: usize,
    pub tokens_saved: usize,
}

impl OptimizationStats {
    pub fn new(original: usize, optimized: usize) -> Self {
        Self {
            original_tokens: original,
            optimized_tokens: optimized,
            tokens_saved: original.saturating_sub(optimized),
        }
    }

    /// Percentage of tokens removed
    pub fn reduction_percentage(&self) -> f64 {
        if self.original_tokens == 0 {
            return 0.0;
        }
        self.tokens_saved as f64 / self.original_tokens as f64 * 100.0
    }
}

/// Rewrites prompts and message lists to fit model windows
#[derive(Debug, Clone)]
pub struct PromptOptimizer {
    tokens: TokenAccountant,
    settings: OptimizerSettings,
}

impl PromptOptimizer {
    pub fn new(tokens: TokenAccountant, settings: OptimizerSettings) -> Self {
        Self { tokens, settings }
    }

    pub fn tokens(&self) -> &TokenAccountant {
        &self.tokens
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    /// Whitespace collapse and short-list phrase stripping
    pub fn light_optimize(&self, text: &str) -> String {
        let collapsed = collapse_whitespace(text);
        collapse_whitespace(&strip_phrases(&collapsed, &self.settings.redundant_phrases))
    }

    /// Rewrite `prompt` for `model`; see [`optimize_prompt_with_stats`](Self::optimize_prompt_with_stats)
    pub fn optimize_prompt(&self, prompt: &str, model: &str) -> String {
        self.optimize_prompt_with_stats(prompt, model).0
    }

    /// Light pass below the aggressive threshold of the model window.
    /// Above it, the extended phrase list and example truncation apply and
    /// the result is cut to the optimize threshold of the window.
    pub fn optimize_prompt_with_stats(&self, prompt: &str, model: &str) -> (String, OptimizationStats) {
        let limit = self.tokens.limit(model);
        let original = self.tokens.count(prompt, model);

        let optimized = if (original as f64) < limit as f64 * self.settings.aggressive_threshold {
            self.light_optimize(prompt)
        } else {
            warn!(
                "Long prompt for {}: {} tokens (limit {})",
                model, original, limit
            );

            let phrases: Vec<&String> = self
                .settings
                .redundant_phrases
                .iter()
                .chain(&self.settings.aggressive_phrases)
                .collect();
            let stripped = collapse_whitespace(&strip_phrases(&collapse_whitespace(prompt), &phrases));
            let trimmed = truncate_examples(&stripped, self.settings.example_max_chars);

            let max_allowed = self.max_allowed(limit);
            let current = self.tokens.count(&trimmed, model);
            if current > max_allowed {
                warn!("Truncating prompt from {} to {} tokens", current, max_allowed);
                self.tokens.truncate(&trimmed, max_allowed, model)
            } else {
                trimmed
            }
        };

        let stats = OptimizationStats::new(original, self.tokens.count(&optimized, model));
        info!(
            "Prompt optimized from {} to {} tokens ({:.1}% reduction)",
            stats.original_tokens,
            stats.optimized_tokens,
            stats.reduction_percentage()
        );
        (optimized, stats)
    }

    /// Token budget kept for the prompt when the window must leave room
    /// for the response
    pub fn max_allowed(&self, limit: usize) -> usize {
        (limit as f64 * self.settings.optimize_threshold) as usize
    }

    /// Fit a chat history into `max_tokens` (default: the model window),
    /// reserving a share of it for the response.
    ///
    /// Keeps the system message (capped to a share of the budget) and the
    /// last user message (truncated to what remains), then re-admits
    /// assistant turns newest-first and earlier user turns newest-first
    /// while they fit. The kept messages stay in their original order.
    pub fn optimize_messages(&self, messages: &[Message], model: &str, max_tokens: Option<usize>) -> Vec<Message> {
        if messages.is_empty() {
            return Vec::new();
        }

        let max_tokens = max_tokens.unwrap_or_else(|| self.tokens.limit(model));
        let reserve = (max_tokens as f64 * self.settings.response_reserve) as usize;
        let available = max_tokens.saturating_sub(reserve);

        if self.tokens.count_messages(messages, model) <= available {
            return messages.to_vec();
        }

        let system = messages.iter().rposition(|m| m.role == Role::System);
        let users: Vec<usize> = positions(messages, Role::User);
        let assistants: Vec<usize> = positions(messages, Role::Assistant);

        let Some(&last_user) = users.last() else {
            warn!("No user message to keep, sending only the first message");
            return messages[..1].to_vec();
        };

        let mut kept: Vec<(usize, Message)> = Vec::new();
        let mut used = 0;

        if let Some(index) = system {
            let mut message = messages[index].clone();
            let cap = (available as f64 * self.settings.system_share) as usize;
            if self.message_tokens(&message, model) > cap {
                message.content = self.fit_content(&message.content, cap, model);
            }
            used += self.message_tokens(&message, model);
            kept.push((index, message));
        }

        let mut last = messages[last_user].clone();
        if used + self.message_tokens(&last, model) > available {
            last.content = self.fit_content(&last.content, available.saturating_sub(used), model);
        }
        used += self.message_tokens(&last, model);
        kept.push((last_user, last));

        let mut remaining = available.saturating_sub(used);
        let older_users = &users[..users.len() - 1];
        for group in [&assistants[..], older_users] {
            for &index in group.iter().rev() {
                let needed = self.message_tokens(&messages[index], model);
                if needed > remaining {
                    break;
                }
                remaining -= needed;
                kept.push((index, messages[index].clone()));
            }
        }

        kept.sort_by_key(|(index, _)| *index);
        info!(
            "Fitted {} messages into {} of {} tokens",
            kept.len(),
            available - remaining,
            available
        );
        kept.into_iter().map(|(_, message)| message).collect()
    }

    /// System message plus last user message, each run through
    /// [`optimize_prompt`](Self::optimize_prompt)
    pub fn reduce_to_essentials(&self, messages: &[Message], model: &str) -> Vec<Message> {
        essentials(messages)
            .into_iter()
            .map(|m| Message::new(m.role, self.optimize_prompt(&m.content, model)))
            .collect()
    }

    /// Drastic cut used after a context overflow: system message and last
    /// user message truncated to the emergency token caps
    pub fn emergency_messages(&self, messages: &[Message], model: &str) -> Vec<Message> {
        essentials(messages)
            .into_iter()
            .map(|m| {
                let cap = match m.role {
                    Role::System => self.settings.emergency_system_tokens,
                    _ => self.settings.emergency_user_tokens,
                };
                Message::new(m.role, self.tokens.truncate(&m.content, cap, model))
            })
            .collect()
    }

    fn message_tokens(&self, message: &Message, model: &str) -> usize {
        self.tokens.count(&message.content, model) + MESSAGE_OVERHEAD_TOKENS
    }

    fn fit_content(&self, content: &str, message_budget: usize, model: &str) -> String {
        let budget = message_budget.saturating_sub(MESSAGE_OVERHEAD_TOKENS);
        self.tokens.truncate(content, budget, model)
    }
}

fn positions(messages: &[Message], role: Role) -> Vec<usize> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == role)
        .map(|(i, _)| i)
        .collect()
}

/// Last system message and last user message, in that order
fn essentials(messages: &[Message]) -> Vec<&Message> {
    let system = messages.iter().rev().find(|m| m.role == Role::System);
    let user = messages.iter().rev().find(|m| m.role == Role::User);
    system.into_iter().chain(user).collect()
}
