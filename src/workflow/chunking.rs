//! Splitting long workflow content across several calls

use crate::api::Message;
use crate::config::{Config, WorkflowSettings};
use crate::tokens::{TokenAccountant, MESSAGE_OVERHEAD_TOKENS};
use std::future::Future;
use tracing::{info, warn};

/// Messages above this many tokens are summarized by head and tail
const LONG_MESSAGE_TOKENS: usize = 1000;
const SUMMARY_HEAD_TOKENS: usize = 300;
const SUMMARY_TAIL_CHARS: usize = 500;
const OMISSION_MARKER: &str = "[...intermediate content omitted to save tokens...]";

/// Position of a chunk within the content being processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: usize,
    pub total: usize,
}

impl ChunkInfo {
    /// Info for content processed in one piece
    pub fn whole() -> Self {
        Self { index: 0, total: 1 }
    }

    pub fn is_partial(&self) -> bool {
        self.total > 1
    }
}

/// Chunks content and trims agent conversations against model windows
#[derive(Debug, Clone)]
pub struct ContentChunker {
    tokens: TokenAccountant,
    chunk_share: f64,
    overlap: usize,
    message_threshold: f64,
}

impl ContentChunker {
    /// `message_threshold` is the share of the model window agent messages may use
    pub fn new(tokens: TokenAccountant, settings: &WorkflowSettings, message_threshold: f64) -> Self {
        Self {
            tokens,
            chunk_share: settings.chunk_share,
            overlap: settings.chunk_overlap,
            message_threshold,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            TokenAccountant::new(&config.models),
            &config.workflow,
            config.optimizer.optimize_threshold,
        )
    }

    fn default_chunk_size(&self, model: &str) -> usize {
        (self.tokens.limit(model) as f64 * self.chunk_share) as usize
    }

    /// Split `content` into chunks of at most `max_chunk` tokens (default: a
    /// share of the model window). Content that fits comes back whole.
    pub fn chunk_content(&self, content: &str, model: &str, max_chunk: Option<usize>) -> Vec<String> {
        if content.is_empty() {
            return Vec::new();
        }

        let max_chunk = max_chunk.unwrap_or_else(|| self.default_chunk_size(model));
        let tokens = self.tokens.count(content, model);
        if tokens <= max_chunk {
            return vec![content.to_string()];
        }

        info!("Splitting {} tokens into chunks of at most {}", tokens, max_chunk);
        self.tokens.chunk(content, max_chunk, self.overlap, model)
    }

    /// Run `f` on every chunk in order and join the results with blank lines
    pub async fn process_chunked<F, Fut, E>(&self, chunks: &[String], mut f: F) -> Result<String, E>
    where
        F: FnMut(String, ChunkInfo) -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let total = chunks.len();
        if total > 1 {
            info!("Processing {} chunks", total);
        }

        let mut results = Vec::with_capacity(total);
        for (index, chunk) in chunks.iter().enumerate() {
            if total > 1 {
                info!("Processing chunk {}/{}", index + 1, total);
            }
            results.push(f(chunk.clone(), ChunkInfo { index, total }).await?);
        }

        Ok(results.join("\n\n"))
    }

    /// Run `f` on `content` directly when it fits a share of the model
    /// window, otherwise chunk by chunk
    pub async fn process_content<F, Fut, E>(&self, content: &str, model: &str, mut f: F) -> Result<String, E>
    where
        F: FnMut(String, ChunkInfo) -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let tokens = self.tokens.count(content, model);
        if tokens <= self.default_chunk_size(model) {
            return f(content.to_string(), ChunkInfo::whole()).await;
        }

        warn!(
            "Content too long for {}: {} tokens (limit {})",
            model,
            tokens,
            self.tokens.limit(model)
        );
        let chunks = self.chunk_content(content, model, None);
        self.process_chunked(&chunks, f).await
    }

    /// Shrink a conversation between agents to fit the model window.
    ///
    /// Long messages are replaced by their head and tail; if that is not
    /// enough only the first and last messages are kept, and finally the
    /// last one is truncated.
    pub fn optimize_agent_messages(&self, messages: &[Message], model: &str) -> Vec<Message> {
        if messages.is_empty() {
            return Vec::new();
        }

        let limit = self.tokens.limit(model);
        let max_tokens = (limit as f64 * self.message_threshold) as usize;
        let total = self.tokens.count_messages(messages, model);
        if total <= max_tokens {
            return messages.to_vec();
        }

        warn!(
            "Agent messages too long: {} tokens (limit {})",
            total, limit
        );
        let summarized: Vec<Message> = messages
            .iter()
            .map(|m| Message::new(m.role, self.summarize(&m.content, model)))
            .collect();

        if self.tokens.count_messages(&summarized, model) <= max_tokens {
            return summarized;
        }

        warn!("Agent messages still too long after summarizing");
        self.reduce_to_ends(&summarized, model, max_tokens)
    }

    fn summarize(&self, content: &str, model: &str) -> String {
        let tokens = self.tokens.count(content, model);
        if tokens <= LONG_MESSAGE_TOKENS {
            return content.to_string();
        }

        let head = self.tokens.truncate(content, SUMMARY_HEAD_TOKENS, model);
        let tail = last_chars(content, SUMMARY_TAIL_CHARS);
        let summary = format!("{}\n\n{}\n\n{}", head, OMISSION_MARKER, tail);

        info!(
            "Message reduced from {} to {} tokens",
            tokens,
            self.tokens.count(&summary, model)
        );
        summary
    }

    fn reduce_to_ends(&self, messages: &[Message], model: &str, max_tokens: usize) -> Vec<Message> {
        let (first, last) = match messages {
            [] => return Vec::new(),
            [only] => (None, only),
            [first, .., last] => (Some(first), last),
        };

        let ends: Vec<Message> = first.into_iter().chain(Some(last)).cloned().collect();
        if ends.len() < messages.len() && self.tokens.count_messages(&ends, model) <= max_tokens {
            info!("Reduced {} messages to the first and last", messages.len());
            return ends;
        }

        let first_tokens = first
            .map(|m| self.tokens.count(&m.content, model) + MESSAGE_OVERHEAD_TOKENS)
            .unwrap_or(0);
        let budget = max_tokens.saturating_sub(first_tokens + MESSAGE_OVERHEAD_TOKENS);
        let trimmed = Message::new(last.role, self.tokens.truncate(&last.content, budget, model));

        first.cloned().into_iter().chain(Some(trimmed)).collect()
    }
}

/// Last `n` characters of `text`, or all of it when shorter
fn last_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    match text.char_indices().nth(count - n) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}
