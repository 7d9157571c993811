//! Token counting, truncation and chunking
//!
//! Counting is exact when the cl100k tokenizer loads (it is used for every
//! model family, as the closest shared BPE). When it cannot be loaded the
//! accountant degrades to a word-based estimate of 1.3 tokens per word and
//! keeps working; the failure is logged once and never surfaced.

mod chunk;

use crate::api::{Message, Payload};
use crate::config::ModelSettings;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

/// Tokens per whitespace-separated word when no tokenizer is available
pub const TOKENS_PER_WORD: f64 = 1.3;

/// Role and framing tokens added per chat message
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

static CL100K: OnceLock<Option<Arc<CoreBPE>>> = OnceLock::new();

fn shared_encoder() -> Option<Arc<CoreBPE>> {
    CL100K
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(Arc::new(bpe)),
            Err(e) => {
                warn!("Failed to load cl100k tokenizer, using word estimate: {}", e);
                None
            }
        })
        .clone()
}

/// Word-based token estimate for `words` words
pub(crate) fn estimate_words(words: usize) -> usize {
    (words as f64 * TOKENS_PER_WORD) as usize
}

/// Counts, truncates and chunks text against per-model ceilings
#[derive(Clone)]
pub struct TokenAccountant {
    encoder: Option<Arc<CoreBPE>>,
    limits: BTreeMap<String, usize>,
    default_limit: usize,
}

impl TokenAccountant {
    /// Accountant with the exact tokenizer when it can be loaded
    pub fn new(models: &ModelSettings) -> Self {
        Self {
            encoder: shared_encoder(),
            limits: models.token_limits.clone(),
            default_limit: models.default_token_limit,
        }
    }

    /// Accountant that always uses the word-based estimate
    pub fn word_estimate(models: &ModelSettings) -> Self {
        Self {
            encoder: None,
            limits: models.token_limits.clone(),
            default_limit: models.default_token_limit,
        }
    }

    /// Whether counts for `model` come from a real tokenizer
    pub fn has_exact_tokenizer(&self, model: &str) -> bool {
        self.encoder_for(model).is_some()
    }

    fn encoder_for(&self, _model: &str) -> Option<&CoreBPE> {
        self.encoder.as_deref()
    }

    /// Token count of a plain text
    pub fn count(&self, text: &str, model: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        match self.encoder_for(model) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => estimate_words(text.split_whitespace().count()),
        }
    }

    /// Token count of a chat history, including per-message overhead
    pub fn count_messages(&self, messages: &[Message], model: &str) -> usize {
        messages
            .iter()
            .map(|m| self.count(&m.content, model) + MESSAGE_OVERHEAD_TOKENS)
            .sum()
    }

    pub fn count_payload(&self, payload: &Payload, model: &str) -> usize {
        match payload {
            Payload::Prompt(prompt) => self.count(prompt, model),
            Payload::Messages(messages) => self.count_messages(messages, model),
        }
    }

    /// Longest prefix of `text` that fits in `max_tokens`.
    ///
    /// Text already within budget is returned unchanged. Without a tokenizer
    /// the cut is made on the word estimate and the kept words are joined by
    /// single spaces, so line breaks in the kept part are not preserved.
    pub fn truncate(&self, text: &str, max_tokens: usize, model: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let current = self.count(text, model);
        if current <= max_tokens {
            return text.to_string();
        }

        if let Some(bpe) = self.encoder_for(model) {
            let tokens = bpe.encode_with_special_tokens(text);
            let mut end = max_tokens.min(tokens.len());
            while end > 0 {
                // A cut inside a multi-byte character does not decode, and a
                // decoded prefix may re-encode differently; step back until
                // both hold.
                if let Ok(prefix) = bpe.decode(tokens[..end].to_vec()) {
                    if bpe.encode_with_special_tokens(&prefix).len() <= max_tokens {
                        return prefix;
                    }
                }
                end -= 1;
            }
            return String::new();
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        let tokens_per_word = current as f64 / words.len() as f64;
        let mut keep = ((max_tokens as f64 / tokens_per_word) as usize).min(words.len());
        while keep > 0 && estimate_words(keep) > max_tokens {
            keep -= 1;
        }

        debug!(
            "Truncated {} words to {} to fit {} tokens",
            words.len(),
            keep,
            max_tokens
        );
        words[..keep].join(" ")
    }

    /// Split `text` into windows of at most `chunk_size` tokens, repeating
    /// `overlap` tokens of context between neighbours.
    ///
    /// Without a tokenizer the split follows paragraph boundaries first,
    /// then sentence boundaries, and cuts between words only as a last resort.
    pub fn chunk(&self, text: &str, chunk_size: usize, overlap: usize, model: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let chunk_size = chunk_size.max(1);
        if self.count(text, model) <= chunk_size {
            return vec![text.to_string()];
        }

        let chunks = match self.encoder_for(model) {
            Some(bpe) => chunk::by_tokens(bpe, text, chunk_size, overlap),
            None => chunk::by_boundaries(text, chunk_size, overlap),
        };

        debug!(
            "Split {} chars into {} chunks of <= {} tokens",
            text.len(),
            chunks.len(),
            chunk_size
        );
        chunks
    }

    /// Context ceiling for `model`
    pub fn limit(&self, model: &str) -> usize {
        self.limits
            .get(model)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

impl Default for TokenAccountant {
    fn default() -> Self {
        Self::new(&ModelSettings::default())
    }
}

impl std::fmt::Debug for TokenAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAccountant")
            .field("exact", &self.encoder.is_some())
            .field("models", &self.limits.len())
            .field("default_limit", &self.default_limit)
            .finish()
    }
}
