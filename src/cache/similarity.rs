//! Fuzzy parameter matching

use crate::config::CacheSettings;
use serde_json::Value;
use std::collections::HashSet;

/// Word-overlap rule deciding whether two calls may share a cached result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityRule {
    /// Minimum `|common| / max(|a|, |b|)` over distinct words
    pub threshold: f64,
    /// Texts shorter than this (in characters) must match exactly
    pub short_text_chars: usize,
}

impl Default for SimilarityRule {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            short_text_chars: 50,
        }
    }
}

impl From<&CacheSettings> for SimilarityRule {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            threshold: settings.similarity_threshold,
            short_text_chars: settings.short_text_chars,
        }
    }
}

enum TextMatch {
    Similar,
    Different,
    NoWords,
}

impl SimilarityRule {
    /// Whether two parameter mappings are close enough to reuse a result.
    ///
    /// Both must carry a "prompt" string, or both a "messages" array with
    /// the same roles in the same order. Anything else is never similar.
    /// A pinned "model" must be the same on both sides.
    pub fn params_similar(&self, a: &Value, b: &Value) -> bool {
        if a.get("model") != b.get("model") {
            return false;
        }

        if let (Some(pa), Some(pb)) = (a.get("prompt"), b.get("prompt")) {
            let pa = pa.as_str().unwrap_or_default();
            let pb = pb.as_str().unwrap_or_default();
            return matches!(self.compare_text(pa, pb), TextMatch::Similar);
        }

        if let (Some(ma), Some(mb)) = (a.get("messages"), b.get("messages")) {
            let (Some(ma), Some(mb)) = (ma.as_array(), mb.as_array()) else {
                return false;
            };
            if ma.len() != mb.len() {
                return false;
            }

            return ma.iter().zip(mb).all(|(x, y)| {
                if x.get("role") != y.get("role") {
                    return false;
                }
                let cx = x.get("content").and_then(Value::as_str).unwrap_or_default();
                let cy = y.get("content").and_then(Value::as_str).unwrap_or_default();
                // an empty long-form pair does not veto the match
                !matches!(self.compare_text(cx, cy), TextMatch::Different)
            });
        }

        false
    }

    /// Text-level half of the rule
    pub fn texts_similar(&self, a: &str, b: &str) -> bool {
        matches!(self.compare_text(a, b), TextMatch::Similar)
    }

    fn compare_text(&self, a: &str, b: &str) -> TextMatch {
        let a = a.to_lowercase();
        let b = b.to_lowercase();

        if a.chars().count() < self.short_text_chars || b.chars().count() < self.short_text_chars {
            return if a == b {
                TextMatch::Similar
            } else {
                TextMatch::Different
            };
        }

        let words_a: HashSet<&str> = a.split_whitespace().collect();
        let words_b: HashSet<&str> = b.split_whitespace().collect();
        if words_a.is_empty() || words_b.is_empty() {
            return TextMatch::NoWords;
        }

        let common = words_a.intersection(&words_b).count();
        let similarity = common as f64 / words_a.len().max(words_b.len()) as f64;

        if similarity >= self.threshold {
            TextMatch::Similar
        } else {
            TextMatch::Different
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TWENTY: &str = "the committee reviewed every quarterly report before the annual \
                          meeting and approved the revised budget for next fiscal year promptly";

    fn chat(content: &str) -> Value {
        json!({"messages": [
            {"role": "system", "content": "You are a helpful assistant."},
            {"role": "user", "content": content}
        ]})
    }

    #[test]
    fn test_short_text_needs_exact_match() {
        let rule = SimilarityRule::default();
        assert!(rule.texts_similar("Hello there", "hello there"));
        assert!(!rule.texts_similar("Hello there", "hello there!"));
    }

    #[test]
    fn test_one_word_difference_is_similar() {
        let rule = SimilarityRule::default();
        let changed = TWENTY.replace("approved", "rejected");
        assert_eq!(TWENTY.split_whitespace().count(), 20);
        assert!(rule.params_similar(&chat(TWENTY), &chat(&changed)));
    }

    #[test]
    fn test_more_than_thirty_percent_different_is_not_similar() {
        let rule = SimilarityRule::default();
        let changed = TWENTY
            .replace("committee", "board")
            .replace("reviewed", "skimmed")
            .replace("every", "one")
            .replace("quarterly", "monthly")
            .replace("report", "memo")
            .replace("annual", "weekly")
            .replace("approved", "rejected");
        assert!(!rule.params_similar(&chat(TWENTY), &chat(&changed)));
    }

    #[test]
    fn test_prompt_similarity() {
        let rule = SimilarityRule::default();
        let a = json!({"prompt": TWENTY});
        let b = json!({"prompt": TWENTY.to_uppercase()});
        assert!(rule.params_similar(&a, &b));
        assert!(!rule.params_similar(&a, &json!({"prompt": "short"})));
    }

    #[test]
    fn test_shape_mismatch_is_not_similar() {
        let rule = SimilarityRule::default();
        assert!(!rule.params_similar(&json!({"prompt": TWENTY}), &chat(TWENTY)));
        assert!(!rule.params_similar(&json!({"query": "x"}), &json!({"query": "x"})));

        let reordered = json!({"messages": [
            {"role": "user", "content": TWENTY},
            {"role": "system", "content": "You are a helpful assistant."}
        ]});
        assert!(!rule.params_similar(&chat(TWENTY), &reordered));

        let longer = json!({"messages": [{"role": "user", "content": TWENTY}]});
        assert!(!rule.params_similar(&chat(TWENTY), &longer));
    }

    #[test]
    fn test_pinned_models_must_agree() {
        let rule = SimilarityRule::default();
        let gpt = json!({"prompt": TWENTY, "model": "gpt-4"});
        let deepseek = json!({"prompt": TWENTY, "model": "deepseek-chat"});
        assert!(rule.params_similar(&gpt, &gpt.clone()));
        assert!(!rule.params_similar(&gpt, &deepseek));
        assert!(!rule.params_similar(&gpt, &json!({"prompt": TWENTY})));
    }

    #[test]
    fn test_threshold_is_configurable() {
        let strict = SimilarityRule {
            threshold: 1.0,
            short_text_chars: 50,
        };
        let changed = TWENTY.replace("approved", "rejected");
        assert!(!strict.params_similar(&chat(TWENTY), &chat(&changed)));
    }
}
