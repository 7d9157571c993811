//! Cache keys from normalized call parameters

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Lowercase and collapse whitespace runs
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Copy of `params` with the "prompt" string and every chat message
/// "content" string normalized. Other fields are left untouched.
pub fn normalize(params: &Value) -> Value {
    let mut normalized = params.clone();

    if let Some(map) = normalized.as_object_mut() {
        if let Some(Value::String(prompt)) = map.get_mut("prompt") {
            *prompt = normalize_text(prompt);
        }

        if let Some(Value::Array(messages)) = map.get_mut("messages") {
            for message in messages.iter_mut() {
                if let Some(Value::String(content)) = message.get_mut("content") {
                    *content = normalize_text(content);
                }
            }
        }
    }

    normalized
}

/// `{prefix}_{sha256 of the normalized params}`.
///
/// Object keys serialize in sorted order, so the hash does not depend on
/// the order in which callers built the mapping.
pub fn fingerprint(prefix: &str, params: &Value) -> String {
    let canonical = normalize(params).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{}_{}", prefix, hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_whitespace_and_case_do_not_change_key() {
        let a = json!({"prompt": "Summarize quantum computing advances in 2024 for a general audience"});
        let b = json!({"prompt": "summarize   quantum computing   advances in 2024\nfor a general audience"});
        assert_eq!(fingerprint("prompt", &a), fingerprint("prompt", &b));
    }

    #[test]
    fn test_message_contents_are_normalized() {
        let a = json!({"messages": [{"role": "user", "content": "Hello  World"}], "temperature": 0.3});
        let b = json!({"temperature": 0.3, "messages": [{"role": "user", "content": "hello world "}]});
        assert_eq!(fingerprint("chat", &a), fingerprint("chat", &b));
    }

    #[test]
    fn test_other_fields_and_prefix_matter() {
        let a = json!({"prompt": "hi", "temperature": 0.3});
        let b = json!({"prompt": "hi", "temperature": 0.7});
        assert_ne!(fingerprint("prompt", &a), fingerprint("prompt", &b));
        assert_ne!(fingerprint("prompt", &a), fingerprint("completion", &a));
        // roles are not normalized
        let c = json!({"messages": [{"role": "User", "content": "x"}]});
        let d = json!({"messages": [{"role": "user", "content": "x"}]});
        assert_ne!(fingerprint("chat", &c), fingerprint("chat", &d));
    }

    #[test]
    fn test_key_shape() {
        let key = fingerprint("search", &json!({"query": "rust"}));
        let (prefix, hash) = key.split_once('_').unwrap();
        assert_eq!(prefix, "search");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
