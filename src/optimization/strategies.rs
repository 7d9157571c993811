//! Text rewriting helpers used by the prompt optimizer

use regex::Regex;
use std::sync::OnceLock;

fn example_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(example[^\n.:]*)[:\n]").expect("static regex"))
}

/// Collapse every whitespace run to one space and trim the ends
pub fn collapse_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut last_was_space = false;

    for c in text.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                result.push(' ');
                last_was_space = true;
            }
        } else {
            result.push(c);
            last_was_space = false;
        }
    }

    result.trim().to_string()
}

/// Remove every occurrence of each phrase (case-sensitive)
pub fn strip_phrases<S: AsRef<str>>(text: &str, phrases: &[S]) -> String {
    let mut result = text.to_string();
    for phrase in phrases {
        let phrase = phrase.as_ref();
        if !phrase.is_empty() {
            result = result.replace(phrase, "");
        }
    }
    result
}

/// Cut the body of every "Example ...:" section to `max_chars` characters.
///
/// A body runs from its heading to the next heading or the end of the text;
/// cut bodies end in "...".
pub fn truncate_examples(text: &str, max_chars: usize) -> String {
    let headings: Vec<_> = example_heading().find_iter(text).collect();
    if headings.is_empty() {
        return text.to_string();
    }

    let mut result = String::with_capacity(text.len());
    result.push_str(&text[..headings[0].start()]);

    for (i, heading) in headings.iter().enumerate() {
        let body_end = headings
            .get(i + 1)
            .map(|next| next.start())
            .unwrap_or(text.len());
        let body = &text[heading.end()..body_end];

        result.push_str(heading.as_str());
        result.push_str(&truncate_chars(body, max_chars));
    }

    result
}

/// First `max_chars` characters followed by "...", or the text unchanged
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a \n\n b\t c  "), "a b c");
        assert_eq!(collapse_whitespace(""), "");
    }

    #[test]
    fn test_strip_phrases() {
        let text = "Please provide a summary. Make sure to cite sources.";
        let stripped = strip_phrases(text, &["Please provide", "Make sure to"]);
        assert_eq!(collapse_whitespace(&stripped), "a summary. cite sources.");
        // case-sensitive
        assert_eq!(strip_phrases("please provide", &["Please provide"]), "please provide");
    }

    #[test]
    fn test_truncate_examples() {
        let long_body = "x".repeat(300);
        let text = format!("Intro text. Example 1: {} Example 2: short", long_body);
        let result = truncate_examples(&text, 200);

        assert!(result.starts_with("Intro text. Example 1:"));
        assert!(result.contains(&format!(" {}...", "x".repeat(199))));
        assert!(result.ends_with("Example 2: short"));
        assert!(result.len() < text.len());
    }

    #[test]
    fn test_truncate_examples_without_examples() {
        assert_eq!(truncate_examples("nothing to see", 10), "nothing to see");
    }

    #[test]
    fn test_truncate_chars_is_utf8_safe() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll...");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
