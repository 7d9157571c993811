//! Cheap check of whether content already follows a set of guidelines,
//! used to skip a revision call when it would change little.

use regex::Regex;
use std::sync::OnceLock;
use tracing::info;

fn heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)##\s+(.+?)\s*$").expect("static regex"))
}

fn bullet() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*[-*]\s+(.+?)\s*$").expect("static regex"))
}

fn bold() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*(.+?)\*\*").expect("static regex"))
}

/// Markdown headings, bullet items and bold spans of `guidelines`
pub fn extract_key_points(guidelines: &str) -> Vec<String> {
    let mut points = Vec::new();
    for re in [heading(), bullet(), bold()] {
        points.extend(re.captures_iter(guidelines).map(|c| c[1].to_string()));
    }
    points
}

/// Share of key points found verbatim (case-insensitive) in `content`
pub fn adherence_score(content: &str, guidelines: &str) -> f64 {
    let points = extract_key_points(guidelines);
    let content = content.to_lowercase();
    let matches = points
        .iter()
        .filter(|p| content.contains(&p.to_lowercase()))
        .count();

    let score = matches as f64 / points.len().max(1) as f64;
    info!(
        "Guideline adherence: {:.2} ({}/{} points)",
        score,
        matches,
        points.len()
    );
    score
}

/// Whether `content` covers at least `threshold` of the key points
pub fn adheres_to_guidelines(content: &str, guidelines: &str, threshold: f64) -> bool {
    if content.is_empty() || guidelines.is_empty() {
        return false;
    }
    adherence_score(content, guidelines) >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUIDELINES: &str = "## Tone\nBe friendly.\n\n- Short sentences\n* Active voice\n\nAlways add a **summary**.";

    #[test]
    fn test_extract_key_points() {
        assert_eq!(
            extract_key_points(GUIDELINES),
            vec!["Tone", "Short sentences", "Active voice", "summary"]
        );
    }

    #[test]
    fn test_adherence() {
        let content = "A friendly tone, short sentences, active voice and a summary.";
        assert!((adherence_score(content, GUIDELINES) - 1.0).abs() < 1e-9);
        assert!(adheres_to_guidelines(content, GUIDELINES, 0.85));

        let partial = "Tone and a summary.";
        assert!((adherence_score(partial, GUIDELINES) - 0.5).abs() < 1e-9);
        assert!(!adheres_to_guidelines(partial, GUIDELINES, 0.85));
    }

    #[test]
    fn test_empty_inputs_never_adhere() {
        assert!(!adheres_to_guidelines("", GUIDELINES, 0.0));
        assert!(!adheres_to_guidelines("text", "", 0.0));
    }
}
