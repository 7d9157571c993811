//! Task complexity and provider affinity

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

const HIGH_TASKS: &[&str] = &["expert_review", "technical_draft"];
const MEDIUM_TASKS: &[&str] = &["research", "draft", "edit", "review"];
const LOW_TASKS: &[&str] = &["outline", "finalize", "optimize", "brainstorm"];

const OPENAI_TASKS: &[&str] = &["research", "outline", "finalize"];
const ANTHROPIC_TASKS: &[&str] = &["draft", "technical_draft", "edit"];
const DEEPSEEK_TASKS: &[&str] = &["research", "draft", "finalize"];

/// How capable a model a task needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// Default tier for this complexity (0 = most capable)
    pub fn tier_index(self) -> usize {
        match self {
            Complexity::High => 0,
            Complexity::Medium => 1,
            Complexity::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::High => "high",
            Complexity::Medium => "medium",
            Complexity::Low => "low",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Complexity::High),
            "medium" => Ok(Complexity::Medium),
            "low" => Ok(Complexity::Low),
            other => Err(format!("unknown complexity '{}'", other)),
        }
    }
}

fn classify_single(task: &str) -> Complexity {
    if HIGH_TASKS.contains(&task) {
        Complexity::High
    } else if LOW_TASKS.contains(&task) {
        Complexity::Low
    } else {
        if !MEDIUM_TASKS.contains(&task) {
            debug!("Unknown task '{}', treating it as medium complexity", task);
        }
        Complexity::Medium
    }
}

/// Complexity of a task name; merged names take their hardest subtask.
pub fn classify(task_name: &str, separator: &str) -> Complexity {
    subtasks(task_name, separator)
        .map(classify_single)
        .max()
        .unwrap_or(Complexity::Medium)
}

/// Provider best suited to a task, if any.
///
/// In economic mode only "deepseek" is ever suggested. Otherwise merged
/// names vote between "openai" and "anthropic" and a tie means no
/// preference.
pub fn preferred_provider(task_name: &str, separator: &str, economic_mode: bool) -> Option<&'static str> {
    let parts: Vec<&str> = subtasks(task_name, separator).collect();

    if economic_mode {
        return parts
            .iter()
            .any(|t| DEEPSEEK_TASKS.contains(t))
            .then_some("deepseek");
    }

    let openai = parts.iter().filter(|t| OPENAI_TASKS.contains(t)).count();
    let anthropic = parts.iter().filter(|t| ANTHROPIC_TASKS.contains(t)).count();

    match openai.cmp(&anthropic) {
        std::cmp::Ordering::Greater => Some("openai"),
        std::cmp::Ordering::Less => Some("anthropic"),
        std::cmp::Ordering::Equal => None,
    }
}

fn subtasks<'a>(task_name: &'a str, separator: &'a str) -> impl Iterator<Item = &'a str> {
    let parts: Box<dyn Iterator<Item = &'a str>> = if separator.is_empty() {
        Box::new(std::iter::once(task_name))
    } else {
        Box::new(task_name.split(separator))
    };
    parts.filter(|t| !t.is_empty())
}
