//! Model request structures

use crate::selector::Complexity;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// What is sent to the model: a bare completion prompt or a chat history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Prompt(String),
    Messages(Vec<Message>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Prompt(prompt) => prompt.is_empty(),
            Payload::Messages(messages) => messages.is_empty(),
        }
    }
}

/// Task metadata consumed by the optimizer before the call is made.
///
/// None of this reaches the provider; it only steers model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHints {
    /// Explicit complexity; derived from `task_name` when absent
    pub complexity: Option<Complexity>,
    /// Substring matched against model ids ("openai", "anthropic", "deepseek")
    pub provider_preference: Option<String>,
    /// Task name, possibly merged ("draft_and_review")
    pub task_name: Option<String>,
    /// Replace `ModelRequest::model` with the selector's choice
    pub auto_select_model: bool,
}

impl Default for TaskHints {
    fn default() -> Self {
        Self {
            complexity: None,
            provider_preference: None,
            task_name: None,
            auto_select_model: true,
        }
    }
}

/// Request handed to a [`ModelInvoker`](super::ModelInvoker)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Model identifier, e.g. "gpt-4-turbo"
    pub model: String,

    /// Prompt or chat messages
    pub payload: Payload,

    /// Provider parameters passed through untouched (temperature, max_tokens, ...)
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Selection metadata
    #[serde(default)]
    pub hints: TaskHints,
}

impl ModelRequest {
    pub fn prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            payload: Payload::Prompt(prompt.into()),
            params: Map::new(),
            hints: TaskHints::default(),
        }
    }

    pub fn chat(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            payload: Payload::Messages(messages),
            params: Map::new(),
            hints: TaskHints::default(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_task(mut self, task_name: impl Into<String>) -> Self {
        self.hints.task_name = Some(task_name.into());
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.hints.complexity = Some(complexity);
        self
    }

    pub fn with_provider_preference(mut self, provider: impl Into<String>) -> Self {
        self.hints.provider_preference = Some(provider.into());
        self
    }

    /// Keep the caller's model instead of asking the selector
    pub fn with_fixed_model(mut self) -> Self {
        self.hints.auto_select_model = false;
        self
    }

    /// Parameter mapping used as the response-cache key.
    ///
    /// Contains the payload under "prompt" or "messages" plus the pass-through
    /// params. The model is only part of the key when it is pinned; an
    /// auto-selected model would split otherwise identical calls.
    pub fn cache_params(&self) -> Value {
        let mut map = self.params.clone();
        if !self.hints.auto_select_model {
            map.insert("model".to_string(), json!(self.model));
        }
        match &self.payload {
            Payload::Prompt(prompt) => {
                map.insert("prompt".to_string(), json!(prompt));
            }
            Payload::Messages(messages) => {
                map.insert("messages".to_string(), json!(messages));
            }
        }
        Value::Object(map)
    }
}
