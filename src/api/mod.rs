//! The seam between the optimizer and whatever actually talks to a model
//!
//! The crate never opens a network connection itself. Callers implement
//! [`ModelInvoker`] over their provider client and hand it to the
//! [`CallOptimizer`](crate::orchestrator::CallOptimizer) or the cache.

mod request;
mod response;

pub use request::{Message, ModelRequest, Payload, Role, TaskHints};
pub use response::{ModelResponse, TokenUsage};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl InvokeError {
    /// Whether the message reads like a token/context-window overflow.
    ///
    /// Providers do not agree on an error code for this, so the check is
    /// textual: the message must mention tokens and one of limit, exceed or
    /// context length.
    pub fn is_context_overflow(&self) -> bool {
        let message = self.to_string().to_lowercase();
        message.contains("token")
            && (message.contains("limit")
                || message.contains("exceed")
                || message.contains("context length"))
    }
}

/// Anything that can turn a [`ModelRequest`] into a [`ModelResponse`].
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, InvokeError>;
}

#[async_trait]
impl<T: ModelInvoker + ?Sized> ModelInvoker for std::sync::Arc<T> {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, InvokeError> {
        (**self).invoke(request).await
    }
}
