//! LLM oracle: the trait the investigation loop talks to, and an HTTP pipe
//! client implementing it.

mod client;
mod types;

pub use client::PipeClient;
pub use types::{Message, MessageRole, PipeRequest, PipeResponse};

use async_trait::async_trait;

use crate::error::LlmResult;

/// Text-completion oracle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmOracle: Send + Sync {
    /// Complete the conversation in `messages` and return the response text.
    async fn complete(&self, messages: &[Message]) -> LlmResult<String>;
}
