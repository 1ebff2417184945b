//! LLM abstraction: chat message types, the backend trait, and provider clients.
//!
//! Backends speak one tool-calling protocol: the agent sends the transcript plus tool
//! definitions; the response is either final text or one or more tool calls with ids.

mod message;
mod ollama;
mod openai;

use async_trait::async_trait;

pub use message::{
    ChatMessage, ChatResponse, ToolCall, ToolCallFunction, ToolDefinition, ToolFunctionDefinition,
};
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

/// Provider fault. Aborts the current agent turn; the transcript is kept.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider api error: {0}")]
    Api(String),
    #[error("provider response invalid: {0}")]
    Decode(String),
}

/// A chat-completion backend with function calling.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Short name for logs (e.g. "ollama").
    fn name(&self) -> &str;

    async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChatResponse, LlmError>;
}
