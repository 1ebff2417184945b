//! Ollama API client (http://127.0.0.1:11434 by default).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatResponse, LlmBackend, LlmError, ToolDefinition};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Client for Ollama's `/api/chat` endpoint.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    /// How long Ollama keeps the model loaded between turns (e.g. "5m").
    keep_alive: Option<String>,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            keep_alive: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = Some(keep_alive.into());
        self
    }

    fn request<'a>(&'a self, model: &'a str, messages: Vec<ChatMessage>, tools: Option<Vec<ToolDefinition>>) -> ChatRequest<'a> {
        ChatRequest {
            model,
            messages,
            stream: false,
            tools,
            keep_alive: self.keep_alive.as_deref(),
        }
    }
}

#[async_trait]
impl LlmBackend for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    /// Non-streaming chat; tool calls come back in `message.tool_calls`.
    async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(&self.request(model, messages, tools))
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let detail = res
                .json::<ErrorBody>()
                .await
                .map(|b| b.error)
                .unwrap_or_else(|_| "no error detail".to_string());
            return Err(LlmError::Api(format!("ollama {}: {}", status, detail)));
        }
        let mut data: ChatResponse = res.json().await.map_err(|e| LlmError::Decode(e.to_string()))?;
        if data.message.is_none() {
            return Err(LlmError::Decode("response has no message".to_string()));
        }
        assign_call_ids(&mut data);
        Ok(data)
    }
}

/// Ollama omits call ids; give each call a unique one so results can be paired.
fn assign_call_ids(response: &mut ChatResponse) {
    let Some(calls) = response.message.as_mut().and_then(|m| m.tool_calls.as_mut()) else {
        return;
    };
    for call in calls.iter_mut().filter(|c| c.id.is_empty()) {
        call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}
