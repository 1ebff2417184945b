//! OpenAI-compatible chat completions client (`/v1/chat/completions`).
//!
//! Works against OpenAI itself and local servers exposing the same API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatResponse, LlmBackend, LlmError, ToolCall, ToolDefinition};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAiChatRequest {
            model: model.to_string(),
            messages: messages_to_openai(&messages),
            stream: false,
            tools: tools.map(tool_definitions_to_openai),
        };
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} {}", status, body)));
        }
        let data: OpenAiChatResponse = res
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;
        openai_response_to_chat_response(data)
    }
}

// --- OpenAI wire types ---

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
enum OpenAiMessage {
    System { content: String },
    User { content: String },
    Assistant {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCallRef>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallRef {
    id: String,
    #[serde(rename = "type")]
    typ: String,
    function: OpenAiToolCallFunctionRef,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallFunctionRef {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    typ: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

/// Arguments go over the wire as a JSON-encoded string.
fn arguments_to_string(arguments: &serde_json::Value) -> String {
    match arguments {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

fn messages_to_openai(messages: &[ChatMessage]) -> Vec<OpenAiMessage> {
    messages
        .iter()
        .map(|m| match m.role.as_str() {
            "system" => OpenAiMessage::System {
                content: m.content.clone(),
            },
            "assistant" => OpenAiMessage::Assistant {
                content: m.content.clone(),
                tool_calls: m.tool_calls.as_ref().map(|tcs| {
                    tcs.iter()
                        .map(|tc| OpenAiToolCallRef {
                            id: tc.id.clone(),
                            typ: "function".to_string(),
                            function: OpenAiToolCallFunctionRef {
                                name: tc.function.name.clone(),
                                arguments: arguments_to_string(&tc.function.arguments),
                            },
                        })
                        .collect()
                }),
            },
            "tool" => OpenAiMessage::Tool {
                tool_call_id: m.tool_call_id.clone().unwrap_or_default(),
                content: m.content.clone(),
            },
            _ => OpenAiMessage::User {
                content: m.content.clone(),
            },
        })
        .collect()
}

fn tool_definitions_to_openai(tools: Vec<ToolDefinition>) -> Vec<OpenAiTool> {
    tools
        .into_iter()
        .map(|t| OpenAiTool {
            typ: t.typ,
            function: OpenAiToolFunction {
                name: t.function.name,
                description: t.function.description,
                parameters: t.function.parameters,
            },
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Option<Vec<OpenAiChoice>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseToolCall {
    id: Option<String>,
    function: Option<OpenAiResponseToolCallFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseToolCallFunction {
    name: Option<String>,
    arguments: Option<String>,
}

fn openai_response_to_chat_response(data: OpenAiChatResponse) -> Result<ChatResponse, LlmError> {
    let message = data
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message)
        .ok_or_else(|| LlmError::Decode("response has no choices".to_string()))?;
    let content = message.content.unwrap_or_default();
    let tool_calls: Option<Vec<ToolCall>> = message.tool_calls.map(|tcs| {
        tcs.into_iter()
            .filter_map(|tc| {
                let function = tc.function?;
                let name = function.name?;
                let id = tc
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                // Kept as the raw string; the executor parses it against the tool schema.
                let arguments = serde_json::Value::String(function.arguments.unwrap_or_default());
                Some(ToolCall::new(id, name, arguments))
            })
            .collect()
    });
    let tool_calls = tool_calls.filter(|tcs| !tcs.is_empty());
    Ok(ChatResponse {
        message: Some(match tool_calls {
            Some(calls) => ChatMessage::assistant_with_tools(content, calls),
            None => ChatMessage::assistant(content),
        }),
        done: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_results_keep_their_call_ids() {
        let call = ToolCall::new("call_a", "list_dir", serde_json::json!({"path": "."}));
        let messages = vec![
            ChatMessage::user("list files"),
            ChatMessage::assistant_with_tools("", vec![call]),
            ChatMessage::tool_result("call_a", "list_dir", "a.txt"),
        ];
        let wire = serde_json::to_value(messages_to_openai(&messages)).unwrap();
        assert_eq!(wire[1]["tool_calls"][0]["id"], "call_a");
        assert_eq!(wire[1]["tool_calls"][0]["function"]["arguments"], "{\"path\":\".\"}");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "call_a");
    }

    #[test]
    fn response_with_tool_calls_keeps_raw_arguments() {
        let data: OpenAiChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "exec", "arguments": "{\"command\":\"ls\"}"}
                    }]
                }
            }]
        }))
        .unwrap();
        let response = openai_response_to_chat_response(data).unwrap();
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(
            calls[0].function.arguments,
            serde_json::Value::String("{\"command\":\"ls\"}".to_string())
        );
    }

    #[test]
    fn empty_choices_is_a_decode_error() {
        let data: OpenAiChatResponse = serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        assert!(matches!(
            openai_response_to_chat_response(data),
            Err(LlmError::Decode(_))
        ));
    }
}
