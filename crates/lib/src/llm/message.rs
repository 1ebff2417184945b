//! Chat transcript and tool-call wire types shared by all backends.

use serde::{Deserialize, Serialize};

/// One tool/function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id used to pair the eventual tool result.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub typ: String,
    pub function: ToolCallFunction,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as JSON object or JSON-encoded string (model-dependent). Validated by the executor.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            typ: default_call_type(),
            function: ToolCallFunction {
                name: name.into(),
                arguments,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// When role is "tool", the id of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// When role is "tool", the name of the tool (Ollama expects "tool_name").
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "tool_name")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::plain("assistant", content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            tool_name: Some(name.into()),
            ..Self::plain("tool", content)
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == "user"
    }
}

/// Tool definition presented to the model (function-calling).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub typ: String,
    pub function: ToolFunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            typ: "function".to_string(),
            function: ToolFunctionDefinition {
                name: name.to_string(),
                description: Some(description.to_string()),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub done: bool,
}

impl ChatResponse {
    /// Final-answer response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            message: Some(ChatMessage::assistant(content)),
            done: true,
        }
    }

    /// Tool-call response.
    pub fn tool_calls_only(calls: Vec<ToolCall>) -> Self {
        Self {
            message: Some(ChatMessage::assistant_with_tools("", calls)),
            done: true,
        }
    }

    /// Text content of the assistant message, if any.
    pub fn content(&self) -> &str {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    /// Parsed tool/function calls from the assistant message, if any.
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.message
            .as_ref()
            .and_then(|m| m.tool_calls.as_deref())
            .unwrap_or(&[])
    }
}
