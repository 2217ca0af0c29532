//! PROVIDER: Message model and streaming chat contract
//!
//! The engine never speaks a concrete LLM wire format. It produces a typed
//! history of [`Message`]s and consumes a typed [`StreamEvent`] stream from
//! any [`Provider`] implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Provider failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("RATE LIMITED")]
    RateLimited,

    #[error("PROVIDER TIMEOUT")]
    Timeout,

    #[error("NETWORK ERROR: {0}")]
    Network(String),

    #[error("PROVIDER REJECTED: {0}")]
    Api(String),

    #[error("STREAM INTERRUPTED: {0}")]
    Stream(String),

    #[error("CORRUPTED RESPONSE")]
    InvalidResponse,
}

impl ProviderError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited
                | ProviderError::Timeout
                | ProviderError::Network(_)
                | ProviderError::Stream(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// Tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
    Canceled,
}

/// Answer to exactly one [`ToolCall`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    pub status: ToolStatus,
}

impl ToolResult {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self::with_status(call, content, ToolStatus::Success)
    }

    pub fn error(call: &ToolCall, content: impl Into<String>) -> Self {
        Self::with_status(call, content, ToolStatus::Error)
    }

    pub fn canceled(call: &ToolCall) -> Self {
        Self::with_status(call, "◆ CANCELED BEFORE COMPLETION", ToolStatus::Canceled)
    }

    fn with_status(call: &ToolCall, content: impl Into<String>, status: ToolStatus) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            status,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status != ToolStatus::Success
    }
}

/// One piece of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Reasoning { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// Conversation entry; append-only within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::Text { text: text.into() }])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::Text { text: text.into() }])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::Text { text: text.into() }])
    }

    /// Assistant turn with optional reasoning, text and tool calls
    pub fn assistant_turn(reasoning: &str, text: &str, calls: Vec<ToolCall>) -> Self {
        let mut parts = Vec::new();
        if !reasoning.is_empty() {
            parts.push(ContentPart::Reasoning {
                text: reasoning.to_string(),
            });
        }
        if !text.is_empty() {
            parts.push(ContentPart::Text {
                text: text.to_string(),
            });
        }
        parts.extend(calls.into_iter().map(ContentPart::ToolCall));
        Self::new(Role::Assistant, parts)
    }

    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self::new(
            Role::Tool,
            results.into_iter().map(ContentPart::ToolResult).collect(),
        )
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_results_iter(&self) -> impl Iterator<Item = &ToolResult> {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }
}

/// Why a streamed turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Canceled,
    Error,
}

/// One event of a streamed assistant turn
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    ToolCall(ToolCall),
    Finish(FinishReason),
}

/// Typed event stream returned by a provider
pub type ChatStream = BoxStream<'static, Result<StreamEvent>>;

/// Tool specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Request for one streamed assistant turn
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: None,
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Streaming chat backend
#[async_trait]
pub trait Provider: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream>;
    fn model(&self) -> String;
}

/// Build JSON schema of string properties
pub fn object_schema(properties: Vec<(String, String, bool)>) -> Value {
    let mut props = serde_json::Map::new();
    let mut required = Vec::new();

    for (name, description, is_required) in properties {
        props.insert(
            name.clone(),
            serde_json::json!({
                "type": "string",
                "description": description
            }),
        );
        if is_required {
            required.push(name);
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": props,
        "required": required
    })
}
