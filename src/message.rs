use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::id::{self, Prefix};

/// Result text substituted for tool invocations that never completed
pub const ABORTED_RESULT: &str = "request was aborted";

/// Role in conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A persisted message in a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub time: MessageTime,
    /// Tool execution records keyed by tool call id
    #[serde(default)]
    pub tool: BTreeMap<String, ToolMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant: Option<AssistantMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageTime {
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMetadata {
    pub system: Vec<String>,
    pub cost: f64,
    pub tokens: Tokens,
    #[serde(rename = "modelID")]
    pub model_id: String,
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tokens {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
}

impl Tokens {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.reasoning
    }
}

/// Timing plus whatever the tool reported (or `{error, message, title}` on failure)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolMeta {
    pub time: ToolTime,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolTime {
    pub start: i64,
    pub end: i64,
}

/// Error recorded on an assistant message; data, not a thrown error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[serde(tag = "name", content = "data")]
pub enum MessageError {
    #[error("{message}")]
    ProviderAuthError {
        #[serde(rename = "providerID")]
        provider_id: String,
        message: String,
    },
    #[error("{message}")]
    UnknownError { message: String },
}

/// Fragment of a message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolInvocation {
        #[serde(rename = "toolInvocation")]
        tool_invocation: ToolInvocation,
    },
    StepStart,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn tool_invocation(&self) -> Option<&ToolInvocation> {
        match self {
            Part::ToolInvocation { tool_invocation } => Some(tool_invocation),
            _ => None,
        }
    }
}

/// Lifecycle of a single tool call inside an assistant message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ToolInvocation {
    PartialCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    Call {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    Result {
        tool_call_id: String,
        tool_name: String,
        args: Value,
        result: String,
    },
}

impl ToolInvocation {
    pub fn tool_call_id(&self) -> &str {
        match self {
            ToolInvocation::PartialCall { tool_call_id, .. }
            | ToolInvocation::Call { tool_call_id, .. }
            | ToolInvocation::Result { tool_call_id, .. } => tool_call_id,
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            ToolInvocation::PartialCall { tool_name, .. }
            | ToolInvocation::Call { tool_name, .. }
            | ToolInvocation::Result { tool_name, .. } => tool_name,
        }
    }

    pub fn args(&self) -> &Value {
        match self {
            ToolInvocation::PartialCall { args, .. }
            | ToolInvocation::Call { args, .. }
            | ToolInvocation::Result { args, .. } => args,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, ToolInvocation::Result { .. })
    }

    pub fn result(&self) -> Option<&str> {
        match self {
            ToolInvocation::Result { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn with_result(&self, result: impl Into<String>) -> Self {
        ToolInvocation::Result {
            tool_call_id: self.tool_call_id().to_string(),
            tool_name: self.tool_name().to_string(),
            args: self.args().clone(),
            result: result.into(),
        }
    }
}

impl Message {
    pub fn user(session_id: &str, parts: Vec<Part>) -> Self {
        Self {
            id: id::ascending(Prefix::Message),
            role: Role::User,
            parts,
            metadata: MessageMetadata {
                session_id: session_id.to_string(),
                time: MessageTime {
                    created: now_ms(),
                    completed: None,
                },
                tool: BTreeMap::new(),
                assistant: None,
            },
        }
    }

    pub fn assistant(session_id: &str, assistant: AssistantMetadata) -> Self {
        Self {
            id: id::ascending(Prefix::Message),
            role: Role::Assistant,
            parts: Vec::new(),
            metadata: MessageMetadata {
                session_id: session_id.to_string(),
                time: MessageTime {
                    created: now_ms(),
                    completed: None,
                },
                tool: BTreeMap::new(),
                assistant: Some(assistant),
            },
        }
    }

    pub fn session_id(&self) -> &str {
        &self.metadata.session_id
    }

    pub fn is_summary(&self) -> bool {
        self.metadata
            .assistant
            .as_ref()
            .and_then(|a| a.summary)
            .unwrap_or(false)
    }

    pub fn tokens(&self) -> Option<Tokens> {
        self.metadata.assistant.as_ref().map(|a| a.tokens)
    }

    pub fn error(&self) -> Option<&MessageError> {
        self.metadata.assistant.as_ref().and_then(|a| a.error.as_ref())
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Tool definition for the API
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Token usage reported for one step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other,
}

/// Streaming event from provider
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text content delta
    TextDelta(String),
    /// Model started emitting a tool call; arguments not yet complete
    ToolCallStreamingStart {
        tool_call_id: String,
        tool_name: String,
    },
    /// Tool call with complete arguments
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    /// Tool result (provider already executed the tool)
    ToolResult {
        tool_call_id: String,
        result: String,
    },
    /// One model step completed
    StepFinish {
        usage: Usage,
        finish_reason: FinishReason,
    },
}
