//! MCP protocol types for tool listing and tool calls

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP Tool definition from server
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// tools/call result
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolCallResult {
    pub content: Vec<ContentBlock>,
    /// Server-provided metadata, carried into the tool record
    #[serde(rename = "_meta", default)]
    pub metadata: Option<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Text entries joined by a blank line; other content kinds are skipped
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Content block in tool result
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "resource")]
    Resource { resource: ResourceContent },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ResourceContent {
    pub uri: String,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub text: Option<String>,
    pub blob: Option<String>,
}
