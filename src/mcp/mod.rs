//! MCP (Model Context Protocol) tool support
//!
//! The transport lives outside this crate; anything implementing `McpClient`
//! can contribute tools to the registry.

mod protocol;
mod tool;

pub use protocol::*;
pub use tool::{McpTool, create_mcp_tools};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// A connected MCP server
#[async_trait]
pub trait McpClient: Send + Sync {
    fn server_name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<McpToolDef>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult>;
}
