//! MCP Tool - wraps MCP server tools for the tool registry

use super::McpClient;
use super::protocol::McpToolDef;
use crate::logging;
use crate::tool::{Tool, ToolContext, ToolOutput};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A tool that proxies to an MCP server
pub struct McpTool {
    tool_def: McpToolDef,
    client: Arc<dyn McpClient>,
}

impl McpTool {
    pub fn new(tool_def: McpToolDef, client: Arc<dyn McpClient>) -> Self {
        Self { tool_def, client }
    }

    /// Registry name (mcp__server__tool)
    pub fn prefixed_name(&self) -> String {
        format!("mcp__{}__{}", self.client.server_name(), self.tool_def.name)
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.tool_def.name
    }

    fn description(&self) -> &str {
        self.tool_def.description.as_deref().unwrap_or("MCP tool")
    }

    fn parameters_schema(&self) -> Value {
        self.tool_def.input_schema.clone()
    }

    async fn execute(&self, input: Value, _ctx: ToolContext) -> Result<ToolOutput> {
        let result = self.client.call_tool(&self.tool_def.name, input).await?;
        let output = result.text();
        if result.is_error {
            anyhow::bail!(output);
        }

        let title = format!("mcp:{}:{}", self.client.server_name(), self.tool_def.name);
        let mut tool_output = ToolOutput::new(output).with_title(title);
        if let Some(metadata) = result.metadata {
            tool_output = tool_output.with_metadata(metadata);
        }
        Ok(tool_output)
    }
}

/// Create registry entries for every tool each client advertises. A server whose
/// listing fails is logged and skipped.
pub async fn create_mcp_tools(clients: &[Arc<dyn McpClient>]) -> Vec<(String, Arc<dyn Tool>)> {
    let mut tools = Vec::new();
    for client in clients {
        let defs = match client.list_tools().await {
            Ok(defs) => defs,
            Err(e) => {
                logging::error(&format!(
                    "MCP '{}' failed to list tools: {}",
                    client.server_name(),
                    e
                ));
                continue;
            }
        };
        for tool_def in defs {
            let mcp_tool = McpTool::new(tool_def, Arc::clone(client));
            tools.push((mcp_tool.prefixed_name(), Arc::new(mcp_tool) as Arc<dyn Tool>));
        }
    }
    tools
}
