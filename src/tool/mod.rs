use crate::mcp::{McpClient, create_mcp_tools};
use crate::message::ToolDefinition;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub output: String,
    pub title: Option<String>,
    pub metadata: Option<Value>,
}

impl ToolOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            title: None,
            metadata: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub tool_call_id: String,
    /// Cancelled when the turn is aborted
    pub abort: CancellationToken,
}

/// A tool that can be executed by the agent
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what's sent to the API)
    fn name(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str;

    /// JSON Schema for the input parameters
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given input
    async fn execute(&self, input: Value, ctx: ToolContext) -> Result<ToolOutput>;

    /// Convert to API tool definition
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}

/// Registry of available tools (Arc-wrapped for sharing)
#[derive(Clone, Default)]
pub struct Registry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under `name` (MCP tools use `mcp__server__tool`)
    pub async fn register(&self, name: String, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().await;
        tools.insert(name, tool);
    }

    /// Register every tool the given MCP servers advertise
    pub async fn register_mcp_tools(&self, clients: &[Arc<dyn McpClient>]) -> usize {
        let tools = create_mcp_tools(clients).await;
        let count = tools.len();
        for (name, tool) in tools {
            self.register(name, tool).await;
        }
        crate::logging::info(&format!(
            "MCP: registered {} tool(s) from {} server(s)",
            count,
            clients.len()
        ));
        count
    }

    /// Tools sorted by name, minus any the filter maps to `false`
    pub async fn enabled(&self, filter: &HashMap<String, bool>) -> Vec<(String, Arc<dyn Tool>)> {
        let tools = self.tools.read().await;
        let mut enabled: Vec<(String, Arc<dyn Tool>)> = tools
            .iter()
            .filter(|(name, _)| filter.get(*name).copied().unwrap_or(true))
            .map(|(name, tool)| (name.clone(), tool.clone()))
            .collect();
        // Sort by name for deterministic ordering - critical for prompt cache hits
        enabled.sort_by(|a, b| a.0.cmp(&b.0));
        enabled
    }

    /// Get all tool definitions for the API
    pub async fn definitions(&self, filter: &HashMap<String, bool>) -> Vec<ToolDefinition> {
        self.enabled(filter)
            .await
            .into_iter()
            .map(|(name, tool)| {
                let mut def = tool.to_definition();
                // Registry key wins: MCP tools report their raw name
                def.name = name;
                def
            })
            .collect()
    }
}
