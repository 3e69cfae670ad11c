use crate::message::{Message, StreamEvent, ToolDefinition, Usage};
use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Stream of events from a provider
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Errors a provider raises that the engine treats specially
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Credentials missing or rejected; recorded on the message, never retried
    #[error("{provider_id}: {message}")]
    Auth {
        provider_id: String,
        message: String,
    },
}

/// Context and output limits, in tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimit {
    pub context: u64,
    pub output: u64,
}

/// Pricing in USD per million tokens
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInfo {
    pub limit: ModelLimit,
    pub cost: ModelCost,
}

impl ModelInfo {
    /// Tokens available before the context must be compacted
    pub fn usable_context(&self) -> u64 {
        self.limit.context.saturating_sub(self.limit.output)
    }

    /// USD cost of one step; reasoning tokens bill as output
    pub fn cost_of(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.cost.input
            + (usage.output_tokens + usage.reasoning_tokens) as f64 * self.cost.output)
            / 1_000_000.0
    }
}

/// A resolved model: its metadata plus the provider that serves it
#[derive(Clone)]
pub struct Model {
    pub provider_id: String,
    pub model_id: String,
    pub info: ModelInfo,
    pub language: Arc<dyn Provider>,
}

/// One generation request
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Vec<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

/// Result of a non-streaming generation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

/// Provider trait for LLM backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send messages and get a streaming response. The stream should end early
    /// once `abort` is cancelled.
    async fn complete(
        &self,
        request: CompletionRequest,
        abort: CancellationToken,
    ) -> Result<EventStream>;

    /// Non-streaming call used for titles and summaries
    async fn generate(&self, request: CompletionRequest) -> Result<Generation>;

    /// Get the provider name
    fn name(&self) -> &str;
}

/// Resolves `(providerID, modelID)` to a model
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn get_model(&self, provider_id: &str, model_id: &str) -> Result<Model>;
}

/// In-memory registry of explicitly registered models
#[derive(Default)]
pub struct Providers {
    models: RwLock<HashMap<(String, String), Model>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        provider_id: &str,
        model_id: &str,
        info: ModelInfo,
        language: Arc<dyn Provider>,
    ) {
        let model = Model {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            info,
            language,
        };
        let mut models = self
            .models
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        models.insert((provider_id.to_string(), model_id.to_string()), model);
    }
}

#[async_trait]
impl ProviderRegistry for Providers {
    async fn get_model(&self, provider_id: &str, model_id: &str) -> Result<Model> {
        let models = self
            .models
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        models
            .get(&(provider_id.to_string(), model_id.to_string()))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown model: {}/{}", provider_id, model_id))
    }
}
