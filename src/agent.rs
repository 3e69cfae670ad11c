use crate::bus::BusEvent;
use crate::compaction::{self, compaction_window, should_summarize};
use crate::config::Config;
use crate::logging;
use crate::message::{
    AssistantMetadata, FinishReason, Message, MessageError, Part, StreamEvent, Tokens,
    ToolDefinition, ToolMeta, ToolTime, now_ms,
};
use crate::lock::SessionLocks;
use crate::prompt::{self, PromptContext};
use crate::provider::{CompletionRequest, EventStream, Model, ProviderError, ProviderRegistry};
use crate::session::{Session, SessionStore, ShareService};
use crate::tool::{Registry, Tool, ToolContext};
use crate::turn::Turn;
use anyhow::Result;
use futures::StreamExt;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One user turn
#[derive(Debug, Clone, Default)]
pub struct ChatInput {
    pub session_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub parts: Vec<Part>,
    /// Replaces the provider's default system prompt
    pub system: Option<Vec<String>>,
    /// Per-tool switches; a tool mapped to `false` is not offered
    pub tools: HashMap<String, bool>,
}

#[derive(Debug, Clone, Default)]
pub struct SummarizeInput {
    pub session_id: String,
    pub provider_id: String,
    pub model_id: String,
}

/// How one model step ended
enum StepOutcome {
    Finished(FinishReason),
    /// Stream closed without a step-finish event
    Ended,
    Errored,
    Aborted,
}

/// The chat engine. Cloning shares every store and lock map.
#[derive(Clone)]
pub struct Agent {
    sessions: SessionStore,
    providers: Arc<dyn ProviderRegistry>,
    registry: Registry,
    locks: SessionLocks,
    config: Arc<Config>,
    share: Option<Arc<dyn ShareService>>,
    prompt: Arc<PromptContext>,
}

impl Agent {
    pub fn new(
        sessions: SessionStore,
        providers: Arc<dyn ProviderRegistry>,
        registry: Registry,
        config: Config,
    ) -> Self {
        Self {
            sessions,
            providers,
            registry,
            locks: SessionLocks::new(),
            config: Arc::new(config),
            share: None,
            prompt: Arc::new(PromptContext::detect()),
        }
    }

    pub fn with_share(mut self, share: Arc<dyn ShareService>) -> Self {
        self.share = Some(share);
        self
    }

    pub fn with_prompt_context(mut self, prompt: PromptContext) -> Self {
        self.prompt = Arc::new(prompt);
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.locks.is_busy(session_id)
    }

    /// Create a session. Root sessions get a share link in the background when
    /// auto-sharing is on.
    pub async fn create_session(&self, parent_id: Option<&str>) -> Result<Session> {
        let session = self.sessions.create(parent_id).await?;
        logging::info(&format!("created session {}", session.id));

        if session.is_root() && self.config.share.auto_share {
            if let Some(share) = self.share.clone() {
                let sessions = self.sessions.clone();
                let session_id = session.id.clone();
                tokio::spawn(async move {
                    let result = match share.create(&session_id).await {
                        Ok(info) => sessions
                            .update(&session_id, move |s| s.share = Some(info))
                            .await
                            .map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        logging::warn(&format!("share link for {} failed: {}", session_id, e));
                    }
                });
            }
        }
        Ok(session)
    }

    /// Run one turn: persist the user message, stream the reply (executing tool
    /// calls as they arrive) and return the completed assistant message.
    ///
    /// Provider failures are recorded on the returned message; only storage
    /// failures and `ChatError` surface as `Err`.
    pub async fn chat(&self, input: ChatInput) -> Result<Message> {
        let _log =
            logging::scoped_context(&input.session_id, &input.provider_id, &input.model_id);

        self.sessions.get(&input.session_id).await?;
        let model = self
            .providers
            .get_model(&input.provider_id, &input.model_id)
            .await?;

        self.compact_if_needed(&input, &model).await?;

        let guard = self.locks.acquire(&input.session_id)?;
        let abort = guard.token().clone();

        let mut history = compaction_window(self.sessions.messages(&input.session_id).await?);
        if history.is_empty() && self.config.chat.generate_titles {
            self.spawn_title(&input, &model);
        }

        let user = Message::user(&input.session_id, input.parts.clone());
        self.sessions.write_message(&user).await?;
        history.push(user);

        let system =
            prompt::build_system_prompt(&input.provider_id, input.system.as_deref(), &self.prompt)
                .await;

        let assistant = Message::assistant(
            &input.session_id,
            AssistantMetadata {
                system: system.clone(),
                cost: 0.0,
                tokens: Tokens::default(),
                model_id: input.model_id.clone(),
                provider_id: input.provider_id.clone(),
                summary: None,
                error: None,
            },
        );
        self.sessions.write_message(&assistant).await?;
        let mut turn = Turn::new(assistant);

        let tools: HashMap<String, Arc<dyn Tool>> =
            self.registry.enabled(&input.tools).await.into_iter().collect();
        let definitions: Vec<ToolDefinition> = self.registry.definitions(&input.tools).await;

        let max_steps = self.config.chat.max_steps.max(1);
        for step in 0..max_steps {
            if abort.is_cancelled() {
                break;
            }
            let index = turn.start_step();
            self.persist_part(&turn, index).await?;

            let mut messages = history.clone();
            if step > 0 {
                messages.push(turn.message().clone());
            }
            let request = CompletionRequest {
                system: system.clone(),
                messages,
                tools: definitions.clone(),
                max_tokens: u32::try_from(model.info.limit.output).ok(),
            };

            logging::info(&format!(
                "step {} starting: {} messages, {} tools",
                step + 1,
                request.messages.len(),
                request.tools.len()
            ));
            let started = tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                started = model.language.complete(request, abort.clone()) => Some(started),
            };
            let outcome = match started {
                None => StepOutcome::Aborted,
                Some(Ok(stream)) => {
                    self.consume_stream(&mut turn, stream, &tools, &model, &abort)
                        .await?
                }
                Some(Err(e)) => {
                    self.record_error(&mut turn, &input.provider_id, e);
                    StepOutcome::Errored
                }
            };

            match outcome {
                StepOutcome::Finished(FinishReason::ToolCalls) => {
                    if step + 1 == max_steps {
                        logging::warn(&format!(
                            "step limit {} reached in {}",
                            max_steps, input.session_id
                        ));
                    }
                }
                StepOutcome::Aborted => {
                    logging::info(&format!("turn aborted in {}", input.session_id));
                    break;
                }
                StepOutcome::Finished(_) | StepOutcome::Ended | StepOutcome::Errored => break,
            }
        }

        turn.finalize();
        self.sessions.write_message(turn.message()).await?;
        drop(guard);
        Ok(turn.into_message())
    }

    /// Cancel the in-flight turn of `session_id`. Returns whether one was running.
    pub fn abort(&self, session_id: &str) -> bool {
        self.locks.abort(session_id)
    }

    /// Condense the history since the last summary into a new summary message
    pub async fn summarize(&self, input: SummarizeInput) -> Result<Message> {
        let model = self
            .providers
            .get_model(&input.provider_id, &input.model_id)
            .await?;
        let _guard = self.locks.acquire(&input.session_id)?;
        compaction::summarize(&self.sessions, &model, &input.session_id).await
    }

    async fn compact_if_needed(&self, input: &ChatInput, model: &Model) -> Result<()> {
        let threshold = self.config.chat.compaction_threshold;
        let mut compactions = 0;
        loop {
            let messages = self.sessions.messages(&input.session_id).await?;
            if !should_summarize(&messages, &model.info, threshold) {
                return Ok(());
            }
            if compactions >= self.config.chat.max_compactions {
                logging::warn(&format!(
                    "context still over threshold after {} summaries in {}",
                    compactions, input.session_id
                ));
                return Ok(());
            }
            self.summarize(SummarizeInput {
                session_id: input.session_id.clone(),
                provider_id: input.provider_id.clone(),
                model_id: input.model_id.clone(),
            })
            .await?;
            compactions += 1;
        }
    }

    fn spawn_title(&self, input: &ChatInput, model: &Model) {
        let sessions = self.sessions.clone();
        let language = model.language.clone();
        let session_id = input.session_id.clone();
        let first = Message::user(&input.session_id, input.parts.clone());
        let max_tokens = self.config.chat.title_max_tokens;

        tokio::spawn(async move {
            let request = CompletionRequest {
                system: vec![prompt::TITLE_PROMPT.trim().to_string()],
                messages: vec![first],
                tools: Vec::new(),
                max_tokens: Some(max_tokens),
            };
            let result = match language.generate(request).await {
                Ok(generation) => {
                    let title = clean_title(&generation.text);
                    if title.is_empty() {
                        Ok(())
                    } else {
                        sessions
                            .update(&session_id, move |s| s.title = title)
                            .await
                            .map(|_| ())
                    }
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                logging::warn(&format!("title generation for {} failed: {}", session_id, e));
            }
        });
    }

    async fn consume_stream(
        &self,
        turn: &mut Turn,
        mut stream: EventStream,
        tools: &HashMap<String, Arc<dyn Tool>>,
        model: &Model,
        abort: &CancellationToken,
    ) -> Result<StepOutcome> {
        let mut finish = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => return Ok(StepOutcome::Aborted),
                next = stream.next() => next,
            };
            let Some(event) = next else {
                return Ok(finish.map(StepOutcome::Finished).unwrap_or(StepOutcome::Ended));
            };

            match event {
                Err(e) => {
                    let provider_id = model.provider_id.clone();
                    self.record_error(turn, &provider_id, e);
                    return Ok(StepOutcome::Errored);
                }
                Ok(StreamEvent::StepFinish {
                    usage,
                    finish_reason,
                }) => {
                    turn.add_usage(&model.info, &usage);
                    self.sessions.write_message(turn.message()).await?;
                    finish = Some(finish_reason);
                }
                Ok(event) => {
                    if let Some(index) = turn.apply(&event) {
                        self.persist_part(turn, index).await?;
                    }
                    if let StreamEvent::ToolCall {
                        tool_call_id,
                        tool_name,
                        args,
                    } = event
                    {
                        self.execute_tool(turn, tools, &tool_call_id, &tool_name, args, abort)
                            .await?;
                    }
                }
            }
        }
    }

    /// Run one tool call, record its timing and metadata, then apply its result
    async fn execute_tool(
        &self,
        turn: &mut Turn,
        tools: &HashMap<String, Arc<dyn Tool>>,
        tool_call_id: &str,
        tool_name: &str,
        args: Value,
        abort: &CancellationToken,
    ) -> Result<()> {
        let start = now_ms();
        let outcome = match tools.get(tool_name) {
            Some(tool) => {
                let ctx = ToolContext {
                    session_id: turn.message().session_id().to_string(),
                    message_id: turn.message().id.clone(),
                    tool_call_id: tool_call_id.to_string(),
                    abort: abort.clone(),
                };
                tokio::select! {
                    biased;
                    // left unresolved; finalize marks it aborted
                    _ = abort.cancelled() => return Ok(()),
                    outcome = tool.execute(args.clone(), ctx) => outcome,
                }
            }
            None => Err(anyhow::anyhow!("Unknown tool: {}", tool_name)),
        };
        let end = now_ms();

        let (result, data) = match outcome {
            Ok(output) => {
                let mut data = match output.metadata {
                    Some(Value::Object(map)) => map,
                    Some(other) => {
                        let mut map = Map::new();
                        map.insert("metadata".to_string(), other);
                        map
                    }
                    None => Map::new(),
                };
                data.insert(
                    "title".to_string(),
                    json!(output.title.unwrap_or_else(|| tool_name.to_string())),
                );
                (output.output, data)
            }
            Err(e) => {
                let message = e.to_string();
                logging::warn(&format!("tool {} failed: {}", tool_name, message));
                let mut data = Map::new();
                data.insert("error".to_string(), json!(true));
                data.insert("message".to_string(), json!(message));
                data.insert("title".to_string(), json!(tool_name));
                (message, data)
            }
        };
        logging::tool_call(tool_name, &args.to_string(), &result);

        turn.record_tool(
            tool_call_id,
            ToolMeta {
                time: ToolTime { start, end },
                data,
            },
        );
        self.sessions.write_message(turn.message()).await?;

        let event = StreamEvent::ToolResult {
            tool_call_id: tool_call_id.to_string(),
            result,
        };
        if let Some(index) = turn.apply(&event) {
            self.persist_part(turn, index).await?;
        }
        Ok(())
    }

    fn record_error(&self, turn: &mut Turn, provider_id: &str, error: anyhow::Error) {
        logging::error(&format!("generation failed: {:#}", error));
        let error = classify_error(provider_id, &error);
        turn.set_error(error.clone());
        self.sessions.storage().bus().publish(BusEvent::SessionError {
            session_id: Some(turn.message().session_id().to_string()),
            error,
        });
    }

    async fn persist_part(&self, turn: &Turn, index: usize) -> Result<()> {
        let message = turn.message();
        self.sessions.write_message(message).await?;
        if let Some(part) = message.parts.get(index) {
            self.sessions
                .publish_part(message.session_id(), &message.id, part);
        }
        Ok(())
    }
}

fn classify_error(provider_id: &str, error: &anyhow::Error) -> MessageError {
    match error.downcast_ref::<ProviderError>() {
        Some(ProviderError::Auth {
            provider_id: raised_by,
            message,
        }) => MessageError::ProviderAuthError {
            provider_id: if raised_by.is_empty() {
                provider_id.to_string()
            } else {
                raised_by.clone()
            },
            message: message.clone(),
        },
        None => MessageError::UnknownError {
            message: error.to_string(),
        },
    }
}

/// First non-empty line, unquoted, capped at 100 chars
fn clean_title(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let line = line.trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();
    line.chars().take(100).collect()
}
