//! End-to-end tests for the chat engine using a mock provider
//!
//! These tests verify the full turn loop without making real API calls.


use anyhow::Result;
use async_trait::async_trait;
use jcode_engine::agent::{Agent, ChatInput, SummarizeInput};
use jcode_engine::bus::{Bus, BusEvent};
use jcode_engine::config::Config;
use jcode_engine::error::ChatError;
use jcode_engine::message::{
    ABORTED_RESULT, FinishReason, Message, MessageError, Part, Role, StreamEvent, ToolInvocation,
    Usage,
};
use jcode_engine::prompt::PromptContext;
use jcode_engine::provider::{ModelCost, ModelInfo, ModelLimit, ProviderError, Providers};
use jcode_engine::session::{SessionStore, ShareInfo, ShareService};
use jcode_engine::storage::{StorageEngine, StorageError};
use jcode_engine::tool::{Registry, Tool, ToolContext, ToolOutput};
use mock_provider::MockProvider;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const PROVIDER: &str = "mock";
const MODEL: &str = "mock-model";

struct Harness {
    _dir: TempDir,
    agent: Agent,
    provider: Arc<MockProvider>,
    bus: Bus,
}

fn model_info() -> ModelInfo {
    ModelInfo {
        limit: ModelLimit {
            context: 200_000,
            output: 8_000,
        },
        cost: ModelCost {
            input: 3.0,
            output: 15.0,
        },
    }
}

/// Config with title generation off so generate() calls stay deterministic
fn quiet_config() -> Config {
    let mut config = Config::default();
    config.chat.generate_titles = false;
    config
}

fn setup(config: Config) -> Harness {
    setup_with(config, model_info(), Registry::new())
}

fn setup_with(config: Config, info: ModelInfo, registry: Registry) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let bus = Bus::new();
    let storage = Arc::new(StorageEngine::with_migrations(
        dir.path().join("storage"),
        bus.clone(),
        Vec::new(),
    ));

    let provider = Arc::new(MockProvider::new());
    let providers = Arc::new(Providers::new());
    providers.register(PROVIDER, MODEL, info, provider.clone());

    let agent = Agent::new(SessionStore::new(storage), providers, registry, config)
        .with_prompt_context(PromptContext {
            working_dir: dir.path().to_path_buf(),
            global_dir: None,
        });

    Harness {
        _dir: dir,
        agent,
        provider,
        bus,
    }
}

fn chat_input(session_id: &str, text: &str) -> ChatInput {
    ChatInput {
        session_id: session_id.to_string(),
        provider_id: PROVIDER.to_string(),
        model_id: MODEL.to_string(),
        parts: vec![Part::text(text)],
        ..Default::default()
    }
}

fn text(delta: &str) -> StreamEvent {
    StreamEvent::TextDelta(delta.to_string())
}

fn finish(reason: FinishReason, input_tokens: u64, output_tokens: u64) -> StreamEvent {
    StreamEvent::StepFinish {
        usage: Usage {
            input_tokens,
            output_tokens,
            reasoning_tokens: 0,
        },
        finish_reason: reason,
    }
}

fn tool_call(id: &str, name: &str, args: Value) -> StreamEvent {
    StreamEvent::ToolCall {
        tool_call_id: id.to_string(),
        tool_name: name.to_string(),
        args,
    }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<BusEvent>) -> Vec<BusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_for_assistant<F>(agent: &Agent, session_id: &str, ready: F)
where
    F: Fn(&Message) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let messages = agent.sessions().messages(session_id).await.unwrap();
        if messages
            .iter()
            .any(|m| m.role == Role::Assistant && ready(m))
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for assistant message"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Replies "done" with a title and metadata
struct EchoTool {
    name: &'static str,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "echo"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"command": {"type": "string"}}})
    }

    async fn execute(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput> {
        Ok(ToolOutput::new("done")
            .with_title("ls")
            .with_metadata(json!({"exit": 0})))
    }
}

struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "always fails"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput> {
        anyhow::bail!("command not found: frobnicate")
    }
}

/// Never finishes on its own
struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "sleeps forever"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _input: Value, _ctx: ToolContext) -> Result<ToolOutput> {
        std::future::pending::<()>().await;
        Ok(ToolOutput::new("woke up"))
    }
}

struct FakeShare {
    calls: AtomicUsize,
}

#[async_trait]
impl ShareService for FakeShare {
    async fn create(&self, session_id: &str) -> Result<ShareInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ShareInfo {
            secret: "s3cret".to_string(),
            url: format!("https://share.example/{}", session_id),
        })
    }
}

async fn registry_with(tools: Vec<Arc<dyn Tool>>) -> Registry {
    let registry = Registry::new();
    for tool in tools {
        registry.register(tool.name().to_string(), tool).await;
    }
    registry
}

#[tokio::test]
async fn test_simple_response() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();
    h.provider.queue_response(vec![
        text("Hello! "),
        text("How can I help?"),
        finish(FinishReason::Stop, 10, 20),
    ]);

    let reply = h.agent.chat(chat_input(&session.id, "hi")).await.unwrap();

    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(
        reply.parts,
        vec![Part::StepStart, Part::text("Hello! How can I help?")]
    );
    let assistant = reply.metadata.assistant.as_ref().unwrap();
    assert_eq!(assistant.tokens.input, 10);
    assert_eq!(assistant.tokens.output, 20);
    assert!((assistant.cost - 0.00033).abs() < 1e-12);
    assert_eq!(assistant.provider_id, PROVIDER);
    assert!(assistant.error.is_none());
    assert!(!assistant.system.is_empty());
    assert!(reply.metadata.time.completed.is_some());

    let stored = h.agent.sessions().messages(&session.id).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].role, Role::User);
    assert_eq!(stored[0].text(), "hi");
    assert_eq!(stored[1], reply);
    assert!(!h.agent.is_busy(&session.id));
}

#[tokio::test]
async fn test_tool_call_runs_and_reprompts() {
    let registry = registry_with(vec![Arc::new(EchoTool { name: "bash" })]).await;
    let h = setup_with(quiet_config(), model_info(), registry);
    let session = h.agent.create_session(None).await.unwrap();
    let mut rx = h.bus.subscribe();

    h.provider.queue_response(vec![
        StreamEvent::ToolCallStreamingStart {
            tool_call_id: "t1".to_string(),
            tool_name: "bash".to_string(),
        },
        tool_call("t1", "bash", json!({"command": "ls"})),
        finish(FinishReason::ToolCalls, 100, 10),
    ]);
    h.provider
        .queue_response(vec![text("Listed."), finish(FinishReason::Stop, 150, 5)]);

    let reply = h.agent.chat(chat_input(&session.id, "list files")).await.unwrap();

    assert_eq!(reply.parts.len(), 4);
    assert_eq!(reply.parts[0], Part::StepStart);
    assert_eq!(
        reply.parts[1].tool_invocation(),
        Some(&ToolInvocation::Result {
            tool_call_id: "t1".to_string(),
            tool_name: "bash".to_string(),
            args: json!({"command": "ls"}),
            result: "done".to_string(),
        })
    );
    assert_eq!(reply.parts[2], Part::StepStart);
    assert_eq!(reply.parts[3], Part::text("Listed."));

    let meta = &reply.metadata.tool["t1"];
    assert!(meta.time.start <= meta.time.end);
    assert_eq!(meta.data["title"], json!("ls"));
    assert_eq!(meta.data["exit"], json!(0));

    // Tokens reflect the last step; cost accumulates across steps
    let assistant = reply.metadata.assistant.as_ref().unwrap();
    assert_eq!(assistant.tokens.input, 150);
    let expected = (100.0 * 3.0 + 10.0 * 15.0 + 150.0 * 3.0 + 5.0 * 15.0) / 1_000_000.0;
    assert!((assistant.cost - expected).abs() < 1e-12);

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[0].tools[0].name, "bash");
    assert_eq!(requests[0].max_tokens, Some(8_000));
    let carried = requests[1].messages.last().unwrap();
    assert_eq!(carried.role, Role::Assistant);
    assert_eq!(carried.id, reply.id);
    assert!(
        carried
            .parts
            .iter()
            .any(|p| p.tool_invocation().and_then(|t| t.result()) == Some("done"))
    );

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        BusEvent::MessagePartUpdated { part: Part::ToolInvocation { tool_invocation }, message_id, .. }
            if tool_invocation.is_result() && message_id == &reply.id
    )));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, BusEvent::MessageUpdated { info } if info.id == reply.id))
    );
}

#[tokio::test]
async fn test_tool_failure_is_recorded_as_result() {
    let registry = registry_with(vec![Arc::new(FailingTool)]).await;
    let h = setup_with(quiet_config(), model_info(), registry);
    let session = h.agent.create_session(None).await.unwrap();

    h.provider.queue_response(vec![
        tool_call("t1", "bash", json!({})),
        finish(FinishReason::ToolCalls, 10, 1),
    ]);
    h.provider
        .queue_response(vec![text("That failed."), finish(FinishReason::Stop, 10, 1)]);

    let reply = h.agent.chat(chat_input(&session.id, "run it")).await.unwrap();

    let invocation = reply.parts[1].tool_invocation().unwrap();
    assert_eq!(invocation.result(), Some("command not found: frobnicate"));
    let meta = &reply.metadata.tool["t1"];
    assert_eq!(meta.data["error"], json!(true));
    assert_eq!(meta.data["message"], json!("command not found: frobnicate"));
    assert_eq!(meta.data["title"], json!("bash"));
    assert!(reply.error().is_none());
    assert_eq!(reply.text(), "That failed.");
}

#[tokio::test]
async fn test_unknown_tool_is_reported_to_model() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();

    h.provider.queue_response(vec![
        tool_call("t1", "missing", json!({})),
        finish(FinishReason::ToolCalls, 10, 1),
    ]);
    h.provider
        .queue_response(vec![text("ok"), finish(FinishReason::Stop, 10, 1)]);

    let reply = h.agent.chat(chat_input(&session.id, "go")).await.unwrap();

    let invocation = reply.parts[1].tool_invocation().unwrap();
    assert_eq!(invocation.result(), Some("Unknown tool: missing"));
    assert_eq!(reply.metadata.tool["t1"].data["error"], json!(true));
}

#[tokio::test]
async fn test_provider_executed_tool_result() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();

    h.provider.queue_response(vec![
        StreamEvent::ToolCallStreamingStart {
            tool_call_id: "t1".to_string(),
            tool_name: "web_search".to_string(),
        },
        StreamEvent::ToolResult {
            tool_call_id: "t1".to_string(),
            result: "done".to_string(),
        },
        text("Found it."),
        finish(FinishReason::Stop, 10, 3),
    ]);

    let reply = h.agent.chat(chat_input(&session.id, "search")).await.unwrap();

    let invocation = reply.parts[1].tool_invocation().unwrap();
    assert!(invocation.is_result());
    assert_eq!(invocation.result(), Some("done"));
    assert!(reply.metadata.tool.is_empty());
    assert_eq!(reply.text(), "Found it.");
    assert_eq!(h.provider.requests().len(), 1);
}

#[tokio::test]
async fn test_second_chat_while_busy_is_rejected() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();
    h.provider.queue_hanging_response(vec![text("thinking")]);

    let agent = h.agent.clone();
    let session_id = session.id.clone();
    let first = tokio::spawn(async move { agent.chat(chat_input(&session_id, "first")).await });

    wait_for_assistant(&h.agent, &session.id, |m| m.text() == "thinking").await;
    assert!(h.agent.is_busy(&session.id));

    let err = h
        .agent
        .chat(chat_input(&session.id, "second"))
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ChatError>(),
        Some(&ChatError::Busy(session.id.clone()))
    );

    assert!(h.agent.abort(&session.id));
    let reply = first.await.unwrap().unwrap();
    assert_eq!(reply.text(), "thinking");
    assert!(reply.metadata.time.completed.is_some());
    assert!(!h.agent.is_busy(&session.id));
    assert!(!h.agent.abort(&session.id));

    // The rejected turn left nothing behind
    let stored = h.agent.sessions().messages(&session.id).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].text(), "first");
}

#[tokio::test]
async fn test_abort_during_tool_marks_invocation_aborted() {
    let registry = registry_with(vec![Arc::new(SleepTool)]).await;
    let h = setup_with(quiet_config(), model_info(), registry);
    let session = h.agent.create_session(None).await.unwrap();
    h.provider.queue_response(vec![
        tool_call("t1", "sleep", json!({})),
        finish(FinishReason::ToolCalls, 10, 1),
    ]);

    let agent = h.agent.clone();
    let session_id = session.id.clone();
    let turn = tokio::spawn(async move { agent.chat(chat_input(&session_id, "wait")).await });

    wait_for_assistant(&h.agent, &session.id, |m| {
        m.parts.iter().any(|p| p.tool_invocation().is_some())
    })
    .await;
    assert!(h.agent.abort(&session.id));

    let reply = turn.await.unwrap().unwrap();
    let invocation = reply.parts[1].tool_invocation().unwrap();
    assert_eq!(invocation.tool_call_id(), "t1");
    assert_eq!(invocation.result(), Some(ABORTED_RESULT));
    assert!(!reply.metadata.tool.contains_key("t1"));
    assert!(reply.metadata.time.completed.is_some());
    assert_eq!(h.provider.requests().len(), 1);

    let stored = h
        .agent
        .sessions()
        .message(&session.id, &reply.id)
        .await
        .unwrap();
    assert_eq!(stored, reply);

    // The session accepts new turns afterwards
    h.provider
        .queue_response(vec![text("back"), finish(FinishReason::Stop, 10, 1)]);
    let next = h.agent.chat(chat_input(&session.id, "again")).await.unwrap();
    assert_eq!(next.text(), "back");
}

#[tokio::test]
async fn test_abort_while_provider_connects() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();
    h.provider.queue_stalled_connect();

    let agent = h.agent.clone();
    let session_id = session.id.clone();
    let turn = tokio::spawn(async move { agent.chat(chat_input(&session_id, "hello")).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.provider.requests().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "provider never called");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.agent.abort(&session.id));

    let reply = tokio::time::timeout(Duration::from_secs(5), turn)
        .await
        .expect("turn should end after abort")
        .unwrap()
        .unwrap();
    assert_eq!(reply.parts, vec![Part::StepStart]);
    assert!(reply.error().is_none());
    assert!(reply.metadata.time.completed.is_some());
    assert!(!h.agent.is_busy(&session.id));
}

#[tokio::test]
async fn test_auth_error_is_recorded() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();
    let mut rx = h.bus.subscribe();
    h.provider.queue_failure(
        ProviderError::Auth {
            provider_id: PROVIDER.to_string(),
            message: "invalid x-api-key".to_string(),
        }
        .into(),
    );

    let reply = h.agent.chat(chat_input(&session.id, "hi")).await.unwrap();

    assert_eq!(
        reply.error(),
        Some(&MessageError::ProviderAuthError {
            provider_id: PROVIDER.to_string(),
            message: "invalid x-api-key".to_string(),
        })
    );
    assert_eq!(reply.parts, vec![Part::StepStart]);
    assert!(reply.metadata.time.completed.is_some());
    assert!(!h.agent.is_busy(&session.id));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        BusEvent::SessionError { session_id: Some(id), error: MessageError::ProviderAuthError { .. } }
            if id == &session.id
    )));
}

#[tokio::test]
async fn test_stream_error_keeps_partial_text() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();
    h.provider.queue_stream_error(
        vec![text("Starting...")],
        anyhow::anyhow!("Something went wrong"),
    );

    let reply = h.agent.chat(chat_input(&session.id, "hi")).await.unwrap();

    assert_eq!(reply.text(), "Starting...");
    assert_eq!(
        reply.error(),
        Some(&MessageError::UnknownError {
            message: "Something went wrong".to_string(),
        })
    );
    assert_eq!(h.provider.requests().len(), 1);
}

#[tokio::test]
async fn test_history_starts_at_latest_summary() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();

    h.provider
        .queue_response(vec![text("first answer"), finish(FinishReason::Stop, 10, 2)]);
    h.agent
        .chat(chat_input(&session.id, "first question"))
        .await
        .unwrap();

    h.provider.queue_generation("We discussed the first question.", Usage::default());
    let summary = h
        .agent
        .summarize(SummarizeInput {
            session_id: session.id.clone(),
            provider_id: PROVIDER.to_string(),
            model_id: MODEL.to_string(),
        })
        .await
        .unwrap();
    assert!(summary.is_summary());
    assert_eq!(summary.text(), "We discussed the first question.");
    assert!(summary.metadata.time.completed.is_some());

    let generate = h.provider.generate_requests();
    assert_eq!(generate.len(), 1);
    assert!(generate[0].messages[0].text().contains("first question"));

    h.provider
        .queue_response(vec![text("second answer"), finish(FinishReason::Stop, 10, 2)]);
    h.agent
        .chat(chat_input(&session.id, "second question"))
        .await
        .unwrap();

    let requests = h.provider.requests();
    let last = requests.last().unwrap();
    assert_eq!(last.messages.len(), 2);
    assert_eq!(last.messages[0].id, summary.id);
    assert_eq!(last.messages[1].text(), "second question");
}

#[tokio::test]
async fn test_context_overflow_triggers_summary() {
    // usable context = 1_000, threshold 0.9
    let info = ModelInfo {
        limit: ModelLimit {
            context: 1_100,
            output: 100,
        },
        cost: ModelCost::default(),
    };
    let h = setup_with(quiet_config(), info, Registry::new());
    let session = h.agent.create_session(None).await.unwrap();

    h.provider
        .queue_response(vec![text("long answer"), finish(FinishReason::Stop, 950, 10)]);
    h.agent.chat(chat_input(&session.id, "one")).await.unwrap();
    assert!(h.provider.generate_requests().is_empty());

    // The summary itself is large, but a summary never triggers another one
    h.provider.queue_generation(
        "Summary of one.",
        Usage {
            input_tokens: 5_000,
            output_tokens: 100,
            reasoning_tokens: 0,
        },
    );
    h.provider
        .queue_response(vec![text("short"), finish(FinishReason::Stop, 50, 5)]);
    h.agent.chat(chat_input(&session.id, "two")).await.unwrap();

    assert_eq!(h.provider.generate_requests().len(), 1);
    let requests = h.provider.requests();
    let last = requests.last().unwrap();
    assert!(last.messages[0].is_summary());
    assert_eq!(last.messages[1].text(), "two");
    assert_eq!(last.max_tokens, Some(100));
}

#[tokio::test]
async fn test_summarize_empty_session_fails() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();

    let err = h
        .agent
        .summarize(SummarizeInput {
            session_id: session.id.clone(),
            provider_id: PROVIDER.to_string(),
            model_id: MODEL.to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ChatError>(),
        Some(&ChatError::EmptyHistory(session.id.clone()))
    );
    assert!(h.provider.generate_requests().is_empty());
    assert!(!h.agent.is_busy(&session.id));
}

#[tokio::test]
async fn test_first_message_generates_title() {
    let h = setup(Config::default());
    let session = h.agent.create_session(None).await.unwrap();
    h.provider
        .queue_generation("\"Fix the login bug\"\n", Usage::default());
    h.provider
        .queue_response(vec![text("Sure."), finish(FinishReason::Stop, 10, 1)]);

    h.agent
        .chat(chat_input(&session.id, "please fix the login bug"))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = h.agent.sessions().get(&session.id).await.unwrap();
        if current.title == "Fix the login bug" {
            assert!(current.time.updated >= session.time.updated);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "title never set");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let generate = h.provider.generate_requests();
    assert_eq!(generate.len(), 1);
    assert_eq!(generate[0].max_tokens, Some(32));
    assert_eq!(generate[0].messages[0].text(), "please fix the login bug");

    // Later turns keep the title
    h.provider
        .queue_response(vec![text("Done."), finish(FinishReason::Stop, 10, 1)]);
    h.agent.chat(chat_input(&session.id, "thanks")).await.unwrap();
    assert_eq!(h.provider.generate_requests().len(), 1);
}

#[tokio::test]
async fn test_message_ids_follow_turn_order() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();

    for i in 0..3 {
        h.provider
            .queue_response(vec![text(&format!("reply {}", i)), finish(FinishReason::Stop, 1, 1)]);
        h.agent
            .chat(chat_input(&session.id, &format!("question {}", i)))
            .await
            .unwrap();
    }

    let stored = h.agent.sessions().messages(&session.id).await.unwrap();
    assert_eq!(stored.len(), 6);
    for pair in stored.windows(2) {
        assert!(pair[0].id < pair[1].id);
    }
    for (i, message) in stored.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        assert_eq!(message.role, expected);
    }
    assert_eq!(stored[4].text(), "question 2");
    assert_eq!(stored[5].text(), "reply 2");
}

#[tokio::test]
async fn test_disabled_tools_are_not_offered() {
    let registry = registry_with(vec![
        Arc::new(EchoTool { name: "bash" }),
        Arc::new(EchoTool { name: "read" }),
    ])
    .await;
    let h = setup_with(quiet_config(), model_info(), registry);
    let session = h.agent.create_session(None).await.unwrap();
    h.provider
        .queue_response(vec![text("ok"), finish(FinishReason::Stop, 1, 1)]);

    let mut input = chat_input(&session.id, "hi");
    input.tools.insert("bash".to_string(), false);
    input.tools.insert("read".to_string(), true);
    h.agent.chat(input).await.unwrap();

    let names: Vec<String> = h.provider.requests()[0]
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(names, vec!["read".to_string()]);
}

#[tokio::test]
async fn test_step_limit_stops_tool_loop() {
    let registry = registry_with(vec![Arc::new(EchoTool { name: "bash" })]).await;
    let mut config = quiet_config();
    config.chat.max_steps = 2;
    let h = setup_with(config, model_info(), registry);
    let session = h.agent.create_session(None).await.unwrap();

    for i in 0..3 {
        h.provider.queue_response(vec![
            tool_call(&format!("t{}", i), "bash", json!({})),
            finish(FinishReason::ToolCalls, 1, 1),
        ]);
    }

    let reply = h.agent.chat(chat_input(&session.id, "loop")).await.unwrap();

    assert_eq!(h.provider.requests().len(), 2);
    let steps = reply
        .parts
        .iter()
        .filter(|p| matches!(p, Part::StepStart))
        .count();
    assert_eq!(steps, 2);
    assert!(reply.metadata.time.completed.is_some());
}

#[tokio::test]
async fn test_custom_system_prompt_replaces_default() {
    let h = setup(quiet_config());
    let session = h.agent.create_session(None).await.unwrap();
    h.provider
        .queue_response(vec![text("ok"), finish(FinishReason::Stop, 1, 1)]);

    let mut input = chat_input(&session.id, "hi");
    input.system = Some(vec!["You are terse.".to_string()]);
    let reply = h.agent.chat(input).await.unwrap();

    let requests = h.provider.requests();
    let request = &requests[0];
    assert_eq!(request.system[0], "You are terse.");
    assert!(request.system[1].starts_with("# Environment"));
    assert_eq!(reply.metadata.assistant.unwrap().system, request.system);
}

#[tokio::test]
async fn test_auto_share_root_sessions_only() {
    let mut config = quiet_config();
    config.share.auto_share = true;
    let share = Arc::new(FakeShare {
        calls: AtomicUsize::new(0),
    });
    let mut h = setup(config);
    h.agent = h.agent.clone().with_share(share.clone());

    let root = h.agent.create_session(None).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let shared = loop {
        let current = h.agent.sessions().get(&root.id).await.unwrap();
        if let Some(info) = current.share {
            break info;
        }
        assert!(tokio::time::Instant::now() < deadline, "share never set");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(shared.url, format!("https://share.example/{}", root.id));

    let child = h.agent.create_session(Some(&root.id)).await.unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.agent.sessions().get(&child.id).await.unwrap().share.is_none());
    assert_eq!(share.calls.load(Ordering::SeqCst), 1);

    let children = h.agent.sessions().children(&root.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, child.id);
}

#[tokio::test]
async fn test_chat_unknown_session_fails() {
    let h = setup(quiet_config());
    let err = h
        .agent
        .chat(chat_input("ses_missing", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::NotFound(key)) if key.ends_with("ses_missing")
    ));
    assert!(h.provider.requests().is_empty());
}
