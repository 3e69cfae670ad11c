//! Context compaction
//!
//! Once the last reply used most of the model's context window, the history since
//! the previous summary is condensed into a new summary message. Later turns only
//! send the summary and what follows it.

use crate::error::ChatError;
use crate::logging;
use crate::message::{AssistantMetadata, Message, Part, Role, Tokens, ToolInvocation, now_ms};
use crate::provider::{CompletionRequest, Model, ModelInfo};
use crate::session::SessionStore;
use anyhow::Result;

/// Tool results longer than this are cut when rendering the conversation
const MAX_RESULT_CHARS: usize = 500;

const SUMMARY_SYSTEM: &str = "You are a helpful assistant that summarizes conversations.";

const SUMMARY_PROMPT: &str = r#"Summarize our conversation so you can continue this work later.

Write in natural language with these sections:
- **Context:** What we're working on and why (1-2 sentences)
- **What we did:** Key actions taken, files changed, problems solved
- **Current state:** What works, what's broken, what's next
- **User preferences:** Specific requirements or decisions they made

Be concise but preserve important details."#;

/// Messages from the latest summary onward (everything if there is none)
pub fn compaction_window(messages: Vec<Message>) -> Vec<Message> {
    let boundary = messages
        .iter()
        .filter(|message| message.is_summary())
        .map(|message| message.id.clone())
        .max();
    match boundary {
        Some(boundary) => messages
            .into_iter()
            .filter(|message| message.id >= boundary)
            .collect(),
        None => messages,
    }
}

/// Whether the last reply crossed `threshold` of the usable context. A summary
/// never counts: its tokens measure the summarization call itself.
pub fn should_summarize(messages: &[Message], info: &ModelInfo, threshold: f64) -> bool {
    let Some(last) = messages.iter().rev().find(|m| m.role == Role::Assistant) else {
        return false;
    };
    if last.is_summary() {
        return false;
    }
    let used = last.tokens().map(|t| t.total()).unwrap_or(0);
    used as f64 > threshold * info.usable_context() as f64
}

/// Summarize the current window of `session_id` and persist the summary message.
/// The caller holds the session lock.
pub async fn summarize(store: &SessionStore, model: &Model, session_id: &str) -> Result<Message> {
    let window = compaction_window(store.messages(session_id).await?);
    if window.is_empty() {
        return Err(ChatError::EmptyHistory(session_id.to_string()).into());
    }

    logging::info(&format!(
        "compaction: summarizing {} messages in {}",
        window.len(),
        session_id
    ));
    let prompt = format!("{}\n\n---\n\n{}", render_conversation(&window), SUMMARY_PROMPT);
    let request = CompletionRequest {
        system: vec![SUMMARY_SYSTEM.to_string()],
        messages: vec![Message::user(session_id, vec![Part::text(prompt)])],
        tools: Vec::new(),
        max_tokens: None,
    };
    let generation = model.language.generate(request).await?;

    let mut summary = Message::assistant(
        session_id,
        AssistantMetadata {
            system: vec![SUMMARY_SYSTEM.to_string()],
            cost: model.info.cost_of(&generation.usage),
            tokens: Tokens {
                input: generation.usage.input_tokens,
                output: generation.usage.output_tokens,
                reasoning: generation.usage.reasoning_tokens,
            },
            model_id: model.model_id.clone(),
            provider_id: model.provider_id.clone(),
            summary: Some(true),
            error: None,
        },
    );
    summary.parts.push(Part::text(generation.text));
    summary.metadata.time.completed = Some(now_ms());
    store.write_message(&summary).await?;
    Ok(summary)
}

fn render_conversation(messages: &[Message]) -> String {
    let mut conversation_text = String::new();
    for msg in messages {
        let role_str = match (msg.role, msg.is_summary()) {
            (_, true) => "Previous Summary",
            (Role::User, false) => "User",
            (Role::Assistant, false) => "Assistant",
        };
        conversation_text.push_str(&format!("**{}:**\n", role_str));

        for part in &msg.parts {
            match part {
                Part::Text { text } => {
                    conversation_text.push_str(text);
                    conversation_text.push('\n');
                }
                Part::ToolInvocation { tool_invocation } => {
                    conversation_text.push_str(&format!(
                        "[Tool: {} - {}]\n",
                        tool_invocation.tool_name(),
                        tool_invocation.args()
                    ));
                    if let ToolInvocation::Result { result, .. } = tool_invocation {
                        conversation_text.push_str(&format!("[Result: {}]\n", truncate(result)));
                    }
                }
                Part::StepStart => {}
            }
        }
        conversation_text.push('\n');
    }
    conversation_text
}

fn truncate(content: &str) -> String {
    if content.chars().count() > MAX_RESULT_CHARS {
        let cut: String = content.chars().take(MAX_RESULT_CHARS).collect();
        format!("{}... (truncated)", cut)
    } else {
        content.to_string()
    }
}
