//! Ordered storage migrations. The storage engine runs each entry at most once,
//! recording progress in `<root>/migration`.

use crate::id::{self, Prefix};
use crate::logging;
use crate::message::{
    ABORTED_RESULT, AssistantMetadata, Message, MessageMetadata, MessageTime, Part, Role, Tokens,
    ToolInvocation,
};
use crate::session::{Session, SessionTime};
use crate::storage::{read_json, write_json};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub type Migration = fn(&Path) -> Result<()>;

pub fn all() -> Vec<Migration> {
    vec![import_legacy_sessions as Migration]
}

#[derive(Debug, Deserialize)]
struct LegacySession {
    id: String,
    parent_id: Option<String>,
    title: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    messages: Vec<LegacyMessage>,
}

#[derive(Debug, Deserialize)]
struct LegacyMessage {
    role: Role,
    content: Vec<LegacyBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LegacyBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// Import single-file sessions from `<data>/sessions/*.json` (messages embedded,
/// tool results carried in follow-up user messages) into the split layout.
fn import_legacy_sessions(root: &Path) -> Result<()> {
    let Some(legacy_dir) = root.parent().map(|data| data.join("sessions")) else {
        return Ok(());
    };
    if !legacy_dir.is_dir() {
        return Ok(());
    }

    let mut legacy = Vec::new();
    for entry in std::fs::read_dir(&legacy_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        match read_json::<LegacySession>(&path) {
            Ok(session) => legacy.push(session),
            Err(e) => logging::warn(&format!(
                "migration: skipping unreadable legacy session {}: {}",
                path.display(),
                e
            )),
        }
    }
    // Oldest first, so ids keep the original relative order
    legacy.sort_by_key(|session| session.created_at);

    let new_ids: HashMap<String, String> = legacy
        .iter()
        .map(|session| (session.id.clone(), id::descending(Prefix::Session)))
        .collect();

    for old in &legacy {
        let session = Session {
            id: new_ids[&old.id].clone(),
            parent_id: old.parent_id.as_ref().and_then(|p| new_ids.get(p).cloned()),
            title: old
                .title
                .clone()
                .unwrap_or_else(|| Session::default_title(old.created_at)),
            share: None,
            time: SessionTime {
                created: old.created_at.timestamp_millis(),
                updated: old.updated_at.timestamp_millis(),
            },
        };
        write_json(
            &root.join("session").join("info").join(format!("{}.json", session.id)),
            &session,
        )?;

        let message_dir = root.join("session").join("message").join(&session.id);
        for message in convert_messages(&session, old) {
            write_json(&message_dir.join(format!("{}.json", message.id)), &message)?;
        }
        logging::info(&format!(
            "migration: imported legacy session {} as {}",
            old.id, session.id
        ));
    }
    Ok(())
}

fn convert_messages(session: &Session, old: &LegacySession) -> Vec<Message> {
    let results: HashMap<&str, &str> = old
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|block| match block {
            LegacyBlock::ToolResult {
                tool_use_id,
                content,
            } => Some((tool_use_id.as_str(), content.as_str())),
            _ => None,
        })
        .collect();

    let mut messages = Vec::new();
    for legacy in &old.messages {
        let parts: Vec<Part> = legacy
            .content
            .iter()
            .filter_map(|block| match block {
                LegacyBlock::Text { text } => Some(Part::text(text.clone())),
                LegacyBlock::ToolUse { id, name, input } => Some(Part::ToolInvocation {
                    tool_invocation: ToolInvocation::Result {
                        tool_call_id: id.clone(),
                        tool_name: name.clone(),
                        args: input.clone(),
                        result: results
                            .get(id.as_str())
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| ABORTED_RESULT.to_string()),
                    },
                }),
                LegacyBlock::ToolResult { .. } => None,
            })
            .collect();
        if parts.is_empty() {
            continue;
        }

        let assistant = (legacy.role == Role::Assistant).then(|| AssistantMetadata {
            system: Vec::new(),
            cost: 0.0,
            tokens: Tokens::default(),
            model_id: "unknown".to_string(),
            provider_id: "unknown".to_string(),
            summary: None,
            error: None,
        });
        messages.push(Message {
            id: id::ascending(Prefix::Message),
            role: legacy.role,
            parts,
            metadata: MessageMetadata {
                session_id: session.id.clone(),
                time: MessageTime {
                    created: session.time.created,
                    completed: assistant.as_ref().map(|_| session.time.updated),
                },
                tool: BTreeMap::new(),
                assistant,
            },
        });
    }
    messages
}
