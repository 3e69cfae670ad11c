use crate::bus::{Bus, BusEvent};
use crate::id::{self, Prefix};
use crate::message::{Message, Part, now_ms};
use crate::storage::StorageEngine;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const SESSION_INFO: [&str; 2] = ["session", "info"];
const SESSION_MESSAGE: [&str; 2] = ["session", "message"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareInfo>,
    pub time: SessionTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareInfo {
    pub secret: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTime {
    pub created: i64,
    pub updated: i64,
}

impl Session {
    pub fn default_title(at: DateTime<Utc>) -> String {
        format!(
            "New session - {}",
            at.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Creates public share links for sessions
#[async_trait]
pub trait ShareService: Send + Sync {
    async fn create(&self, session_id: &str) -> Result<ShareInfo>;
}

/// Typed access to sessions and their messages
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<StorageEngine>,
}

impl SessionStore {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    fn bus(&self) -> &Bus {
        self.storage.bus()
    }

    pub async fn create(&self, parent_id: Option<&str>) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: id::descending(Prefix::Session),
            parent_id: parent_id.map(str::to_string),
            title: Session::default_title(now),
            share: None,
            time: SessionTime {
                created: now.timestamp_millis(),
                updated: now.timestamp_millis(),
            },
        };
        self.storage
            .write(&[SESSION_INFO[0], SESSION_INFO[1], &session.id], &session)
            .await?;
        self.bus().publish(BusEvent::SessionUpdated {
            info: session.clone(),
        });
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        self.storage
            .read(&[SESSION_INFO[0], SESSION_INFO[1], session_id])
            .await
    }

    /// Apply `editor`, bump `time.updated`, and publish the result
    pub async fn update<F>(&self, session_id: &str, editor: F) -> Result<Session>
    where
        F: FnOnce(&mut Session) + Send,
    {
        let session = self
            .storage
            .update(
                &[SESSION_INFO[0], SESSION_INFO[1], session_id],
                |session: &mut Session| {
                    editor(session);
                    session.time.updated = now_ms();
                },
            )
            .await?;
        self.bus().publish(BusEvent::SessionUpdated {
            info: session.clone(),
        });
        Ok(session)
    }

    /// All sessions, newest first
    pub async fn list(&self) -> Result<Vec<Session>> {
        let keys = self.storage.list(&SESSION_INFO).await?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(session) = self.storage.read_optional(&key).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    pub async fn children(&self, parent_id: &str) -> Result<Vec<Session>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|session| session.parent_id.as_deref() == Some(parent_id))
            .collect())
    }

    /// Messages of a session, oldest first
    pub async fn messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let keys = self
            .storage
            .list(&[SESSION_MESSAGE[0], SESSION_MESSAGE[1], session_id])
            .await?;
        let mut messages = Vec::with_capacity(keys.len());
        for key in keys {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(message) = self.storage.read_optional(&key).await? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    pub async fn message(&self, session_id: &str, message_id: &str) -> Result<Message> {
        self.storage
            .read(&[SESSION_MESSAGE[0], SESSION_MESSAGE[1], session_id, message_id])
            .await
    }

    pub async fn write_message(&self, message: &Message) -> Result<()> {
        self.storage
            .write(
                &[
                    SESSION_MESSAGE[0],
                    SESSION_MESSAGE[1],
                    message.session_id(),
                    &message.id,
                ],
                message,
            )
            .await?;
        self.bus().publish(BusEvent::MessageUpdated {
            info: message.clone(),
        });
        Ok(())
    }

    pub fn publish_part(&self, session_id: &str, message_id: &str, part: &Part) {
        self.bus().publish(BusEvent::MessagePartUpdated {
            part: part.clone(),
            message_id: message_id.to_string(),
            session_id: session_id.to_string(),
        });
    }
}
