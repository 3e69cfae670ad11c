//! Per-session exclusion for in-flight generations.

use crate::error::ChatError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

struct Held {
    owner: u64,
    cancel: CancellationToken,
}

#[derive(Clone, Default)]
pub struct SessionLocks {
    held: Arc<Mutex<HashMap<String, Held>>>,
    next_owner: Arc<AtomicU64>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `session_id`, or fail at once with `ChatError::Busy`
    pub fn acquire(&self, session_id: &str) -> Result<SessionGuard, ChatError> {
        let mut held = self.lock_map();
        if held.contains_key(session_id) {
            return Err(ChatError::Busy(session_id.to_string()));
        }
        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        held.insert(
            session_id.to_string(),
            Held {
                owner,
                cancel: cancel.clone(),
            },
        );
        Ok(SessionGuard {
            locks: self.clone(),
            session_id: session_id.to_string(),
            owner,
            cancel,
        })
    }

    /// Cancel the running generation for `session_id`. Returns whether one existed.
    pub fn abort(&self, session_id: &str) -> bool {
        match self.lock_map().get(session_id) {
            Some(held) => {
                held.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.lock_map().contains_key(session_id)
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Held>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the session lock when dropped
pub struct SessionGuard {
    locks: SessionLocks,
    session_id: String,
    owner: u64,
    cancel: CancellationToken,
}

impl SessionGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut held = self.locks.lock_map();
        if held.get(&self.session_id).map(|h| h.owner) == Some(self.owner) {
            held.remove(&self.session_id);
        }
    }
}
