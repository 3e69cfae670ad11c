//! Sortable identifiers for sessions and messages.
//!
//! An id is `<prefix>_<16 hex><14 base62>`. The hex part is a process-wide monotonic
//! value derived from `timestamp_ms * 0x1000`, so ascending ids sort in creation order.
//! Descending ids store the bitwise complement, so the newest id sorts first.

use chrono::Utc;
use std::sync::Mutex;

const RANDOM_LEN: usize = 14;
const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

static LAST: Mutex<u64> = Mutex::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Session,
    Message,
}

impl Prefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prefix::Session => "ses",
            Prefix::Message => "msg",
        }
    }
}

/// Id that sorts oldest-first (messages)
pub fn ascending(prefix: Prefix) -> String {
    format!("{}_{:016x}{}", prefix.as_str(), next_value(), random_suffix())
}

/// Id that sorts newest-first (sessions)
pub fn descending(prefix: Prefix) -> String {
    format!("{}_{:016x}{}", prefix.as_str(), !next_value(), random_suffix())
}

fn next_value() -> u64 {
    let now = (Utc::now().timestamp_millis().max(0) as u64).saturating_mul(0x1000);
    let mut last = LAST.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let value = now.max(last.saturating_add(1));
    *last = value;
    value
}

fn random_suffix() -> String {
    (0..RANDOM_LEN)
        .map(|_| BASE62[(rand::random::<u32>() % BASE62.len() as u32) as usize] as char)
        .collect()
}
