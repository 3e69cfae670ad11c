//! Logging infrastructure for jcode-engine
//!
//! Logs to ~/.jcode/logs/ (or $JCODE_HOME/logs) with daily files.
//!
//! Supports per-task context for session, provider, and model info. Nothing is
//! written until `init()` has been called.

use crate::storage::jcode_dir;
use chrono::Local;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

const KEEP_DAYS: i64 = 7;

static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);
static TASK_LOG_CONTEXTS: OnceLock<Mutex<HashMap<String, LogContext>>> = OnceLock::new();

#[derive(Default, Clone)]
pub struct LogContext {
    pub session: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

thread_local! {
    static LOG_CONTEXT: RefCell<LogContext> = RefCell::new(LogContext::default());
}

/// Update just the session in the current context
pub fn set_session(session: &str) {
    update_context(|ctx| ctx.session = Some(session.to_string()));
}

/// Update provider and model in the current context
pub fn set_provider_info(provider: &str, model: &str) {
    update_context(|ctx| {
        ctx.provider = Some(provider.to_string());
        ctx.model = Some(model.to_string());
    });
}

/// Clears the current task's context when dropped
pub struct ContextGuard {
    _private: (),
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        clear_context();
    }
}

/// Set session, provider and model for the current task until the guard drops
pub fn scoped_context(session: &str, provider: &str, model: &str) -> ContextGuard {
    set_session(session);
    set_provider_info(provider, model);
    ContextGuard { _private: () }
}

/// Clear the logging context for the current task or thread
pub fn clear_context() {
    if let Some(task_id) = current_task_id() {
        if let Some(store) = TASK_LOG_CONTEXTS.get() {
            if let Ok(mut contexts) = store.lock() {
                contexts.remove(&task_id);
            }
        }
    }

    LOG_CONTEXT.with(|c| {
        *c.borrow_mut() = LogContext::default();
    });
}

fn update_context(update: impl FnOnce(&mut LogContext)) {
    // Inside a tokio task the context follows the task, not the worker thread
    if let Some(task_id) = current_task_id() {
        let store = TASK_LOG_CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()));
        if let Ok(mut contexts) = store.lock() {
            update(contexts.entry(task_id).or_default());
            return;
        }
    }

    LOG_CONTEXT.with(|c| update(&mut c.borrow_mut()));
}

fn current_task_id() -> Option<String> {
    tokio::task::try_id().map(|id| id.to_string())
}

fn task_context_snapshot() -> Option<LogContext> {
    let task_id = current_task_id()?;
    let store = TASK_LOG_CONTEXTS.get()?;
    let contexts = store.lock().ok()?;
    contexts.get(&task_id).cloned()
}

fn context_prefix() -> String {
    if let Some(task_ctx) = task_context_snapshot() {
        return context_prefix_for(&task_ctx);
    }

    LOG_CONTEXT.with(|c| context_prefix_for(&c.borrow()))
}

fn context_prefix_for(ctx: &LogContext) -> String {
    let mut parts = Vec::new();

    if let Some(ref session) = ctx.session {
        let short: String = session.chars().take(20).collect();
        parts.push(format!("ses:{}", short));
    }
    if let Some(ref provider) = ctx.provider {
        parts.push(format!("prv:{}", provider));
    }
    if let Some(ref model) = ctx.model {
        // Just use first part of model name
        let short = model.split('-').next().unwrap_or(model);
        parts.push(format!("mod:{}", short));
    }

    if parts.is_empty() {
        String::new()
    } else {
        format!("[{}] ", parts.join("|"))
    }
}

struct Logger {
    file: File,
}

impl Logger {
    fn new() -> Option<Self> {
        let path = log_path()?;
        fs::create_dir_all(path.parent()?).ok()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()?;

        Some(Self { file })
    }

    fn write(&mut self, level: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let ctx = context_prefix();
        let line = format!("[{}] [{}] {}{}\n", timestamp, level, ctx, message);
        let _ = self.file.write_all(line.as_bytes());
        let _ = self.file.flush();
    }
}

/// Initialize the logger (call once at startup)
pub fn init() {
    let mut guard = LOGGER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if guard.is_none() {
        *guard = Logger::new();
    }
}

fn write(level: &str, message: &str) {
    if let Ok(mut guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_mut() {
            logger.write(level, message);
        }
    }
}

pub fn info(message: &str) {
    write("INFO", message);
}

pub fn error(message: &str) {
    write("ERROR", message);
}

pub fn warn(message: &str) {
    write("WARN", message);
}

/// Log a debug message (only if JCODE_TRACE is set)
pub fn debug(message: &str) {
    if std::env::var("JCODE_TRACE").is_ok() {
        write("DEBUG", message);
    }
}

/// Log a tool call
pub fn tool_call(name: &str, input: &str, output: &str) {
    let msg = format!(
        "TOOL[{}] input={} output={}",
        name,
        truncate(input, 200),
        truncate(output, 500)
    );
    write("TOOL", &msg);
}

fn log_dir() -> Option<PathBuf> {
    jcode_dir().ok().map(|dir| dir.join("logs"))
}

/// Path to today's log file
pub fn log_path() -> Option<PathBuf> {
    let date = Local::now().format("%Y-%m-%d");
    Some(log_dir()?.join(format!("jcode-{}.log", date)))
}

/// Clean up old logs (keep last 7 days)
pub fn cleanup_old_logs() {
    let Some(log_dir) = log_dir() else {
        return;
    };
    let Ok(entries) = fs::read_dir(&log_dir) else {
        return;
    };
    let cutoff = Local::now() - chrono::Duration::days(KEEP_DAYS);
    for entry in entries.flatten() {
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        let modified: chrono::DateTime<Local> = modified.into();
        if modified < cutoff {
            let _ = fs::remove_file(entry.path());
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() > max_len {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    } else {
        s.to_string()
    }
}
