//! Configuration file support for jcode-engine
//!
//! Config is loaded from `~/.jcode/config.toml` (or `$JCODE_HOME/config.toml`)
//! Environment variables override config file settings.

use crate::storage::jcode_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global config instance (loaded once on first access)
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::load)
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Turn loop configuration
    pub chat: ChatConfig,

    /// Share link configuration
    pub share: ShareConfig,

    /// Working-tree snapshot configuration
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    /// Fraction of the usable context window that triggers summarization (default: 0.9)
    pub compaction_threshold: f64,
    /// Summaries allowed before a single turn gives up and proceeds (default: 2)
    pub max_compactions: usize,
    /// Model steps per turn when tools keep getting called (default: 1000)
    pub max_steps: usize,
    /// Output token cap for title generation (default: 32)
    pub title_max_tokens: u32,
    /// Generate a title from the first message of a session (default: true)
    pub generate_titles: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 0.9,
            max_compactions: 2,
            max_steps: 1000,
            title_max_tokens: 32,
            generate_titles: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ShareConfig {
    /// Create a share link for every new root session (default: false)
    pub auto_share: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SnapshotConfig {
    /// git executable used for snapshots (default: "git")
    pub git_binary: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            git_binary: "git".to_string(),
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn path() -> Option<PathBuf> {
        jcode_dir().ok().map(|d| d.join("config.toml"))
    }

    /// Load config from file, with environment variable overrides
    pub fn load() -> Self {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Load config from file only (no env overrides)
    fn load_from_file() -> Option<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return None;
        }

        let content = std::fs::read_to_string(&path).ok()?;
        match toml::from_str::<Self>(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                crate::logging::error(&format!("Failed to parse config file: {}", e));
                None
            }
        }
    }

    /// Apply `JCODE_*` overrides; unparseable values are ignored
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("JCODE_COMPACTION_THRESHOLD") {
            if let Ok(parsed) = v.trim().parse::<f64>() {
                if parsed > 0.0 && parsed <= 1.0 {
                    self.chat.compaction_threshold = parsed;
                }
            }
        }
        if let Some(v) = var("JCODE_MAX_STEPS") {
            if let Ok(parsed) = v.trim().parse::<usize>() {
                self.chat.max_steps = parsed.max(1);
            }
        }
        if let Some(v) = var("JCODE_GENERATE_TITLES") {
            if let Some(parsed) = parse_env_bool(&v) {
                self.chat.generate_titles = parsed;
            }
        }
        if let Some(v) = var("JCODE_AUTO_SHARE") {
            if let Some(parsed) = parse_env_bool(&v) {
                self.share.auto_share = parsed;
            }
        }
    }

    /// Human-readable summary for `jcode-engine config`
    pub fn display_string(&self) -> String {
        let path = Self::path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(unavailable)".to_string());
        format!(
            "Config file: {}\n\n\
             [chat]\n\
             compaction_threshold = {}\n\
             max_compactions = {}\n\
             max_steps = {}\n\
             title_max_tokens = {}\n\
             generate_titles = {}\n\n\
             [share]\n\
             auto_share = {}\n\n\
             [snapshot]\n\
             git_binary = {:?}",
            path,
            self.chat.compaction_threshold,
            self.chat.max_compactions,
            self.chat.max_steps,
            self.chat.title_max_tokens,
            self.chat.generate_titles,
            self.share.auto_share,
            self.snapshot.git_binary,
        )
    }
}

fn parse_env_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
