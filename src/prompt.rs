//! System prompt management

use crate::storage::jcode_dir;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Default system prompt for Anthropic models (embedded at compile time)
pub const ANTHROPIC_PROMPT: &str = include_str!("prompt/anthropic.txt");

/// Default system prompt for every other provider
pub const GENERIC_PROMPT: &str = include_str!("prompt/generic.txt");

/// Instructions for generating a session title
pub const TITLE_PROMPT: &str = include_str!("prompt/title.txt");

/// Project instruction files, looked up from the working directory upwards
const INSTRUCTION_FILES: [&str; 3] = ["AGENTS.md", "CLAUDE.md", "CONTEXT.md"];

/// Where the prompt looks for environment details and instructions
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub working_dir: PathBuf,
    /// Directory holding the global AGENTS.md (normally ~/.jcode)
    pub global_dir: Option<PathBuf>,
}

impl PromptContext {
    pub fn detect() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            global_dir: jcode_dir().ok(),
        }
    }
}

pub fn provider_prompt(provider_id: &str) -> &'static str {
    if provider_id == "anthropic" {
        ANTHROPIC_PROMPT
    } else {
        GENERIC_PROMPT
    }
}

/// System prompt sections, in order: the override (or the provider's default),
/// the environment, then custom instructions.
pub async fn build_system_prompt(
    provider_id: &str,
    system_override: Option<&[String]>,
    ctx: &PromptContext,
) -> Vec<String> {
    let mut parts = match system_override {
        Some(custom) => custom.to_vec(),
        None => vec![provider_prompt(provider_id).trim().to_string()],
    };

    parts.push(build_env_context(&ctx.working_dir).await);
    parts.extend(load_instructions(ctx));
    parts
}

/// Build environment context (date, cwd, git status)
async fn build_env_context(working_dir: &Path) -> String {
    let mut lines = vec!["# Environment".to_string()];

    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    lines.push(format!("Date: {}", date));
    lines.push(format!("Working directory: {}", working_dir.display()));
    lines.push(format!("Platform: {}", std::env::consts::OS));

    if let Some(git_info) = get_git_info(working_dir).await {
        lines.push(git_info);
    }

    lines.join("\n")
}

async fn git(working_dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(working_dir)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Get git branch and status summary
async fn get_git_info(working_dir: &Path) -> Option<String> {
    git(working_dir, &["rev-parse", "--is-inside-work-tree"]).await?;

    let mut info = vec!["Git:".to_string()];

    if let Some(branch) = git(working_dir, &["branch", "--show-current"]).await {
        let branch = branch.trim();
        if !branch.is_empty() {
            info.push(format!("  Branch: {}", branch));
        }
    }

    if let Some(status) = git(working_dir, &["status", "--porcelain"]).await {
        let total = status.lines().count();
        if total > 0 {
            info.push(format!("  Modified: {} files", total));
            for file in status.lines().take(5) {
                info.push(format!("    {}", file));
            }
            if total > 5 {
                info.push("    ...".to_string());
            }
        }
    }

    if info.len() > 1 {
        Some(info.join("\n"))
    } else {
        None
    }
}

/// Instruction files from the working directory up to the filesystem root, then
/// the global AGENTS.md
fn load_instructions(ctx: &PromptContext) -> Vec<String> {
    let mut contents = Vec::new();

    for dir in ctx.working_dir.ancestors() {
        for name in INSTRUCTION_FILES {
            let path = dir.join(name);
            if let Ok(content) = std::fs::read_to_string(&path) {
                contents.push(format!(
                    "# Project Instructions ({})\n\n{}",
                    path.display(),
                    content.trim()
                ));
            }
        }
    }

    if let Some(global_dir) = &ctx.global_dir {
        if let Ok(content) = std::fs::read_to_string(global_dir.join("AGENTS.md")) {
            contents.push(format!(
                "# Global Instructions (~/.jcode/AGENTS.md)\n\n{}",
                content.trim()
            ));
        }
    }

    contents
}
