use anyhow::Result;
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use jcode_engine::bus::Bus;
use jcode_engine::config::config;
use jcode_engine::logging;
use jcode_engine::message::{Message, Part, Role};
use jcode_engine::session::SessionStore;
use jcode_engine::snapshot::SnapshotManager;
use jcode_engine::storage::{StorageEngine, jcode_dir};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "jcode-engine")]
#[command(version = env!("JCODE_VERSION"))]
#[command(about = "Inspect and maintain jcode sessions, storage, and snapshots")]
struct Args {
    /// Working directory (snapshot work tree)
    #[arg(short = 'C', long, global = true)]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List sessions, newest first
    Sessions,

    /// Print the messages of a session
    Messages {
        /// Session id
        session: String,
    },

    /// Run pending storage migrations
    Migrate,

    /// Show the effective configuration
    Config,

    /// Working-tree snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Record the working tree and print the snapshot hash
    Track { session: String },

    /// List files changed since a snapshot
    Patch { session: String, hash: String },

    /// Force the working tree back to a snapshot
    Restore { session: String, hash: String },

    /// Undo the changes made since each snapshot, oldest first
    Revert {
        session: String,
        #[arg(required = true)]
        hashes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    logging::cleanup_old_logs();

    let args = Args::parse();
    logging::info(&format!("jcode-engine {:?}", args.command));

    if let Err(e) = run(args).await {
        logging::error(&format!("{:?}", e));
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let data_dir = jcode_dir()?;
    let storage = Arc::new(StorageEngine::new(data_dir.join("storage"), Bus::new()));
    let sessions = SessionStore::new(storage.clone());

    match args.command {
        Command::Sessions => {
            for session in sessions.list().await? {
                let parent = session
                    .parent_id
                    .as_deref()
                    .map(|p| format!("  (child of {})", p))
                    .unwrap_or_default();
                println!(
                    "{}  {}  {}{}",
                    session.id,
                    format_time(session.time.updated),
                    session.title,
                    parent
                );
            }
        }
        Command::Messages { session } => {
            for message in sessions.messages(&session).await? {
                print_message(&message);
            }
        }
        Command::Migrate => {
            storage.migrate().await?;
            println!("Storage at {} is up to date", storage.root().display());
        }
        Command::Config => {
            println!("{}", config().display_string());
        }
        Command::Snapshot { command } => {
            let worktree = match args.cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir()?,
            };
            let snapshots = SnapshotManager::new(&data_dir, worktree)
                .with_git_binary(config().snapshot.git_binary.clone());
            run_snapshot(&snapshots, command).await?;
        }
    }
    Ok(())
}

async fn run_snapshot(snapshots: &SnapshotManager, command: SnapshotCommand) -> Result<()> {
    match command {
        SnapshotCommand::Track { session } => {
            println!("{}", snapshots.track(&session).await?);
        }
        SnapshotCommand::Patch { session, hash } => {
            for file in snapshots.patch(&session, &hash).await?.files {
                println!("{}", file);
            }
        }
        SnapshotCommand::Restore { session, hash } => {
            snapshots.restore(&session, &hash).await?;
        }
        SnapshotCommand::Revert { session, hashes } => {
            let mut patches = Vec::with_capacity(hashes.len());
            for hash in &hashes {
                patches.push(snapshots.patch(&session, hash).await?);
            }
            snapshots.revert(&session, &patches).await?;
            let files: usize = patches.iter().map(|p| p.files.len()).sum();
            println!(
                "Reverted {} file change(s) in {}",
                files,
                snapshots.worktree().display()
            );
        }
    }
    Ok(())
}

fn print_message(message: &Message) {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant if message.is_summary() => "summary",
        Role::Assistant => "assistant",
    };
    println!(
        "── {} {} ({})",
        role,
        message.id,
        format_time(message.metadata.time.created)
    );
    for part in &message.parts {
        match part {
            Part::Text { text } => println!("{}", text),
            Part::ToolInvocation { tool_invocation } => println!(
                "[{}] {} -> {}",
                tool_invocation.tool_name(),
                tool_invocation.args(),
                tool_invocation.result().unwrap_or("(pending)")
            ),
            Part::StepStart => {}
        }
    }
    if let Some(assistant) = &message.metadata.assistant {
        println!(
            "   {}/{}  ${:.4}  {} tokens",
            assistant.provider_id,
            assistant.model_id,
            assistant.cost,
            assistant.tokens.total()
        );
        if let Some(error) = &assistant.error {
            println!("   error: {}", error);
        }
    }
    println!();
}

fn format_time(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}
