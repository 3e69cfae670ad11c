//! Working-tree checkpoints.
//!
//! Each session gets its own git directory under `<data>/snapshot/<session>` whose
//! work tree is the project directory, so snapshots never touch the project's own
//! repository.

use crate::logging;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Paths per `git add` / `git rm` invocation
const PATH_BATCH: usize = 256;

/// Files changed since a snapshot, relative to the work tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub hash: String,
    pub files: Vec<String>,
}

pub struct SnapshotManager {
    data_dir: PathBuf,
    worktree: PathBuf,
    git_binary: String,
}

impl SnapshotManager {
    pub fn new(data_dir: impl Into<PathBuf>, worktree: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            worktree: worktree.into(),
            git_binary: "git".to_string(),
        }
    }

    pub fn with_git_binary(mut self, git_binary: impl Into<String>) -> Self {
        self.git_binary = git_binary.into();
        self
    }

    pub fn worktree(&self) -> &Path {
        &self.worktree
    }

    pub fn git_dir(&self, session_id: &str) -> Result<PathBuf> {
        if session_id.is_empty()
            || session_id == "."
            || session_id == ".."
            || session_id.contains(['/', '\\'])
        {
            bail!("invalid session id for snapshot: {:?}", session_id);
        }
        Ok(self.data_dir.join("snapshot").join(session_id))
    }

    /// Record the full working tree and return the commit hash
    pub async fn track(&self, session_id: &str) -> Result<String> {
        let git_dir = self.git_dir(session_id)?;
        if !git_dir.exists() {
            tokio::fs::create_dir_all(&git_dir).await?;
            self.git(&git_dir, &["init", "--quiet"]).await?;
            logging::info(&format!("snapshot: initialized {}", git_dir.display()));
        }

        let (added, removed) = self.stage(&git_dir).await?;
        self.git(
            &git_dir,
            &[
                "-c",
                "user.name=jcode",
                "-c",
                "user.email=jcode@localhost",
                "-c",
                "commit.gpgsign=false",
                "commit",
                "--quiet",
                "--allow-empty",
                "--no-verify",
                "-m",
                "snapshot",
            ],
        )
        .await?;
        let hash = self.git(&git_dir, &["rev-parse", "HEAD"]).await?;
        let hash = hash.trim().to_string();
        logging::info(&format!(
            "snapshot: {} (+{} -{}) for {}",
            hash,
            added,
            removed,
            session_id
        ));
        Ok(hash)
    }

    /// Paths that differ between `hash` and the current working tree. An unknown
    /// hash yields no files.
    pub async fn patch(&self, session_id: &str, hash: &str) -> Result<Patch> {
        let git_dir = self.git_dir(session_id)?;
        let empty = Patch {
            hash: hash.to_string(),
            files: Vec::new(),
        };
        if !git_dir.exists() {
            return Ok(empty);
        }

        self.stage(&git_dir).await?;
        let diff = match self
            .git(
                &git_dir,
                &["diff", "--cached", "--name-only", "--no-renames", "-z", hash],
            )
            .await
        {
            Ok(diff) => diff,
            Err(e) => {
                logging::debug(&format!("snapshot: no patch for {}: {}", hash, e));
                return Ok(empty);
            }
        };

        Ok(Patch {
            hash: hash.to_string(),
            files: diff
                .split('\0')
                .filter(|path| !path.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }

    /// Force the working tree back to `hash`. Files created since are left alone.
    pub async fn restore(&self, session_id: &str, hash: &str) -> Result<()> {
        let git_dir = self.git_dir(session_id)?;
        self.git(&git_dir, &["read-tree", hash]).await?;
        self.git(&git_dir, &["checkout-index", "-a", "-f"]).await?;
        Ok(())
    }

    /// Undo the listed patches file by file. The first patch naming a file decides
    /// its content: restored from that snapshot, or deleted if it did not exist then.
    pub async fn revert(&self, session_id: &str, patches: &[Patch]) -> Result<()> {
        if patches.is_empty() {
            return Ok(());
        }
        let git_dir = self.git_dir(session_id)?;

        let mut seen = HashSet::new();
        for patch in patches {
            for file in &patch.files {
                if !seen.insert(file.as_str()) {
                    continue;
                }
                let listed = self
                    .git(&git_dir, &["ls-tree", "--name-only", &patch.hash, "--", file])
                    .await?;
                if listed.trim().is_empty() {
                    match tokio::fs::remove_file(self.worktree.join(file)).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(e).with_context(|| format!("failed to remove {}", file));
                        }
                    }
                } else {
                    self.git(&git_dir, &["checkout", &patch.hash, "--", file])
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Bring the snapshot index in line with the work tree, skipping ignored paths.
    /// Returns how many paths were added and removed.
    async fn stage(&self, git_dir: &Path) -> Result<(usize, usize)> {
        let status = self
            .git(
                git_dir,
                &["status", "--porcelain", "-z", "--no-renames", "--untracked-files=all"],
            )
            .await?;
        let mut present = Vec::new();
        let mut removed = Vec::new();
        for entry in status.split('\0').filter(|entry| entry.len() > 3) {
            let path = &entry[3..];
            if tokio::fs::symlink_metadata(self.worktree.join(path)).await.is_ok() {
                present.push(path.to_string());
            } else {
                removed.push(path.to_string());
            }
        }

        for batch in present.chunks(PATH_BATCH) {
            let mut args = vec!["add", "--force", "--"];
            args.extend(batch.iter().map(String::as_str));
            self.git(git_dir, &args).await?;
        }
        for batch in removed.chunks(PATH_BATCH) {
            let mut args = vec!["rm", "--cached", "--quiet", "--ignore-unmatch", "--"];
            args.extend(batch.iter().map(String::as_str));
            self.git(git_dir, &args).await?;
        }
        Ok((present.len(), removed.len()))
    }

    async fn git(&self, git_dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.git_binary)
            .arg("--git-dir")
            .arg(git_dir)
            .arg("--work-tree")
            .arg(&self.worktree)
            .args(args)
            .current_dir(&self.worktree)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.git_binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
