//! Keyed JSON document store.
//!
//! A key is an ordered list of path segments; `["session", "info", id]` lives at
//! `<root>/session/info/<id>.json`. Reads and writes lock only their own file, while
//! `update` also holds one engine-wide lock for its whole read-modify-write cycle.

use crate::bus::{Bus, BusEvent};
use crate::logging;
use crate::migration::{self, Migration};
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, RwLock};
use walkdir::WalkDir;

const DOCUMENT_EXT: &str = "json";
const MIGRATION_FILE: &str = "migration";
/// Drop idle per-file locks once the map grows past this size
const LOCK_PRUNE_THRESHOLD: usize = 1024;

pub fn jcode_dir() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("JCODE_HOME") {
        return Ok(PathBuf::from(path));
    }

    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("No home directory"))?;
    Ok(home.join(".jcode"))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    let file = std::fs::File::create(&tmp_path)?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    std::fs::rename(tmp_path, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

async fn write_json_async(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    let data = serde_json::to_vec(value)?;
    tokio::fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage key not found: {0}")]
    NotFound(String),
    #[error("invalid storage key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
}

pub struct StorageEngine {
    root: PathBuf,
    bus: Bus,
    file_locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
    update_lock: AsyncMutex<()>,
    migrations: Vec<Migration>,
    migrated: OnceCell<()>,
}

impl StorageEngine {
    pub fn new(root: impl Into<PathBuf>, bus: Bus) -> Self {
        Self::with_migrations(root, bus, migration::all())
    }

    pub fn with_migrations(root: impl Into<PathBuf>, bus: Bus, migrations: Vec<Migration>) -> Self {
        Self {
            root: root.into(),
            bus,
            file_locks: Mutex::new(HashMap::new()),
            update_lock: AsyncMutex::new(()),
            migrations,
            migrated: OnceCell::new(),
        }
    }

    /// Storage under `~/.jcode/storage`
    pub fn open_default(bus: Bus) -> Result<Self> {
        Ok(Self::new(jcode_dir()?.join("storage"), bus))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Read a document; a missing document is `StorageError::NotFound`
    pub async fn read<T: DeserializeOwned>(&self, key: &[&str]) -> Result<T> {
        self.read_optional(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.join("/")).into())
    }

    pub async fn read_optional<T: DeserializeOwned>(&self, key: &[&str]) -> Result<Option<T>> {
        self.ensure_migrated().await?;
        let path = self.path_for(key)?;
        let lock = self.file_lock(&path);
        let _guard = lock.read().await;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub async fn write<T: Serialize + ?Sized>(&self, key: &[&str], value: &T) -> Result<()> {
        self.ensure_migrated().await?;
        let path = self.path_for(key)?;
        let content = serde_json::to_value(value)?;
        {
            let lock = self.file_lock(&path);
            let _guard = lock.write().await;
            write_json_async(&path, &content).await?;
        }
        self.publish_write(key, content);
        Ok(())
    }

    /// Read-modify-write under the engine-wide update lock. Returns the stored document.
    pub async fn update<T, F>(&self, key: &[&str], editor: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(&mut T) + Send,
    {
        self.ensure_migrated().await?;
        let path = self.path_for(key)?;
        let (document, content) = {
            let _update = self.update_lock.lock().await;
            let lock = self.file_lock(&path);
            let _guard = lock.write().await;

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StorageError::NotFound(key.join("/")).into());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to read {}", path.display()));
                }
            };
            let mut document: T = serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            editor(&mut document);
            let content = serde_json::to_value(&document)?;
            write_json_async(&path, &content).await?;
            (document, content)
        };
        self.publish_write(key, content);
        Ok(document)
    }

    /// Delete a document. Removing a missing key is not an error.
    pub async fn remove(&self, key: &[&str]) -> Result<()> {
        self.ensure_migrated().await?;
        let path = self.path_for(key)?;
        let lock = self.file_lock(&path);
        let _guard = lock.write().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    /// All keys under `prefix`, sorted. A missing directory lists as empty.
    pub async fn list(&self, prefix: &[&str]) -> Result<Vec<Vec<String>>> {
        self.ensure_migrated().await?;
        let mut dir = self.root.clone();
        for segment in prefix {
            validate_segment(prefix, segment)?;
            dir.push(segment);
        }
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_keys(&root, &dir)).await?
    }

    /// Run pending migrations now instead of on first access
    pub async fn migrate(&self) -> Result<()> {
        self.ensure_migrated().await
    }

    fn path_for(&self, key: &[&str]) -> Result<PathBuf> {
        let Some((last, parents)) = key.split_last() else {
            return Err(StorageError::InvalidKey {
                key: String::new(),
                reason: "empty key",
            }
            .into());
        };
        let mut path = self.root.clone();
        for segment in parents {
            validate_segment(key, segment)?;
            path.push(segment);
        }
        validate_segment(key, last)?;
        path.push(format!("{}.{}", last, DOCUMENT_EXT));
        Ok(path)
    }

    fn file_lock(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut locks = self
            .file_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.len() > LOCK_PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    fn publish_write(&self, key: &[&str], content: Value) {
        self.bus.publish(BusEvent::StorageWrite {
            key: key.iter().map(|s| s.to_string()).collect(),
            content,
        });
    }

    async fn ensure_migrated(&self) -> Result<()> {
        self.migrated
            .get_or_try_init(|| async {
                let root = self.root.clone();
                let migrations = self.migrations.clone();
                tokio::task::spawn_blocking(move || run_migrations(&root, &migrations))
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|outcome| outcome)
            })
            .await?;
        Ok(())
    }
}

fn validate_segment(key: &[&str], segment: &str) -> Result<()> {
    let reason = if segment.is_empty() {
        "empty segment"
    } else if segment == "." || segment == ".." {
        "relative segment"
    } else if segment.contains(['/', '\\']) {
        "segment contains a path separator"
    } else {
        return Ok(());
    };
    Err(StorageError::InvalidKey {
        key: key.join("/"),
        reason,
    }
    .into())
}

fn scan_keys(root: &Path, dir: &Path) -> Result<Vec<Vec<String>>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut keys = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            // Raced with a remove
            Err(e)
                if e.io_error()
                    .map(|io| io.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false) =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(DOCUMENT_EXT) {
            continue;
        }
        let Ok(relative) = path.with_extension("").strip_prefix(root).map(Path::to_path_buf) else {
            continue;
        };
        let key: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        keys.push(key);
    }
    keys.sort();
    Ok(keys)
}

fn run_migrations(root: &Path, migrations: &[Migration]) -> Result<()> {
    ensure_dir(root)?;
    let marker = root.join(MIGRATION_FILE);
    let mut done: usize = match std::fs::read_to_string(&marker) {
        Ok(content) => content.trim().parse().unwrap_or(0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    for (index, migration) in migrations.iter().enumerate().skip(done) {
        logging::info(&format!("storage: running migration {}", index + 1));
        migration(root).with_context(|| format!("migration {} failed", index + 1))?;
        done = index + 1;
        std::fs::write(&marker, done.to_string())?;
    }
    Ok(())
}
