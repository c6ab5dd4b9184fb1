//! Durable per-book progress records.
//!
//! Every mutation rewrites the whole snapshot through a temp file and a
//! rename, so a kill at any moment leaves either the old or the new ledger on
//! disk and never a torn one.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

#[async_trait]
pub trait LedgerStore<T>: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<T>>;
    async fn save(&self, state: &T) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonFileLedger<T> {
    path: PathBuf,
    _state: PhantomData<fn() -> T>,
}

impl<T> JsonFileLedger<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _state: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

impl<T> JsonFileLedger<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// The persisted state verbatim, or `seed()` when nothing was saved yet.
    /// A seeded state is written out immediately.
    pub async fn load_or_seed(&self, seed: impl FnOnce() -> T) -> anyhow::Result<T> {
        if let Some(state) = self.load().await? {
            tracing::info!(path = %self.path.display(), "resuming from saved progress");
            return Ok(state);
        }
        let state = seed();
        self.save(&state).await?;
        Ok(state)
    }
}

#[async_trait]
impl<T> LedgerStore<T> for JsonFileLedger<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn load(&self) -> anyhow::Result<Option<T>> {
        read_json(&self.path)
            .await
            .with_context(|| format!("read: {}", self.path.display()))
    }

    async fn save(&self, state: &T) -> anyhow::Result<()> {
        write_json_atomic(&self.path, state)
            .await
            .with_context(|| format!("write: {}", self.path.display()))
    }
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    write_file_atomic(path, &data).await
}

/// Writes `data` next to `path` and renames it into place, so readers never
/// observe a half-written file.
pub async fn write_file_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(
        ".{file_name}.tmp.{}",
        uuid::Uuid::new_v4().simple()
    ));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
