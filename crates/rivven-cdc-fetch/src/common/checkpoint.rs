//! # Split checkpointing
//!
//! Persistent offset tracking for incremental splits. A checkpoint stores the
//! split's table set and the offset reached so far; recovery builds a new
//! [`IncrementalSplit`] starting there.
//!
//! ## Features
//!
//! - **Durable Storage**: JSON files written to a temp file and renamed
//! - **Optional fsync** after each write
//! - **Recovery**: existing checkpoints are loaded when the store opens
//!
//! ```ignore
//! let store = CheckpointStore::new("/var/rivven/checkpoints").await?;
//! store.save(&SplitCheckpoint::new(split.split_id(), split.table_ids.clone(), offset)).await?;
//!
//! if let Some(cp) = store.load(&split.split_id()).await? {
//!     let resumed = cp.apply_to(&split);
//! }
//! ```

use crate::common::error::{CdcError, Result};
use crate::common::offset::Offset;
use crate::common::split::{IncrementalSplit, SplitId, TableId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Progress of one incremental split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitCheckpoint {
    pub split_id: SplitId,
    pub table_ids: Vec<TableId>,
    pub offset: Offset,
    pub created_at: DateTime<Utc>,
}

impl SplitCheckpoint {
    pub fn new(split_id: SplitId, table_ids: Vec<TableId>, offset: Offset) -> Self {
        Self {
            split_id,
            table_ids,
            offset,
            created_at: Utc::now(),
        }
    }

    /// Storage key derived from the split id.
    pub fn key(&self) -> String {
        checkpoint_key(&self.split_id)
    }

    /// `split` resumed from this checkpoint.
    pub fn apply_to(&self, split: &IncrementalSplit) -> IncrementalSplit {
        IncrementalSplit {
            table_ids: self.table_ids.clone(),
            ..split.with_starting_offset(self.offset.clone())
        }
    }

    /// A fresh unbounded split from the checkpoint alone.
    pub fn into_split(self) -> IncrementalSplit {
        IncrementalSplit::from_checkpoint(&self)
    }

    /// Age of the checkpoint in seconds.
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds()
    }
}

/// Storage key for a split id: `scope_index`.
pub fn checkpoint_key(split_id: &SplitId) -> String {
    format!("{}_{}", split_id.scope, split_id.index)
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
        return Err(CdcError::config(format!("Invalid checkpoint key '{}'", key)));
    }
    Ok(())
}

/// Persistent checkpoint storage.
///
/// Stores one JSON file per split with atomic writes.
pub struct CheckpointStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, SplitCheckpoint>>,
    fsync: bool,
}

impl CheckpointStore {
    /// Open a store, loading existing checkpoints. Writes are fsynced.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Open a store with explicit fsync behaviour.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        };
        store.load_all().await?;
        Ok(store)
    }

    pub async fn save(&self, checkpoint: &SplitCheckpoint) -> Result<()> {
        let key = checkpoint.key();
        validate_key(&key)?;

        let file_path = self.file_path(&key);
        let temp_path = file_path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(checkpoint)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &file_path).await?;

        self.cache.write().await.insert(key.clone(), checkpoint.clone());
        debug!("Saved checkpoint for {}: {}", key, checkpoint.offset);
        Ok(())
    }

    pub async fn load(&self, split_id: &SplitId) -> Result<Option<SplitCheckpoint>> {
        self.load_key(&checkpoint_key(split_id)).await
    }

    async fn load_key(&self, key: &str) -> Result<Option<SplitCheckpoint>> {
        if let Some(cp) = self.cache.read().await.get(key) {
            return Ok(Some(cp.clone()));
        }

        let file_path = self.file_path(key);
        let contents = match fs::read(&file_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: SplitCheckpoint = serde_json::from_slice(&contents)?;

        self.cache
            .write()
            .await
            .insert(key.to_string(), checkpoint.clone());
        Ok(Some(checkpoint))
    }

    pub async fn delete(&self, split_id: &SplitId) -> Result<()> {
        let key = checkpoint_key(split_id);
        let file_path = self.file_path(&key);
        match fs::remove_file(&file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.write().await.remove(&key);
        info!("Deleted checkpoint for {}", split_id);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<SplitId>> {
        let cache = self.cache.read().await;
        let mut ids: Vec<SplitId> = cache.values().map(|cp| cp.split_id.clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await?;

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    match self.load_key(stem).await {
                        Ok(Some(_)) => loaded += 1,
                        Ok(None) => {}
                        Err(e) => warn!("Failed to load checkpoint {}: {}", stem, e),
                    }
                }
            }
        }

        if loaded > 0 {
            info!("Loaded {} checkpoints from {}", loaded, self.base_dir.display());
        }
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", key))
    }
}

/// In-memory checkpoint store (for tests or when persistence isn't needed).
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<SplitId, SplitCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Trait for checkpoint storage backends.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn save(&self, checkpoint: &SplitCheckpoint) -> Result<()>;
    async fn load(&self, split_id: &SplitId) -> Result<Option<SplitCheckpoint>>;
    async fn delete(&self, split_id: &SplitId) -> Result<()>;
    async fn list(&self) -> Result<Vec<SplitId>>;
}

#[async_trait]
impl CheckpointBackend for CheckpointStore {
    async fn save(&self, checkpoint: &SplitCheckpoint) -> Result<()> {
        CheckpointStore::save(self, checkpoint).await
    }

    async fn load(&self, split_id: &SplitId) -> Result<Option<SplitCheckpoint>> {
        CheckpointStore::load(self, split_id).await
    }

    async fn delete(&self, split_id: &SplitId) -> Result<()> {
        CheckpointStore::delete(self, split_id).await
    }

    async fn list(&self) -> Result<Vec<SplitId>> {
        CheckpointStore::list(self).await
    }
}

#[async_trait]
impl CheckpointBackend for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &SplitCheckpoint) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.split_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, split_id: &SplitId) -> Result<Option<SplitCheckpoint>> {
        Ok(self.checkpoints.read().await.get(split_id).cloned())
    }

    async fn delete(&self, split_id: &SplitId) -> Result<()> {
        self.checkpoints.write().await.remove(split_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SplitId>> {
        let mut ids: Vec<SplitId> = self.checkpoints.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Shared checkpoint backend.
pub type SharedCheckpointBackend = Arc<dyn CheckpointBackend>;
