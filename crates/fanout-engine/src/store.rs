//! Config store strategies
//!
//! Both stores keep two logical tables: cluster configs (unique by
//! collection) and worker checkpoints (unique by collection and partition).

use async_trait::async_trait;
use fanout_core::prelude::*;
use fanout_core::{ClusterConfig, WorkerCheckpoint};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Both tables of a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    clusters: Vec<ClusterConfig>,
    checkpoints: Vec<WorkerCheckpoint>,
}

impl Tables {
    fn find_cluster(&self, collection: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.collection == collection)
    }

    /// Returns the record and whether it was created
    fn get_or_init_cluster(&mut self, collection: &str, partitions: u32) -> (ClusterConfig, bool) {
        if let Some(existing) = self.find_cluster(collection) {
            return (existing.clone(), false);
        }
        let created = ClusterConfig::new(collection, partitions);
        self.clusters.push(created.clone());
        (created, true)
    }

    fn get_or_init_checkpoint(&mut self, collection: &str, partition: u32) -> (WorkerCheckpoint, bool) {
        if let Some(existing) = self
            .checkpoints
            .iter()
            .find(|c| c.collection == collection && c.partition == partition)
        {
            return (existing.clone(), false);
        }
        let created = WorkerCheckpoint::new(collection, partition);
        self.checkpoints.push(created.clone());
        (created, true)
    }

    fn update_resume_token(&mut self, checkpoint_id: Uuid, token: &ResumeToken) -> Result<()> {
        let checkpoint = self
            .checkpoints
            .iter_mut()
            .find(|c| c.id == checkpoint_id)
            .ok_or_else(|| FanoutError::store(format!("No worker checkpoint with id {}", checkpoint_id)))?;
        checkpoint.resume_token = Some(token.clone());
        Ok(())
    }
}

// ============================================================================
// Memory Config Store (for testing)
// ============================================================================

/// In-memory config store
pub struct MemoryConfigStore {
    tables: RwLock<Tables>,
    failing_updates: AtomicUsize,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            failing_updates: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` resume token updates fail
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// Checkpoint of a partition, without creating it
    pub async fn checkpoint(&self, collection: &str, partition: u32) -> Option<WorkerCheckpoint> {
        self.tables
            .read()
            .await
            .checkpoints
            .iter()
            .find(|c| c.collection == collection && c.partition == partition)
            .cloned()
    }

    pub async fn cluster_configs(&self) -> Vec<ClusterConfig> {
        self.tables.read().await.clusters.clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn find_cluster_config(&self, collection: &str) -> Result<Option<ClusterConfig>> {
        Ok(self.tables.read().await.find_cluster(collection).cloned())
    }

    async fn get_or_init_cluster_config(&self, collection: &str, partitions: u32) -> Result<ClusterConfig> {
        Ok(self.tables.write().await.get_or_init_cluster(collection, partitions).0)
    }

    async fn get_or_init_checkpoint(&self, collection: &str, partition: u32) -> Result<WorkerCheckpoint> {
        Ok(self.tables.write().await.get_or_init_checkpoint(collection, partition).0)
    }

    async fn update_resume_token(&self, checkpoint_id: Uuid, token: &ResumeToken) -> Result<()> {
        if self.take_injected_failure() {
            return Err(FanoutError::store("injected update failure"));
        }
        self.tables.write().await.update_resume_token(checkpoint_id, token)
    }

    fn name(&self) -> &'static str {
        "memory_config_store"
    }
}

// ============================================================================
// File Config Store
// ============================================================================

/// JSON file holding both tables under their configured names
///
/// Nothing is cached: every call rereads the file under an advisory lock on
/// a sibling `.lock` file, so several managers (or processes) can share one
/// store. Mutations rewrite the file atomically via a temp file.
pub struct FileConfigStore {
    path: PathBuf,
    cluster_table: String,
    worker_table: String,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let defaults = FanoutConfig::default();
        Self {
            path: path.into(),
            cluster_table: defaults.cluster_config_collection_name,
            worker_table: defaults.worker_config_collection_name,
            write_lock: Mutex::new(()),
        }
    }

    /// Builder: set table names
    pub fn with_table_names(mut self, cluster_table: impl Into<String>, worker_table: impl Into<String>) -> Self {
        self.cluster_table = cluster_table.into();
        self.worker_table = worker_table.into();
        self
    }

    pub fn from_config(config: &FanoutConfig) -> Self {
        Self::new(&config.checkpoint_store.path).with_table_names(
            &config.cluster_config_collection_name,
            &config.worker_config_collection_name,
        )
    }

    async fn read_file(&self) -> Result<Tables> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "No config store file yet");
                return Ok(Tables::default());
            }
            Err(e) => {
                return Err(FanoutError::store_with_source(
                    format!("Failed to read config store {}", self.path.display()),
                    e,
                ))
            }
        };

        let mut root: Map<String, Value> = serde_json::from_str(&content)?;
        let clusters = match root.remove(&self.cluster_table) {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        let checkpoints = match root.remove(&self.worker_table) {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        Ok(Tables { clusters, checkpoints })
    }

    async fn write_file(&self, tables: &Tables) -> Result<()> {
        let mut root = Map::new();
        root.insert(self.cluster_table.clone(), serde_json::to_value(&tables.clusters)?);
        root.insert(self.worker_table.clone(), serde_json::to_value(&tables.checkpoints)?);
        let content = serde_json::to_string_pretty(&Value::Object(root))?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, content)
            .await
            .map_err(|e| FanoutError::store_with_source("Failed to write config store", e))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| FanoutError::store_with_source("Failed to rename config store", e))?;

        debug!(path = ?self.path, "Saved config store");
        Ok(())
    }

    /// Take the advisory lock guarding the store file; released when the
    /// returned handle is dropped
    async fn lock_file(&self, exclusive: bool) -> Result<std::fs::File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FanoutError::store_with_source("Failed to create config store directory", e))?;
        }

        let lock_path = self.path.with_extension("lock");
        let locked = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            if exclusive {
                FileExt::lock_exclusive(&file)?;
            } else {
                FileExt::lock_shared(&file)?;
            }
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|e| FanoutError::Internal(format!("Config store lock task failed: {}", e)))?;

        locked.map_err(|e| FanoutError::store_with_source("Failed to lock config store", e))
    }

    /// Read the current tables under a shared lock
    async fn read_locked(&self) -> Result<Tables> {
        let _file_lock = self.lock_file(false).await?;
        self.read_file().await
    }

    /// Reread, mutate and persist under the exclusive lock; `f` reports
    /// whether anything changed
    async fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<(T, bool)>) -> Result<T> {
        let _local = self.write_lock.lock().await;
        let _file_lock = self.lock_file(true).await?;

        let mut tables = self.read_file().await?;
        let (value, changed) = f(&mut tables)?;
        if changed {
            self.write_file(&tables).await?;
        }
        Ok(value)
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn find_cluster_config(&self, collection: &str) -> Result<Option<ClusterConfig>> {
        let tables = self.read_locked().await?;
        Ok(tables.find_cluster(collection).cloned())
    }

    async fn get_or_init_cluster_config(&self, collection: &str, partitions: u32) -> Result<ClusterConfig> {
        self.mutate(|tables| Ok(tables.get_or_init_cluster(collection, partitions)))
            .await
    }

    async fn get_or_init_checkpoint(&self, collection: &str, partition: u32) -> Result<WorkerCheckpoint> {
        self.mutate(|tables| Ok(tables.get_or_init_checkpoint(collection, partition)))
            .await
    }

    async fn update_resume_token(&self, checkpoint_id: Uuid, token: &ResumeToken) -> Result<()> {
        self.mutate(|tables| tables.update_resume_token(checkpoint_id, token).map(|_| ((), true)))
            .await
    }

    fn name(&self) -> &'static str {
        "file_config_store"
    }
}

/// Build the store selected by `checkpoint_store.storage_type`
pub fn store_from_config(config: &FanoutConfig) -> Result<Arc<dyn ConfigStore>> {
    match config.checkpoint_store.storage_type.as_str() {
        "memory" => Ok(Arc::new(MemoryConfigStore::new())),
        "file" => Ok(Arc::new(FileConfigStore::from_config(config))),
        other => Err(FanoutError::config(format!("Unknown checkpoint storage type: {}", other))),
    }
}
