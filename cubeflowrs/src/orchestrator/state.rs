//! Build state persistence.
//!
//! The orchestrator records per-partition freshness and build locks through a
//! [`StateStore`]. [`MemoryStateStore`] serves tests and single-process use;
//! [`FileStateStore`] survives restarts by rewriting a JSON snapshot with an
//! atomic rename after every change.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::LockError;
use crate::pre_aggregations::PartitionKey;

pub type StoreResult<T> = std::result::Result<T, LockError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Fresh,
    Stale,
    Queued,
    Building,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionState {
    pub state: BuildState,
    /// Physical table currently serving this partition.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub refresh_key: Option<String>,
    #[serde(default)]
    pub built_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PartitionState {
    pub fn new(state: BuildState) -> Self {
        Self {
            state,
            table: None,
            refresh_key: None,
            built_at: None,
            last_error: None,
        }
    }

    /// Same record with a different state, keeping the serving table.
    pub fn with_state(&self, state: BuildState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLock {
    /// Content hash identifying the build.
    pub key: String,
    pub partition: PartitionKey,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, partition: &PartitionKey) -> StoreResult<Option<PartitionState>>;

    async fn put(&self, partition: &PartitionKey, state: PartitionState) -> StoreResult<()>;

    async fn all(&self) -> StoreResult<Vec<(PartitionKey, PartitionState)>>;

    /// Take the lock, failing with [`LockError::Held`] when another owner has
    /// it.
    async fn acquire_lock(&self, lock: BuildLock) -> StoreResult<()>;

    /// Release a lock taken by `owner`. Releasing an unknown lock is a no-op.
    async fn release_lock(&self, key: &str, owner: &str) -> StoreResult<()>;

    /// Drop every lock; returns how many were held.
    async fn clear_locks(&self) -> StoreResult<usize>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    partitions: BTreeMap<String, PartitionEntry>,
    #[serde(default)]
    locks: HashMap<String, BuildLock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PartitionEntry {
    key: PartitionKey,
    state: PartitionState,
}

impl Snapshot {
    fn get(&self, partition: &PartitionKey) -> Option<PartitionState> {
        self.partitions
            .get(&partition.to_string())
            .map(|e| e.state.clone())
    }

    fn put(&mut self, partition: &PartitionKey, state: PartitionState) {
        self.partitions.insert(
            partition.to_string(),
            PartitionEntry {
                key: partition.clone(),
                state,
            },
        );
    }

    fn all(&self) -> Vec<(PartitionKey, PartitionState)> {
        self.partitions
            .values()
            .map(|e| (e.key.clone(), e.state.clone()))
            .collect()
    }

    fn acquire(&mut self, lock: BuildLock) -> StoreResult<()> {
        if let Some(held) = self.locks.get(&lock.key) {
            return Err(LockError::Held {
                partition: held.partition.to_string(),
                holder: held.owner.clone(),
            });
        }
        self.locks.insert(lock.key.clone(), lock);
        Ok(())
    }

    fn release(&mut self, key: &str, owner: &str) {
        if self.locks.get(key).is_some_and(|l| l.owner == owner) {
            self.locks.remove(key);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: RwLock<Snapshot>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, partition: &PartitionKey) -> StoreResult<Option<PartitionState>> {
        Ok(self.inner.read().await.get(partition))
    }

    async fn put(&self, partition: &PartitionKey, state: PartitionState) -> StoreResult<()> {
        self.inner.write().await.put(partition, state);
        Ok(())
    }

    async fn all(&self) -> StoreResult<Vec<(PartitionKey, PartitionState)>> {
        Ok(self.inner.read().await.all())
    }

    async fn acquire_lock(&self, lock: BuildLock) -> StoreResult<()> {
        self.inner.write().await.acquire(lock)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> StoreResult<()> {
        self.inner.write().await.release(key, owner);
        Ok(())
    }

    async fn clear_locks(&self) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let count = inner.locks.len();
        inner.locks.clear();
        Ok(count)
    }
}

/// JSON-file backed store.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    inner: RwLock<Snapshot>,
}

impl FileStateStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| LockError::Store(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(LockError::Store(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            inner: RwLock::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|e| LockError::Store(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        let io = |e: std::io::Error| LockError::Store(format!("{}: {e}", self.path.display()));
        tokio::fs::write(&tmp, bytes).await.map_err(io)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, partition: &PartitionKey) -> StoreResult<Option<PartitionState>> {
        Ok(self.inner.read().await.get(partition))
    }

    async fn put(&self, partition: &PartitionKey, state: PartitionState) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.put(partition, state);
        self.persist(&inner).await
    }

    async fn all(&self) -> StoreResult<Vec<(PartitionKey, PartitionState)>> {
        Ok(self.inner.read().await.all())
    }

    async fn acquire_lock(&self, lock: BuildLock) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.acquire(lock)?;
        self.persist(&inner).await
    }

    async fn release_lock(&self, key: &str, owner: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.release(key, owner);
        self.persist(&inner).await
    }

    async fn clear_locks(&self) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let count = inner.locks.len();
        inner.locks.clear();
        self.persist(&inner).await?;
        Ok(count)
    }
}
