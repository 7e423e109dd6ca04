//! Checkpoint persistence keyed by thread id.
//!
//! A checkpoint is an opaque byte snapshot of agent state. Each thread owns
//! one chain of checkpoints with strictly increasing sequence numbers; a
//! resumed turn always reads the greatest sequence. `put` is optimistic:
//! callers pass the parent sequence they built on, and a raced write is
//! rejected with `stale-parent` so the caller can re-read and retry.

use crate::errors::{ServerError, ServerResult};
use crate::utils::{ensure_dir, safe_filename};
use async_trait::async_trait;
use fs2::FileExt;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub sequence: u64,
    pub parent_sequence: Option<u64>,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint. `parent_sequence` must equal the current greatest
    /// sequence on the thread (`None` for an empty thread); otherwise the
    /// write is rejected with `stale-parent`. Returns the new sequence,
    /// strictly greater than any existing one.
    async fn put(
        &self,
        thread_id: &str,
        parent_sequence: Option<u64>,
        payload: &[u8],
    ) -> ServerResult<u64>;

    /// Greatest-sequence checkpoint, if any.
    async fn latest(&self, thread_id: &str) -> ServerResult<Option<Checkpoint>>;

    /// Full chain in sequence order, for recovery and introspection.
    async fn list(&self, thread_id: &str) -> ServerResult<Vec<Checkpoint>>;

    /// Drop all checkpoints for a thread.
    async fn reset(&self, thread_id: &str) -> ServerResult<()>;
}

/// Build a store from a `CHECKPOINT_STORE_URL` value.
pub fn store_from_url(url: &str) -> ServerResult<Arc<dyn CheckpointStore>> {
    if url == "memory://" {
        return Ok(Arc::new(MemoryCheckpointStore::new()));
    }
    let dir = url.strip_prefix("file://").unwrap_or(url);
    Ok(Arc::new(FileCheckpointStore::new(PathBuf::from(dir))?))
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// One file per thread under the store directory. Records are framed as
/// `sequence: u64 LE | parent: i64 LE (-1 = none) | len: u32 LE | payload`,
/// appended under an exclusive file lock taken off the async runtime.
/// Writers on the same thread are additionally serialized in-process by a
/// per-thread async mutex so sequences never collide.
pub struct FileCheckpointStore {
    dir: PathBuf,
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

const RECORD_HEADER_LEN: usize = 8 + 8 + 4;

impl FileCheckpointStore {
    pub fn new(dir: PathBuf) -> ServerResult<Self> {
        let dir = ensure_dir(&dir)
            .map_err(|e| ServerError::StorageUnavailable(e.to_string()))?;
        Ok(Self {
            dir,
            thread_locks: Mutex::new(HashMap::new()),
        })
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        self.dir.join(format!("{}.ckpt", safe_filename(thread_id)))
    }

    async fn lock_for(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.thread_locks.lock().await;
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn encode_record(sequence: u64, parent: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        buf.extend_from_slice(&sequence.to_le_bytes());
        let parent_raw: i64 = parent.map_or(-1, |p| p as i64);
        buf.extend_from_slice(&parent_raw.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Decode all complete records. A truncated tail (torn write from a
    /// crashed process) is skipped with a warning rather than failing the
    /// whole chain.
    fn decode_records(data: &[u8], origin: &str) -> Vec<Checkpoint> {
        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos + RECORD_HEADER_LEN <= data.len() {
            let sequence = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
            let parent_raw = i64::from_le_bytes(data[pos + 8..pos + 16].try_into().unwrap());
            let len = u32::from_le_bytes(data[pos + 16..pos + 20].try_into().unwrap()) as usize;
            let start = pos + RECORD_HEADER_LEN;
            if start + len > data.len() {
                warn!("checkpoint file {} has a truncated tail record, ignoring", origin);
                break;
            }
            records.push(Checkpoint {
                sequence,
                parent_sequence: (parent_raw >= 0).then_some(parent_raw as u64),
                payload: data[start..start + len].to_vec(),
            });
            pos = start + len;
        }
        if pos != data.len() && pos + RECORD_HEADER_LEN > data.len() && pos < data.len() {
            warn!("checkpoint file {} has trailing garbage, ignoring", origin);
        }
        records
    }

    fn read_all_blocking(path: &PathBuf) -> ServerResult<Vec<Checkpoint>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut file = std::fs::File::open(path)
            .map_err(|e| ServerError::StorageUnavailable(e.to_string()))?;
        file.lock_shared()
            .map_err(|e| ServerError::StorageUnavailable(e.to_string()))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| ServerError::StorageUnavailable(e.to_string()))?;
        // lock released when `file` drops
        Ok(Self::decode_records(&data, &path.display().to_string()))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(
        &self,
        thread_id: &str,
        parent_sequence: Option<u64>,
        payload: &[u8],
    ) -> ServerResult<u64> {
        let lock = self.lock_for(thread_id).await;
        let _serialized = lock.lock().await;

        let path = self.thread_path(thread_id);
        let payload = payload.to_vec();
        let thread = thread_id.to_string();
        let sequence = tokio::task::spawn_blocking(move || -> ServerResult<u64> {
            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&path)
                .map_err(|e| ServerError::StorageUnavailable(e.to_string()))?;
            file.lock_exclusive()
                .map_err(|e| ServerError::StorageUnavailable(e.to_string()))?;

            let mut data = Vec::new();
            file.read_to_end(&mut data)
                .map_err(|e| ServerError::StorageUnavailable(e.to_string()))?;
            let current = Self::decode_records(&data, &path.display().to_string())
                .last()
                .map(|c| c.sequence);

            if current != parent_sequence {
                return Err(ServerError::StaleParent {
                    thread_id: thread,
                    expected: current,
                    got: parent_sequence,
                });
            }

            let sequence = current.map_or(1, |s| s + 1);
            let record = Self::encode_record(sequence, parent_sequence, &payload);
            file.write_all(&record)
                .map_err(|e| ServerError::StorageUnavailable(e.to_string()))?;
            file.sync_all()
                .map_err(|e| ServerError::StorageUnavailable(e.to_string()))?;
            Ok(sequence)
        })
        .await
        .map_err(|e| ServerError::StorageUnavailable(format!("checkpoint task failed: {}", e)))??;

        debug!("checkpoint put: {} seq={}", thread_id, sequence);
        Ok(sequence)
    }

    async fn latest(&self, thread_id: &str) -> ServerResult<Option<Checkpoint>> {
        let path = self.thread_path(thread_id);
        let records = tokio::task::spawn_blocking(move || Self::read_all_blocking(&path))
            .await
            .map_err(|e| ServerError::StorageUnavailable(format!("checkpoint task failed: {}", e)))??;
        Ok(records.into_iter().next_back())
    }

    async fn list(&self, thread_id: &str) -> ServerResult<Vec<Checkpoint>> {
        let path = self.thread_path(thread_id);
        tokio::task::spawn_blocking(move || Self::read_all_blocking(&path))
            .await
            .map_err(|e| ServerError::StorageUnavailable(format!("checkpoint task failed: {}", e)))?
    }

    async fn reset(&self, thread_id: &str) -> ServerResult<()> {
        let lock = self.lock_for(thread_id).await;
        let _serialized = lock.lock().await;
        let path = self.thread_path(thread_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::StorageUnavailable(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-process store for tests and development (`CHECKPOINT_STORE_URL=memory://`).
pub struct MemoryCheckpointStore {
    threads: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(
        &self,
        thread_id: &str,
        parent_sequence: Option<u64>,
        payload: &[u8],
    ) -> ServerResult<u64> {
        let mut threads = self.threads.lock().await;
        let chain = threads.entry(thread_id.to_string()).or_default();
        let current = chain.last().map(|c| c.sequence);
        if current != parent_sequence {
            return Err(ServerError::StaleParent {
                thread_id: thread_id.to_string(),
                expected: current,
                got: parent_sequence,
            });
        }
        let sequence = current.map_or(1, |s| s + 1);
        chain.push(Checkpoint {
            sequence,
            parent_sequence,
            payload: payload.to_vec(),
        });
        Ok(sequence)
    }

    async fn latest(&self, thread_id: &str) -> ServerResult<Option<Checkpoint>> {
        let threads = self.threads.lock().await;
        Ok(threads.get(thread_id).and_then(|c| c.last().cloned()))
    }

    async fn list(&self, thread_id: &str) -> ServerResult<Vec<Checkpoint>> {
        let threads = self.threads.lock().await;
        Ok(threads.get(thread_id).cloned().unwrap_or_default())
    }

    async fn reset(&self, thread_id: &str) -> ServerResult<()> {
        let mut threads = self.threads.lock().await;
        threads.remove(thread_id);
        Ok(())
    }
}
