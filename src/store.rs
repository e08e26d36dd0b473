//! Persistent key-value map backed by a JSON file
//!
//! Mutations land in an in-memory snapshot immediately and enqueue a
//! debounced save (100 ms coalescing window). Saves write to `<path>.tmp`
//! and atomically rename over the target, so a reader never observes
//! partial JSON. `close` flushes pending writes before returning. There is
//! at most one write task per file at any time.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{RouterError, RouterResult};

/// Save coalescing window
const DEBOUNCE: Duration = Duration::from_millis(100);

struct Shared {
    path: PathBuf,
    state: RwLock<HashMap<String, Value>>,
    dirty: Notify,
    closed: AtomicBool,
}

/// A `key → json-value` mapping persisted to a single JSON file
pub struct PersistentMap {
    shared: Arc<Shared>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PersistentMap {
    /// Open the map: read the backing file if present, initialize empty
    /// (and persist) if absent, and reset to empty if the JSON is
    /// malformed. Parse errors are logged, never propagated.
    pub async fn open(path: impl Into<PathBuf>) -> RouterResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RouterError::Internal(format!("create data dir: {}", e)))?;
        }

        let initial = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, Value>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(
                        "Malformed JSON in {}, resetting to empty: {}",
                        path.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(RouterError::Internal(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let shared = Arc::new(Shared {
            path,
            state: RwLock::new(initial),
            dirty: Notify::new(),
            closed: AtomicBool::new(false),
        });

        // Persist the initial state so the file always exists after open
        write_atomic(&shared.path, &*shared.state.read().await).await?;

        let writer = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    shared.dirty.notified().await;
                    if shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(DEBOUNCE).await;
                    let snapshot = shared.state.read().await.clone();
                    if let Err(e) = write_atomic(&shared.path, &snapshot).await {
                        warn!("Persist failed for {}: {}", shared.path.display(), e);
                    } else {
                        debug!(
                            "Persisted {} ({} entries)",
                            shared.path.display(),
                            snapshot.len()
                        );
                    }
                }
            })
        };

        Ok(Self {
            shared,
            writer: std::sync::Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.shared.state.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.shared.state.write().await.insert(key.into(), value);
        self.shared.dirty.notify_one();
    }

    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.shared.state.write().await.remove(key).is_some();
        if removed {
            self.shared.dirty.notify_one();
        }
        removed
    }

    pub async fn clear(&self) {
        self.shared.state.write().await.clear();
        self.shared.dirty.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.shared.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.state.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.shared.state.read().await.keys().cloned().collect()
    }

    /// Point-in-time consistent snapshot of all entries
    pub async fn entries(&self) -> HashMap<String, Value> {
        self.shared.state.read().await.clone()
    }

    /// Write the current state immediately, bypassing the debounce window
    pub async fn flush(&self) -> RouterResult<()> {
        let snapshot = self.shared.state.read().await.clone();
        write_atomic(&self.shared.path, &snapshot).await
    }

    /// Flush pending writes and stop the background save task
    pub async fn close(&self) -> RouterResult<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.dirty.notify_one();
        let handle = self.writer.lock().expect("writer mutex").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.flush().await
    }
}

/// Temp-file plus rename on the same volume; readers never see a torn file
async fn write_atomic(path: &Path, map: &HashMap<String, Value>) -> RouterResult<()> {
    let bytes = serde_json::to_vec_pretty(map)
        .map_err(|e| RouterError::Internal(format!("serialize {}: {}", path.display(), e)))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| RouterError::Internal(format!("write {}: {}", tmp.display(), e)))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| RouterError::Internal(format!("rename over {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_initializes_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let map = PersistentMap::open(&path).await.unwrap();
        assert!(map.is_empty().await);
        assert!(path.exists());
        map.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_file_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        tokio::fs::write(&path, b"{not valid json").await.unwrap();

        let map = PersistentMap::open(&path).await.unwrap();
        assert!(map.is_empty().await);
        map.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let map = PersistentMap::open(dir.path().join("byok.json"))
            .await
            .unwrap();

        map.set("alice", json!({"provider": "openai"})).await;
        assert_eq!(map.get("alice").await.unwrap()["provider"], "openai");
        assert!(map.delete("alice").await);
        assert!(map.get("alice").await.is_none());
        assert!(!map.delete("alice").await);
        map.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_pending_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        {
            let map = PersistentMap::open(&path).await.unwrap();
            map.set("k1", json!(1)).await;
            map.set("k2", json!(2)).await;
            map.close().await.unwrap();
        }
        let bytes = tokio::fs::read(&path).await.unwrap();
        let on_disk: HashMap<String, Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk["k2"], json!(2));
    }

    #[tokio::test]
    async fn test_reopen_reads_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        {
            let map = PersistentMap::open(&path).await.unwrap();
            map.set("key", json!({"tier": "pro"})).await;
            map.close().await.unwrap();
        }
        let map = PersistentMap::open(&path).await.unwrap();
        assert_eq!(map.get("key").await.unwrap()["tier"], "pro");
        map.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_debounced_save_coalesces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let map = PersistentMap::open(&path).await.unwrap();

        for i in 0..50 {
            map.set(format!("k{}", i), json!(i)).await;
        }
        // Within the coalescing window nothing extra has hit the disk yet;
        // after it, a single save covers every mutation.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let bytes = tokio::fs::read(&path).await.unwrap();
        let on_disk: HashMap<String, Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(on_disk.len(), 50);
        map.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_on_disk_file_always_parseable_during_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let map = Arc::new(PersistentMap::open(&path).await.unwrap());

        let writer = {
            let map = Arc::clone(&map);
            tokio::spawn(async move {
                for i in 0..100 {
                    map.set(format!("k{}", i), json!({"n": i})).await;
                    if i % 10 == 0 {
                        map.flush().await.unwrap();
                    }
                }
            })
        };

        for _ in 0..50 {
            if let Ok(bytes) = tokio::fs::read(&path).await {
                // Any observable file content parses completely
                serde_json::from_slice::<HashMap<String, Value>>(&bytes).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        writer.await.unwrap();
        map.close().await.unwrap();
    }
}
