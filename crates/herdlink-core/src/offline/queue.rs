//! Durable queue of writes attempted while offline.
//!
//! Each item lives under its own store key (`offline:` + zero-padded
//! sequence id), so removing one replayed item never rewrites the others
//! and key order is replay order.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::http::Method;
use crate::storage::KeyValueStore;

/// Store key namespace for queue items.
const QUEUE_PREFIX: &str = "offline:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueItem {
    /// Replay position; increases monotonically across restarts.
    pub id: u64,
    pub method: Method,
    /// Resolved at enqueue time, including any query string.
    pub url: String,
    pub payload: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub remaining: usize,
    /// The item that stopped the pass, and why.
    pub halted: Option<(u64, GatewayError)>,
}

impl ReplayReport {
    pub fn is_complete(&self) -> bool {
        self.halted.is_none() && self.remaining == 0
    }
}

pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    next_id: AtomicU64,
    replay_lock: Mutex<()>,
}

fn item_key(id: u64) -> String {
    format!("{}{:020}", QUEUE_PREFIX, id)
}

impl OfflineQueue {
    /// Open the queue over a store, continuing the id sequence of any items
    /// left from a previous run.
    pub async fn open(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let last = store
            .keys(QUEUE_PREFIX)
            .await?
            .iter()
            .filter_map(|key| key[QUEUE_PREFIX.len()..].parse::<u64>().ok())
            .max();
        let pending = last.is_some();
        let next_id = last.map_or(1, |id| id + 1);
        if pending {
            info!(next_id, "Offline queue has pending writes");
        }
        Ok(Self {
            store,
            next_id: AtomicU64::new(next_id),
            replay_lock: Mutex::new(()),
        })
    }

    /// Persist a write for later replay.
    pub async fn enqueue(
        &self,
        method: Method,
        url: impl Into<String>,
        payload: Option<Value>,
        headers: BTreeMap<String, String>,
    ) -> Result<OfflineQueueItem> {
        let item = OfflineQueueItem {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            method,
            url: url.into(),
            payload,
            headers,
            enqueued_at: Utc::now(),
        };
        self.store
            .set(&item_key(item.id), serde_json::to_value(&item)?)
            .await?;
        debug!(id = item.id, method = %item.method, url = %item.url, "Queued offline write");
        Ok(item)
    }

    /// Every stored item in replay order, keyed by its id. Items that no
    /// longer deserialize come back as errors so replay can stop on them.
    async fn entries(&self) -> Result<Vec<(u64, Result<OfflineQueueItem>)>> {
        let mut entries = Vec::new();
        for key in self.store.keys(QUEUE_PREFIX).await? {
            let Ok(id) = key[QUEUE_PREFIX.len()..].parse::<u64>() else {
                warn!(key = %key, "Ignoring foreign key in offline queue namespace");
                continue;
            };
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            let item = serde_json::from_value::<OfflineQueueItem>(value).map_err(|e| {
                GatewayError::Storage(format!("Unreadable queued write #{}: {}", id, e))
            });
            entries.push((id, item));
        }
        Ok(entries)
    }

    /// Every readable pending item in replay order.
    pub async fn items(&self) -> Result<Vec<OfflineQueueItem>> {
        let mut items = Vec::new();
        for (id, item) in self.entries().await? {
            match item {
                Ok(item) => items.push(item),
                Err(e) => warn!(id, error = %e, "Unreadable queue item, replay will halt on it"),
            }
        }
        Ok(items)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.keys(QUEUE_PREFIX).await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop one item without replaying it. Returns false if it was not queued.
    pub async fn discard(&self, id: u64) -> Result<bool> {
        let key = item_key(id);
        if self.store.get(&key).await?.is_none() {
            return Ok(false);
        }
        self.store.remove(&key).await?;
        info!(id, "Discarded offline write");
        Ok(true)
    }

    /// Send every item in order through `send`, removing each one as soon as
    /// it succeeds. Stops at the first failure; the failed item and all
    /// later ones stay queued for the next pass.
    ///
    /// Passes are serialized: a second caller waits for the running pass and
    /// then works through whatever is left.
    pub async fn replay<F, Fut>(&self, send: F) -> Result<ReplayReport>
    where
        F: Fn(OfflineQueueItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _pass = self.replay_lock.lock().await;

        let entries = self.entries().await?;
        let total = entries.len();
        let mut report = ReplayReport::default();

        for (id, item) in entries {
            // An unreadable item halts the pass like a failed send; `discard`
            // clears it.
            let outcome = match item {
                Ok(item) => send(item).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!(id, error = %e, "Offline replay halted");
                report.halted = Some((id, e));
                break;
            }
            self.store.remove(&item_key(id)).await?;
            report.replayed += 1;
        }

        report.remaining = total - report.replayed;
        if report.replayed > 0 {
            info!(replayed = report.replayed, remaining = report.remaining, "Offline replay finished");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStore, MemoryStore};
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use tempfile::tempdir;

    async fn queue() -> OfflineQueue {
        OfflineQueue::open(Arc::new(MemoryStore::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_preserves_order() {
        let queue = queue().await;
        queue
            .enqueue(Method::Patch, "https://farm.example/api/r/1", Some(json!({"a": 1})), BTreeMap::new())
            .await
            .unwrap();
        queue
            .enqueue(Method::Delete, "https://farm.example/api/r/1", None, BTreeMap::new())
            .await
            .unwrap();

        let methods: Vec<Method> = queue.items().await.unwrap().iter().map(|i| i.method).collect();
        assert_eq!(methods, vec![Method::Patch, Method::Delete]);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_replay_halts_on_first_failure() {
        let queue = queue().await;
        queue.enqueue(Method::Patch, "u/1", None, BTreeMap::new()).await.unwrap();
        queue.enqueue(Method::Delete, "u/1", None, BTreeMap::new()).await.unwrap();

        let attempted = SyncMutex::new(Vec::new());
        let report = queue
            .replay(|item| {
                attempted.lock().push(item.method);
                async move {
                    Err(GatewayError::Server {
                        status: 500,
                        message: "down".to_string(),
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(*attempted.lock(), vec![Method::Patch]);
        assert_eq!(report.replayed, 0);
        assert_eq!(report.remaining, 2);
        assert!(matches!(report.halted, Some((1, GatewayError::Server { .. }))));
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_successful_items_removed_individually() {
        let queue = queue().await;
        for n in 0..3 {
            queue
                .enqueue(Method::Post, format!("u/{}", n), None, BTreeMap::new())
                .await
                .unwrap();
        }

        let report = queue
            .replay(|item| async move {
                if item.url == "u/2" {
                    Err(GatewayError::Connectivity("gone".to_string()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.replayed, 2);
        let left = queue.items().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].url, "u/2");
    }

    #[tokio::test]
    async fn test_unreadable_item_halts_replay_until_discarded() {
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::open(store.clone()).await.unwrap();
        queue.enqueue(Method::Post, "u/1", None, BTreeMap::new()).await.unwrap();
        let corrupt = queue.enqueue(Method::Patch, "u/2", None, BTreeMap::new()).await.unwrap();
        queue.enqueue(Method::Delete, "u/2", None, BTreeMap::new()).await.unwrap();
        store.set(&item_key(corrupt.id), json!({"garbage": true})).await.unwrap();

        let sent = SyncMutex::new(Vec::new());
        let report = queue
            .replay(|item| {
                sent.lock().push(item.url.clone());
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(*sent.lock(), vec!["u/1"]);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 2);
        assert!(matches!(report.halted, Some((2, GatewayError::Storage(_)))));
        assert_eq!(queue.len().await.unwrap(), 2);

        assert!(queue.discard(corrupt.id).await.unwrap());
        let report = queue.replay(|_| async { Ok(()) }).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.replayed, 1);
    }

    #[tokio::test]
    async fn test_discard() {
        let queue = queue().await;
        let item = queue.enqueue(Method::Post, "u", None, BTreeMap::new()).await.unwrap();

        assert!(queue.discard(item.id).await.unwrap());
        assert!(!queue.discard(item.id).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_reopened_queue_continues_sequence() {
        let dir = tempdir().unwrap();
        {
            let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
            let queue = OfflineQueue::open(store).await.unwrap();
            queue.enqueue(Method::Post, "a", None, BTreeMap::new()).await.unwrap();
            queue.enqueue(Method::Post, "b", None, BTreeMap::new()).await.unwrap();
        }

        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let queue = OfflineQueue::open(store).await.unwrap();
        let item = queue.enqueue(Method::Post, "c", None, BTreeMap::new()).await.unwrap();
        assert_eq!(item.id, 3);

        let urls: Vec<String> = queue.items().await.unwrap().into_iter().map(|i| i.url).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
    }
}
