use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, RwLock};
use crate::error::{AppError, Result};
use crate::store::{Snapshot, StorePath, SharedStore, Subscription, SUBSCRIPTION_BUFFER};

/// Capacity of the change fan-out channel.
const CHANGE_BUFFER: usize = 256;

struct Inner {
    data: RwLock<HashMap<StorePath, Snapshot>>,
    changes: broadcast::Sender<StorePath>,
    offline: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

/// A process-local store. Clones share the same data, so two sessions built
/// on clones of one `MemoryStore` see each other's writes like two peers on a
/// remote store would.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                data: RwLock::new(HashMap::new()),
                changes,
                offline: AtomicBool::new(false),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes every subsequent call fail with `RemoteUnavailable` until reset.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `read_once` calls served so far.
    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Number of mutating calls served so far.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Number of subscriptions whose feed is still running.
    pub fn subscriber_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(AppError::RemoteUnavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    async fn snapshot(&self, path: &StorePath) -> Snapshot {
        self.inner.data.read().await.get(path).cloned().unwrap_or_default()
    }

    fn notify(&self, path: &StorePath) {
        // No receivers just means nobody is subscribed.
        let _ = self.inner.changes.send(path.clone());
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription> {
        self.check_online()?;

        let mut changes = self.inner.changes.subscribe();
        let initial = self.snapshot(path).await;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let store = self.clone();
        let watched = path.clone();

        let task = tokio::spawn(async move {
            if tx.send(initial).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(changed) if changed == watched => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Subscription to {} lagged by {} changes", watched, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let snapshot = store.snapshot(&watched).await;
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }
        });

        tracing::debug!("Subscribed to {}", path);
        Ok(Subscription::new(path.clone(), rx, task.abort_handle()))
    }

    async fn read_once(&self, path: &StorePath) -> Result<Snapshot> {
        self.check_online()?;
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot(path).await)
    }

    async fn write(&self, path: &StorePath, fields: Vec<(String, String)>) -> Result<()> {
        self.check_online()?;
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        {
            let mut data = self.inner.data.write().await;
            data.entry(path.clone()).or_default().extend(fields);
        }
        self.notify(path);
        Ok(())
    }

    async fn write_if_absent(&self, path: &StorePath, field: &str, value: String) -> Result<bool> {
        self.check_online()?;
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        let written = {
            let mut data = self.inner.data.write().await;
            let record = data.entry(path.clone()).or_default();
            if record.get(field).is_some_and(|current| !current.is_empty()) {
                false
            } else {
                record.insert(field.to_string(), value);
                true
            }
        };
        if written {
            self.notify(path);
        }
        Ok(written)
    }

    async fn append_child(&self, path: &StorePath, value: String) -> Result<String> {
        self.check_online()?;
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        let id = uuid::Uuid::new_v4().simple().to_string();
        {
            let mut data = self.inner.data.write().await;
            data.entry(path.clone()).or_default().insert(id.clone(), value);
        }
        self.notify(path);
        Ok(id)
    }
}
