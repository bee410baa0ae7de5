use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use crate::error::Result;
use crate::models::room::RoomId;

/// Full value of one store path: a flat map of field name to string value.
pub type Snapshot = BTreeMap<String, String>;

/// Number of undelivered snapshots a subscription buffers.
pub const SUBSCRIPTION_BUFFER: usize = 32;

/// Location of a record in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath(String);

impl StorePath {
    /// The room record: key envelope, timer and ended flag.
    pub fn room(room_id: &RoomId) -> Self {
        Self(format!("rooms/{}", room_id))
    }

    /// The room's message collection.
    pub fn messages(room_id: &RoomId) -> Self {
        Self(format!("rooms/{}/messages", room_id))
    }

    /// Returns the path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live feed of snapshots for one path.
///
/// The first snapshot is the value at subscription time; every later one is
/// the full value after a change. Dropping the subscription stops the feed.
pub struct Subscription {
    path: StorePath,
    rx: mpsc::Receiver<Snapshot>,
    task: AbortHandle,
}

impl Subscription {
    /// Wraps the receiving end of a feed and the task that fills it.
    pub fn new(path: StorePath, rx: mpsc::Receiver<Snapshot>, task: AbortHandle) -> Self {
        Self { path, rx, task }
    }

    /// Waits for the next snapshot. `None` once the feed has stopped.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// The subscribed path.
    pub fn path(&self) -> &StorePath {
        &self.path
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        tracing::debug!("Unsubscribed from {}", self.path);
    }
}

/// The externally provided real-time key-value store.
///
/// The store is trusted for availability only; everything confidential is
/// encrypted before it gets here. No operation is atomic across calls.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Starts a push feed of full snapshots for `path`.
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription>;

    /// Reads the current value of `path` once. Missing paths read as empty.
    async fn read_once(&self, path: &StorePath) -> Result<Snapshot>;

    /// Merges `fields` into `path`, overwriting existing values.
    async fn write(&self, path: &StorePath, fields: Vec<(String, String)>) -> Result<()>;

    /// Sets `field` only if it is absent or holds an empty string. Returns
    /// whether the write happened.
    async fn write_if_absent(&self, path: &StorePath, field: &str, value: String) -> Result<bool>;

    /// Inserts `value` under a freshly generated unique id and returns the id.
    async fn append_child(&self, path: &StorePath, value: String) -> Result<String>;
}
