use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use crate::error::Result;
use crate::store::{Snapshot, StorePath, SharedStore, Subscription, SUBSCRIPTION_BUFFER};

/// `HSETNX` that also fills a field holding an empty string.
const SET_IF_EMPTY: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current == false or current == '' then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
    return 1
end
return 0
"#;

/// Shared store on Redis.
///
/// Each path is a Redis hash named `{prefix}{path}`. Every mutation publishes
/// the path on `{prefix}changes:{path}`; subscribers re-read the whole hash
/// when notified, so each delivery is a full snapshot.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - The URL of the Redis server.
    /// * `prefix` - Namespace prepended to every key and channel.
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        tracing::info!("✅ Redis Connection Manager initialized for shared store");

        Ok(Self {
            client,
            conn,
            prefix: prefix.into(),
        })
    }

    fn key(&self, path: &StorePath) -> String {
        format!("{}{}", self.prefix, path)
    }

    fn channel(&self, path: &StorePath) -> String {
        format!("{}changes:{}", self.prefix, path)
    }

    async fn notify(&self, path: &StorePath) -> Result<()> {
        let _: () = redis::cmd("PUBLISH")
            .arg(self.channel(path))
            .arg(path.as_str())
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel(path)).await?;

        // Subscribed before the first read, so no change can slip between them.
        let initial = self.read_once(path).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let store = self.clone();
        let watched = path.clone();

        let task = tokio::spawn(async move {
            if tx.send(initial).await.is_err() {
                return;
            }
            let mut notifications = pubsub.into_on_message();
            while notifications.next().await.is_some() {
                match store.read_once(&watched).await {
                    Ok(snapshot) => {
                        if tx.send(snapshot).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("❌ Failed to refresh {}: {}", watched, e);
                    }
                }
            }
            tracing::debug!("Redis feed for {} closed", watched);
        });

        tracing::debug!("Subscribed to {} via {}", path, self.channel(path));
        Ok(Subscription::new(path.clone(), rx, task.abort_handle()))
    }

    async fn read_once(&self, path: &StorePath) -> Result<Snapshot> {
        let snapshot: Snapshot = redis::cmd("HGETALL")
            .arg(self.key(path))
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(snapshot)
    }

    async fn write(&self, path: &StorePath, fields: Vec<(String, String)>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.key(path));
        for (field, value) in &fields {
            cmd.arg(field).arg(value);
        }
        let _: () = cmd.query_async(&mut self.conn.clone()).await?;

        self.notify(path).await
    }

    async fn write_if_absent(&self, path: &StorePath, field: &str, value: String) -> Result<bool> {
        let written: bool = redis::Script::new(SET_IF_EMPTY)
            .key(self.key(path))
            .arg(field)
            .arg(value)
            .invoke_async(&mut self.conn.clone())
            .await?;

        if written {
            self.notify(path).await?;
        }
        Ok(written)
    }

    async fn append_child(&self, path: &StorePath, value: String) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let _: () = redis::cmd("HSET")
            .arg(self.key(path))
            .arg(&id)
            .arg(value)
            .query_async(&mut self.conn.clone())
            .await?;

        self.notify(path).await?;
        Ok(id)
    }
}
