//! Best-effort pub/sub between sessions. The event log in Postgres is
//! always the source of truth — a notifier is a wake-up, never a payload
//! carrier. Every notification a session receives triggers a re-query of
//! the log rather than trusting the notify body; dropped or duplicated
//! notifications are harmless as a result.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// The body of a notification. Carried for logging/metrics only —
/// receivers re-query the log rather than acting on these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendNotice {
    pub user_id: String,
    pub save_id: String,
    pub seq: i64,
}

pub fn channel_name(user_id: &str, save_id: &str) -> String {
    format!("ws:v1:{}:{}", user_id, save_id)
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publishes a wake-up after a successful append. Must only be called
    /// after the appending transaction has committed.
    async fn publish(&self, user_id: &str, save_id: &str, seq: i64);

    /// Subscribes to wake-ups for a single stream. Returns a receiver
    /// that yields one `AppendNotice` per publish observed while
    /// subscribed; lagged/dropped notices are not an error since the
    /// subscriber always re-drains the log regardless of content.
    async fn subscribe(&self, user_id: &str, save_id: &str) -> broadcast::Receiver<AppendNotice>;
}

/// In-process fallback binding: a broadcast channel per stream, scoped to
/// this server instance. Used in tests and single-instance deployments
/// with no Redis configured.
pub struct InMemoryNotifier {
    channels: DashMap<String, broadcast::Sender<AppendNotice>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn sender_for(&self, key: &str) -> broadcast::Sender<AppendNotice> {
        self.channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for InMemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn publish(&self, user_id: &str, save_id: &str, seq: i64) {
        let key = channel_name(user_id, save_id);
        let tx = self.sender_for(&key);
        let _ = tx.send(AppendNotice {
            user_id: user_id.to_string(),
            save_id: save_id.to_string(),
            seq,
        });
    }

    async fn subscribe(&self, user_id: &str, save_id: &str) -> broadcast::Receiver<AppendNotice> {
        let key = channel_name(user_id, save_id);
        self.sender_for(&key).subscribe()
    }
}

/// Production binding: Redis pub/sub, one channel per stream. Publishing
/// reuses a single multiplexed connection manager; subscribing opens a
/// dedicated connection for the lifetime of the session (Redis pub/sub
/// connections cannot be shared with ordinary commands).
pub struct RedisNotifier {
    client: redis::Client,
    publish_conn: redis::aio::ConnectionManager,
}

impl RedisNotifier {
    pub async fn connect(redis_url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let publish_conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            publish_conn,
        })
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn publish(&self, user_id: &str, save_id: &str, seq: i64) {
        let channel = channel_name(user_id, save_id);
        let payload = match serde_json::to_string(&AppendNotice {
            user_id: user_id.to_string(),
            save_id: save_id.to_string(),
            seq,
        }) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode append notify");
                return;
            }
        };

        let mut conn = self.publish_conn.clone();
        if let Err(e) = redis::AsyncCommands::publish::<_, _, i64>(&mut conn, &channel, payload).await {
            warn!(error = %e, channel = %channel, "failed to publish append notify");
        }
    }

    async fn subscribe(&self, user_id: &str, save_id: &str) -> broadcast::Receiver<AppendNotice> {
        let channel = channel_name(user_id, save_id);
        let (tx, rx) = broadcast::channel(256);

        let client = self.client.clone();
        tokio::spawn(async move {
            let conn = match client.get_async_connection().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "failed to open redis subscribe connection");
                    return;
                }
            };
            let mut pubsub = conn.into_pubsub();
            if let Err(e) = pubsub.subscribe(&channel).await {
                warn!(error = %e, channel = %channel, "failed to subscribe");
                return;
            }

            let mut stream = pubsub.on_message();
            use futures_util::StreamExt;
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                match serde_json::from_str::<AppendNotice>(&payload) {
                    Ok(notice) => {
                        if tx.send(notice).is_err() {
                            // No subscribers left; the session has gone
                            // away, let this task exit on the next drop.
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring malformed append notify"),
                }
            }
        });

        rx
    }
}
