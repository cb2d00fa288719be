//! Messaging bus transport.
//!
//! A [`MessageBus`] carries opaque string payloads over named channels and
//! keeps small keyed record sets (used for presence). [`RedisBus`] is the
//! production transport; [`MemoryBus`] stands in for it inside one process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const MEMORY_CHANNEL_CAPACITY: usize = 1024;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bus unavailable")]
    Unavailable,
}

/// Pub/sub plus keyed records.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Payloads published on `channel` from now on. Ends when the underlying
    /// connection is lost.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError>;

    async fn put_record(&self, key: &str, field: &str, value: &str) -> Result<(), BusError>;

    async fn remove_record(&self, key: &str, field: &str) -> Result<(), BusError>;

    async fn records(&self, key: &str) -> Result<Vec<String>, BusError>;
}

/// Redis-backed bus.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!(redis = %redis_url, "Connected to Redis");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "Subscribed");

        let messages = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(error = %e, "Dropping non-text payload");
                    None
                }
            }
        });
        Ok(messages.boxed())
    }

    async fn put_record(&self, key: &str, field: &str, value: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn remove_record(&self, key: &str, field: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    async fn records(&self, key: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.hvals(key).await?;
        Ok(values)
    }
}

#[derive(Default)]
struct MemoryInner {
    channels: HashMap<String, broadcast::Sender<String>>,
    records: HashMap<String, HashMap<String, String>>,
    offline: bool,
}

/// In-process bus. Clones share state, so several runtimes in one process
/// can talk through it as if they were separate processes on one Redis.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate losing (or regaining) the connection. Going offline ends all
    /// open subscriptions.
    pub fn set_available(&self, available: bool) {
        let mut inner = self.lock();
        inner.offline = !available;
        if !available {
            inner.channels.clear();
        }
    }

    fn check(&self) -> Result<MutexGuard<'_, MemoryInner>, BusError> {
        let inner = self.lock();
        if inner.offline {
            return Err(BusError::Unavailable);
        }
        Ok(inner)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let inner = self.check()?;
        if let Some(tx) = inner.channels.get(channel) {
            // No receivers is fine; pub/sub has no delivery guarantee.
            let _ = tx.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError> {
        let mut inner = self.check()?;
        let rx = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
            .subscribe();

        let messages = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Subscriber lagging, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }

    async fn put_record(&self, key: &str, field: &str, value: &str) -> Result<(), BusError> {
        self.check()?
            .records
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_record(&self, key: &str, field: &str) -> Result<(), BusError> {
        if let Some(records) = self.check()?.records.get_mut(key) {
            records.remove(field);
        }
        Ok(())
    }

    async fn records(&self, key: &str) -> Result<Vec<String>, BusError> {
        Ok(self
            .check()?
            .records
            .get(key)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Bounded retry with exponential backoff for bus operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, BusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        let mut delay = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    debug!(operation, attempt, error = %e, "Bus operation failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Subscribe to `channel` and keep re-subscribing whenever the subscription
/// ends or cannot be established. The returned stream never ends on its own.
pub async fn resilient_subscribe(
    bus: Arc<dyn MessageBus>,
    channel: String,
    reconnect_delay: Duration,
) -> BoxStream<'static, String> {
    let current = match bus.subscribe(&channel).await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(channel = %channel, error = %e, "Subscribe failed, will retry");
            None
        }
    };

    stream::unfold(
        (bus, channel, current),
        move |(bus, channel, mut current)| async move {
            loop {
                let next = match current.as_mut() {
                    Some(inner) => Some(inner.next().await),
                    None => None,
                };
                match next {
                    Some(Some(payload)) => return Some((payload, (bus, channel, current))),
                    Some(None) => {
                        warn!(channel = %channel, "Subscription ended, reconnecting");
                        current = None;
                        tokio::time::sleep(reconnect_delay).await;
                    }
                    None => match bus.subscribe(&channel).await {
                        Ok(stream) => {
                            info!(channel = %channel, "Resubscribed");
                            current = Some(stream);
                        }
                        Err(e) => {
                            debug!(channel = %channel, error = %e, "Resubscribe failed");
                            tokio::time::sleep(reconnect_delay).await;
                        }
                    },
                }
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_memory_pubsub() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("c").await.unwrap();
        bus.publish("c", "one").await.unwrap();
        bus.publish("other", "ignored").await.unwrap();
        bus.publish("c", "two").await.unwrap();

        assert_eq!(rx.next().await.as_deref(), Some("one"));
        assert_eq!(rx.next().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_memory_records() {
        let bus = MemoryBus::new();
        bus.put_record("k", "a", "1").await.unwrap();
        bus.put_record("k", "b", "2").await.unwrap();
        bus.remove_record("k", "a").await.unwrap();
        assert_eq!(bus.records("k").await.unwrap(), vec!["2".to_string()]);
        assert!(bus.records("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_bus_fails_and_ends_subscriptions() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("c").await.unwrap();
        bus.set_available(false);

        assert!(rx.next().await.is_none());
        assert!(matches!(bus.publish("c", "x").await, Err(BusError::Unavailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<(), _> = policy
            .run("publish", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BusError::Unavailable)
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let calls = AtomicU32::new(0);
        let value = RetryPolicy::default()
            .run("publish", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(BusError::Unavailable)
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resilient_subscribe_survives_outage() {
        let bus = MemoryBus::new();
        let shared: Arc<dyn MessageBus> = Arc::new(bus.clone());
        let mut rx = resilient_subscribe(shared, "c".into(), Duration::from_millis(50)).await;

        bus.set_available(false);
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            publisher.set_available(true);
            // Give the subscriber time to reconnect before publishing.
            tokio::time::sleep(Duration::from_millis(200)).await;
            publisher.publish("c", "after").await.unwrap();
        });

        assert_eq!(rx.next().await.as_deref(), Some("after"));
    }
}
