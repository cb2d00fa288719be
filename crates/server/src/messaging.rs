//! Session-to-session messages over the bus.
//!
//! Every session has an inbox channel `{prefix}:comm:{session_id}`. Sending is
//! fire-and-forget; the inbox stream reconnects on its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use agent_mesh_core::Outbox;

use crate::bus::{resilient_subscribe, BusError, MessageBus, RetryPolicy};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Wire shape of an inter-session message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub payload: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl Message {
    pub fn new(from: impl Into<String>, to: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            payload: payload.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Clone)]
pub struct Messenger {
    bus: Arc<dyn MessageBus>,
    prefix: String,
    retry: RetryPolicy,
    reconnect_delay: Duration,
}

impl Messenger {
    pub fn new(bus: Arc<dyn MessageBus>, prefix: impl Into<String>) -> Self {
        Self {
            bus,
            prefix: prefix.into(),
            retry: RetryPolicy::default(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn inbox_channel(&self, session_id: &str) -> String {
        format!("{}:comm:{}", self.prefix, session_id)
    }

    /// Publish a message to `to`'s inbox. No delivery acknowledgement.
    pub async fn send(&self, from: &str, to: &str, payload: &str) -> Result<(), BusError> {
        let message = Message::new(from, to, payload);
        let json = serde_json::to_string(&message)?;
        let channel = self.inbox_channel(to);

        match self
            .retry
            .run("send", || self.bus.publish(&channel, &json))
            .await
        {
            Ok(()) => {
                debug!(from = %from, to = %to, "Message published");
                Ok(())
            }
            Err(e) => {
                warn!(from = %from, to = %to, error = %e, "Message dropped after retries");
                Err(e)
            }
        }
    }

    /// Messages arriving in `session_id`'s inbox. Malformed payloads are
    /// skipped.
    pub async fn subscribe(&self, session_id: &str) -> BoxStream<'static, Message> {
        let raw = resilient_subscribe(
            self.bus.clone(),
            self.inbox_channel(session_id),
            self.reconnect_delay,
        )
        .await;

        raw.filter_map(|payload| async move {
            match serde_json::from_str::<Message>(&payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed inbox message");
                    None
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl Outbox for Messenger {
    async fn send(&self, from: &str, to: &str, payload: &str) -> Result<(), agent_mesh_core::Error> {
        Messenger::send(self, from, to, payload)
            .await
            .map_err(|e| agent_mesh_core::Error::Delivery(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[tokio::test]
    async fn test_in_order_delivery() {
        let bus = Arc::new(MemoryBus::new());
        let messenger = Messenger::new(bus.clone(), "test");
        let mut inbox = messenger.subscribe("sam").await;

        messenger.send("bill", "sam", "m1").await.unwrap();
        messenger.send("bill", "sam", "m2").await.unwrap();
        messenger.send("bill", "other", "not for sam").await.unwrap();

        let first = inbox.next().await.unwrap();
        let second = inbox.next().await.unwrap();
        assert_eq!((first.from.as_str(), first.payload.as_str()), ("bill", "m1"));
        assert_eq!(second.payload, "m2");
        assert_eq!(second.to, "sam");
    }

    #[tokio::test]
    async fn test_malformed_payload_skipped() {
        let bus = Arc::new(MemoryBus::new());
        let messenger = Messenger::new(bus.clone(), "test");
        let mut inbox = messenger.subscribe("sam").await;

        bus.publish("test:comm:sam", "not json").await.unwrap();
        messenger.send("bill", "sam", "ok").await.unwrap();

        assert_eq!(inbox.next().await.unwrap().payload, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_fails_when_bus_down() {
        let bus = MemoryBus::new();
        bus.set_available(false);
        let messenger = Messenger::new(Arc::new(bus), "test");

        assert!(messenger.send("bill", "sam", "ping").await.is_err());
        assert!(matches!(
            Outbox::send(&messenger, "bill", "sam", "ping").await,
            Err(agent_mesh_core::Error::Delivery(_))
        ));
    }

    #[test]
    fn test_wire_shape() {
        let message = Message::new("bill", "sam", "ping");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["from"], "bill");
        assert_eq!(json["to"], "sam");
        assert_eq!(json["payload"], "ping");
        assert!(json["timestamp"].is_i64());
    }
}
