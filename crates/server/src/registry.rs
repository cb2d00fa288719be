//! Session registry - TTL-based presence directory.
//!
//! Each announced session republishes its [`PresenceRecord`] well before its
//! TTL runs out. Every registry merges the records it hears into a local view
//! and answers `list_active` from that view alone, pruning anything older
//! than its TTL. Records are advisory: a missing peer is never an error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agent_mesh_core::PeerDirectory;

use crate::bus::{resilient_subscribe, MessageBus, RetryPolicy};

/// Upper bound on the re-advertisement period, whatever the TTL.
const MAX_HEARTBEAT_PERIOD: Duration = Duration::from_secs(3600);

/// Wire shape of a presence advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub session_id: String,
    /// Epoch milliseconds.
    pub last_seen: i64,
    /// Zero marks a withdrawal.
    pub ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl PresenceRecord {
    pub fn new(session_id: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            session_id: session_id.into(),
            last_seen: Utc::now().timestamp_millis(),
            ttl_seconds,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_alive_at(&self, now_ms: i64) -> bool {
        let ttl_ms = i64::try_from(self.ttl_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.last_seen) < ttl_ms
    }

    fn touch(&mut self) {
        self.last_seen = Utc::now().timestamp_millis();
    }
}

type View = Arc<Mutex<HashMap<String, PresenceRecord>>>;

fn lock_view(view: &View) -> MutexGuard<'_, HashMap<String, PresenceRecord>> {
    view.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keep the newer of two records; a withdrawal removes the entry.
fn merge(view: &View, record: PresenceRecord) {
    let mut view = lock_view(view);
    if record.ttl_seconds == 0 {
        if view
            .get(&record.session_id)
            .is_some_and(|known| known.last_seen <= record.last_seen)
        {
            view.remove(&record.session_id);
        }
        return;
    }
    match view.get(&record.session_id) {
        Some(known) if known.last_seen > record.last_seen => {}
        _ => {
            view.insert(record.session_id.clone(), record);
        }
    }
}

pub struct SessionRegistry {
    bus: Arc<dyn MessageBus>,
    prefix: String,
    retry: RetryPolicy,
    view: View,
    heartbeats: Mutex<HashMap<String, JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(bus: Arc<dyn MessageBus>, prefix: impl Into<String>) -> Self {
        Self {
            bus,
            prefix: prefix.into(),
            retry: RetryPolicy::default(),
            view: Arc::new(Mutex::new(HashMap::new())),
            heartbeats: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn channel(&self) -> String {
        format!("{}:presence", self.prefix)
    }

    fn records_key(&self) -> String {
        format!("{}:sessions", self.prefix)
    }

    /// Load stored records and start following advertisements.
    pub async fn start(&self) {
        self.refresh().await;

        let mut updates =
            resilient_subscribe(self.bus.clone(), self.channel(), Duration::from_secs(1)).await;
        let view = self.view.clone();
        let handle = tokio::spawn(async move {
            while let Some(payload) = updates.next().await {
                match serde_json::from_str::<PresenceRecord>(&payload) {
                    Ok(record) => merge(&view, record),
                    Err(e) => warn!(error = %e, "Ignoring malformed presence record"),
                }
            }
        });

        let previous = self
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(channel = %self.channel(), "Presence listener started");
    }

    /// Merge the records stored on the bus into the local view. Expired
    /// records left behind by processes that never withdrew are deleted.
    pub async fn refresh(&self) {
        let key = self.records_key();
        let raw = match self.retry.run("load presence", || self.bus.records(&key)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Could not load presence records");
                return;
            }
        };

        let now = Utc::now().timestamp_millis();
        let mut stale = Vec::new();
        for payload in raw {
            match serde_json::from_str::<PresenceRecord>(&payload) {
                Ok(record) if record.is_alive_at(now) => merge(&self.view, record),
                Ok(record) => stale.push(record.session_id),
                Err(e) => warn!(error = %e, "Ignoring malformed stored presence record"),
            }
        }
        for session_id in stale {
            match self.bus.remove_record(&key, &session_id).await {
                Ok(()) => debug!(session = %session_id, "Removed expired presence record"),
                Err(e) => debug!(session = %session_id, error = %e, "Could not remove expired presence record"),
            }
        }
    }

    /// Advertise `session_id` now and keep re-advertising it until withdrawn.
    pub async fn announce(&self, session_id: &str, ttl_seconds: u64, metadata: Option<serde_json::Value>) {
        let mut record = PresenceRecord::new(session_id, ttl_seconds.max(1));
        if let Some(metadata) = metadata {
            record = record.with_metadata(metadata);
        }
        merge(&self.view, record.clone());
        publish_record(self.bus.as_ref(), &self.retry, &self.channel(), &self.records_key(), &record)
            .await;

        let bus = self.bus.clone();
        let retry = self.retry;
        let channel = self.channel();
        let key = self.records_key();
        let view = self.view.clone();
        let period = Duration::from_millis(record.ttl_seconds.saturating_mul(1000) / 3)
            .clamp(Duration::from_millis(1), MAX_HEARTBEAT_PERIOD);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                record.touch();
                merge(&view, record.clone());
                publish_record(bus.as_ref(), &retry, &channel, &key, &record).await;
            }
        });

        let previous = self
            .heartbeats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session_id.to_string(), heartbeat);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(session = %session_id, ttl_seconds, "Session announced");
    }

    /// Stop advertising `session_id` and tell peers it is gone.
    pub async fn withdraw(&self, session_id: &str) {
        let heartbeat = self
            .heartbeats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id);
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        lock_view(&self.view).remove(session_id);

        let key = self.records_key();
        if let Err(e) = self
            .retry
            .run("remove presence", || self.bus.remove_record(&key, session_id))
            .await
        {
            warn!(session = %session_id, error = %e, "Could not remove presence record");
        }

        let tombstone = PresenceRecord::new(session_id, 0);
        match serde_json::to_string(&tombstone) {
            Ok(json) => {
                let channel = self.channel();
                if let Err(e) = self
                    .retry
                    .run("withdraw", || self.bus.publish(&channel, &json))
                    .await
                {
                    warn!(session = %session_id, error = %e, "Could not publish withdrawal");
                }
            }
            Err(e) => warn!(error = %e, "Could not encode withdrawal"),
        }
        info!(session = %session_id, "Session withdrawn");
    }

    /// Sessions announced from this registry.
    pub fn announced(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .heartbeats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Record an advertisement heard from elsewhere.
    pub fn observe(&self, record: PresenceRecord) {
        merge(&self.view, record);
    }

    /// Live records as of `now_ms`, sorted by session id. Stale ones are
    /// pruned from the view.
    pub fn records_at(&self, now_ms: i64) -> Vec<PresenceRecord> {
        let mut view = lock_view(&self.view);
        view.retain(|_, record| record.is_alive_at(now_ms));
        let mut records: Vec<PresenceRecord> = view.values().cloned().collect();
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        records
    }

    pub fn records(&self) -> Vec<PresenceRecord> {
        self.records_at(Utc::now().timestamp_millis())
    }

    /// Snapshot of live session ids, sorted.
    pub fn list_active(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.session_id).collect()
    }

    /// Withdraw everything announced here and stop listening.
    pub async fn shutdown(&self) {
        for session_id in self.announced() {
            self.withdraw(&session_id).await;
        }
        let listener = self.listener.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(listener) = listener {
            listener.abort();
        }
        debug!("Session registry stopped");
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        let heartbeats = self.heartbeats.get_mut().unwrap_or_else(|p| p.into_inner());
        for (_, heartbeat) in heartbeats.drain() {
            heartbeat.abort();
        }
        if let Some(listener) = self.listener.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl PeerDirectory for SessionRegistry {
    async fn active_peers(&self) -> Vec<String> {
        self.list_active()
    }
}

async fn publish_record(
    bus: &dyn MessageBus,
    retry: &RetryPolicy,
    channel: &str,
    key: &str,
    record: &PresenceRecord,
) {
    let json = match serde_json::to_string(record) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Could not encode presence record");
            return;
        }
    };
    let result = retry
        .run("announce", || async {
            bus.put_record(key, &record.session_id, &json).await?;
            bus.publish(channel, &json).await
        })
        .await;
    if let Err(e) = result {
        warn!(session = %record.session_id, error = %e, "Presence not advertised");
    }
}
