//! Event bus for run lifecycle events.
//!
//! In-process pub/sub: the kernel publishes every state transition and
//! observability or UI sinks subscribe. Publishing never blocks a run; a
//! subscriber that falls behind misses events rather than stalling the kernel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::approval::{ApprovalKind, ApprovalOutcome};
use crate::controller::RunStatus;
use crate::event::{EventId, InputSource, Step};

const SUBSCRIBER_BUFFER: usize = 256;
const DEFAULT_RETAINED: usize = 1024;

/// What happened.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEventKind {
    RunStarted {
        run_id: Uuid,
        source: InputSource,
    },
    StepStarted {
        iteration: u32,
    },
    StepRecorded {
        step: Step,
    },
    ApprovalRequested {
        request_id: Uuid,
        kind: ApprovalKind,
        reason: String,
    },
    ApprovalResolved {
        request_id: Uuid,
        outcome: ApprovalOutcome,
    },
    ToolInvoked {
        name: String,
    },
    MessageSent {
        to: String,
    },
    FinalAnswer {
        text: String,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// A lifecycle event scoped to one session.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub kind: RuntimeEventKind,
}

impl RuntimeEvent {
    pub fn new(session_id: impl Into<String>, kind: RuntimeEventKind) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            session_id: session_id.into(),
            kind,
        }
    }
}

#[derive(Debug)]
struct Inner {
    retained: VecDeque<RuntimeEvent>,
    capacity: usize,
    subscribers: HashMap<String, mpsc::Sender<RuntimeEvent>>,
}

/// Shared, cloneable event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RETAINED)
    }

    /// Bus that keeps at most `capacity` recent events for late readers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                retained: VecDeque::new(),
                capacity: capacity.max(1),
                subscribers: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish an event and notify subscribers.
    pub fn publish(&self, event: RuntimeEvent) -> EventId {
        let id = event.id;
        let mut inner = self.lock();

        if inner.retained.len() == inner.capacity {
            inner.retained.pop_front();
        }
        inner.retained.push_back(event.clone());

        // Notify all subscribers, removing any that have closed
        let mut closed = Vec::new();
        for (sub_id, sender) in &inner.subscribers {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %sub_id, "Event subscriber lagging, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sub_id.clone()),
            }
        }
        for sub_id in closed {
            inner.subscribers.remove(&sub_id);
        }

        id
    }

    /// Subscribe to new events. Re-using an id replaces the old subscription.
    pub fn subscribe(&self, id: impl Into<String>) -> mpsc::Receiver<RuntimeEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.lock().subscribers.insert(id.into(), tx);
        rx
    }

    /// Unsubscribe from events.
    pub fn unsubscribe(&self, id: &str) {
        self.lock().subscribers.remove(id);
    }

    /// Retained events, oldest first.
    pub fn history(&self) -> Vec<RuntimeEvent> {
        self.lock().retained.iter().cloned().collect()
    }

    /// Retained events published after the given event.
    pub fn since(&self, id: EventId) -> Vec<RuntimeEvent> {
        let inner = self.lock();
        match inner.retained.iter().position(|e| e.id == id) {
            Some(pos) => inner.retained.iter().skip(pos + 1).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Retained events for one session.
    pub fn for_session(&self, session_id: &str) -> Vec<RuntimeEvent> {
        self.lock()
            .retained
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().retained.is_empty()
    }
}
