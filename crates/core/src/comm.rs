//! Inter-session communication requested from inside engine output.
//!
//! An engine may embed `{"target": "<session>", "message": "<text>"}` in a
//! thought or final answer. [`parse_communication`] pulls every such block out
//! of free text; anything that is not a well-formed request is ignored.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::Error;

/// A request to deliver `message` to session `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationRequest {
    pub target: String,
    pub message: String,
}

impl CommunicationRequest {
    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let target = object.get("target")?.as_str()?.trim();
        let message = object.get("message")?.as_str()?;
        if target.is_empty() {
            return None;
        }
        Some(Self {
            target: target.to_string(),
            message: message.to_string(),
        })
    }
}

/// Extract all communication blocks from `text`, in order of appearance.
pub fn parse_communication(text: &str) -> Vec<CommunicationRequest> {
    let mut found = Vec::new();
    let mut pos = 0;

    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                if let Some(request) = CommunicationRequest::from_value(&value) {
                    found.push(request);
                }
                pos = start + values.byte_offset();
            }
            _ => pos = start + 1,
        }
    }

    found
}

/// Fire-and-forget delivery to another session.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send(&self, from: &str, to: &str, payload: &str) -> Result<(), Error>;
}

/// Snapshot of sessions currently believed to be online.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn active_peers(&self) -> Vec<String>;
}

/// Parse `text` and send every request it contains from `from`.
///
/// Returns the targets that were handed to the outbox. Requests addressed to
/// `from` itself are skipped; delivery failures are logged and dropped.
pub async fn relay(outbox: &dyn Outbox, from: &str, text: &str) -> Vec<String> {
    let mut sent = Vec::new();
    for request in parse_communication(text) {
        if request.target == from {
            debug!(session = %from, "Ignoring communication addressed to self");
            continue;
        }
        match outbox.send(from, &request.target, &request.message).await {
            Ok(()) => sent.push(request.target),
            Err(e) => warn!(session = %from, target = %request.target, error = %e, "Message not delivered"),
        }
    }
    sent
}
