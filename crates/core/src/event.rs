//! History types for a session.
//!
//! A session's history is an ordered list of [`Event`]s:
//! - Inputs: what started a run (user turn, trigger firing, inbound message)
//! - Steps: what the run produced (thought, tool call, observation, answer)
//! - Notes: system annotations such as rejected proposals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a run's input came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSource {
    /// The primary caller (an interactive user or API client).
    User,
    /// A trigger owned by the session fired.
    Trigger { name: String },
    /// Another session sent a message.
    Message { from: String },
}

/// Input that starts one kernel run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub source: InputSource,
    pub content: String,
}

impl Input {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            source: InputSource::User,
            content: content.into(),
        }
    }

    pub fn trigger(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: InputSource::Trigger { name: name.into() },
            content: content.into(),
        }
    }

    pub fn message(from: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: InputSource::Message { from: from.into() },
            content: content.into(),
        }
    }

    /// True when the input did not come from the primary caller.
    pub fn is_synthetic(&self) -> bool {
        !matches!(self.source, InputSource::User)
    }

    /// Text shown to the reasoning engine for this input.
    pub fn render(&self) -> String {
        match &self.source {
            InputSource::User => self.content.clone(),
            InputSource::Trigger { name } => format!("[trigger {name}] {}", self.content),
            InputSource::Message { from } => format!("[from {from}] {}", self.content),
        }
    }
}

/// Result of a tool execution as recorded in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { output: String },
    Failure { error: String },
}

impl ToolOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ToolOutcome::Failure { .. })
    }
}

/// One recorded unit of reasoning output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Thought {
        text: String,
    },
    ToolInvocation {
        name: String,
        args: serde_json::Value,
    },
    Observation {
        tool: String,
        outcome: ToolOutcome,
    },
    FinalAnswer {
        text: String,
    },
}

/// The action part of a reasoning engine proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposedAction {
    /// Keep thinking; nothing to execute this iteration.
    Continue,
    ToolInvocation {
        name: String,
        args: serde_json::Value,
    },
    FinalAnswer {
        text: String,
    },
}

/// What the reasoning engine wants to do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(default)]
    pub thought: Option<String>,
    pub action: ProposedAction,
}

impl Proposal {
    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            thought: Some(text.into()),
            action: ProposedAction::Continue,
        }
    }

    pub fn tool(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            thought: None,
            action: ProposedAction::ToolInvocation {
                name: name.into(),
                args,
            },
        }
    }

    pub fn final_answer(text: impl Into<String>) -> Self {
        Self {
            thought: None,
            action: ProposedAction::FinalAnswer { text: text.into() },
        }
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }

    /// Flattened text of the proposal, used for keyword matching.
    pub fn serialized_content(&self) -> String {
        let mut parts = Vec::new();
        if let Some(thought) = &self.thought {
            parts.push(thought.clone());
        }
        match &self.action {
            ProposedAction::Continue => {}
            ProposedAction::ToolInvocation { name, args } => {
                parts.push(name.clone());
                parts.push(args.to_string());
            }
            ProposedAction::FinalAnswer { text } => parts.push(text.clone()),
        }
        parts.join(" ")
    }
}

/// A timestamped entry in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn input(input: Input) -> Self {
        Self::new(EventPayload::Input(input))
    }

    pub fn step(step: Step) -> Self {
        Self::new(EventPayload::Step(step))
    }

    pub fn note(text: impl Into<String>) -> Self {
        Self::new(EventPayload::Note { text: text.into() })
    }

    pub fn is_final_answer(&self) -> bool {
        matches!(self.payload, EventPayload::Step(Step::FinalAnswer { .. }))
    }
}

/// The payload of a history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Input that started a run.
    Input(Input),

    /// A step produced by a run.
    Step(Step),

    /// A system note (rejected proposal, operator guidance).
    Note { text: String },
}
