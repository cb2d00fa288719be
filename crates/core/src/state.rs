//! Session state management.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::event::{Event, Input};
use crate::Error;

/// Where the session's current run is in the reasoning state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// No run in progress.
    #[default]
    Idle,
    /// Waiting on the reasoning engine.
    Thinking,
    /// Blocked on a human approval decision.
    AwaitingApproval,
    /// Waiting on the tool executor.
    Executing,
    /// Last run produced a final answer.
    Done,
    /// Last run was cancelled or timed out on approval.
    Cancelled,
    /// Last run failed.
    Failed,
    /// Last run used up its iteration budget.
    IterationLimitReached,
}

impl AgentState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AgentState::Thinking | AgentState::AwaitingApproval | AgentState::Executing
        )
    }
}

/// Counters for a session across its runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// When the most recent run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the most recent run finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of runs started.
    pub runs: u32,
    /// Iterations across all runs.
    pub iterations: u32,
    /// Tool executions performed.
    pub tool_calls: u32,
    /// Tool executions that failed.
    pub tool_failures: u32,
    /// Approval requests raised.
    pub approvals_requested: u32,
    /// Approval requests that did not end in approval or modification.
    pub approvals_denied: u32,
    /// Reasoning engine errors, including retried ones.
    pub engine_errors: u32,
}

impl Metrics {
    pub fn start(&mut self) {
        self.runs += 1;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// One independently addressable agent conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_state: AgentState,
    /// Ordered history. Append-only.
    pub history: Vec<Event>,
    pub metrics: Metrics,
    online: bool,
    /// Index into `history` where the current (or last) run began.
    run_start: usize,
    pending_approval: Option<Uuid>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_state: AgentState::Idle,
            history: Vec::new(),
            metrics: Metrics::default(),
            online: true,
            run_start: 0,
            pending_approval: None,
        }
    }

    pub fn with_history(id: impl Into<String>, history: Vec<Event>) -> Self {
        let run_start = history.len();
        Self {
            history,
            run_start,
            ..Self::new(id)
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn is_running(&self) -> bool {
        self.agent_state.is_active()
    }

    /// Open a new run and record the input that started it.
    pub fn begin_run(&mut self, input: Input) {
        self.run_start = self.history.len();
        self.pending_approval = None;
        self.agent_state = AgentState::Thinking;
        self.metrics.start();
        self.history.push(Event::input(input));
    }

    pub fn end_run(&mut self, state: AgentState) {
        self.agent_state = state;
        self.pending_approval = None;
        self.metrics.finish();
    }

    /// Entries recorded by the current (or last) run, starting with its input.
    pub fn current_run(&self) -> &[Event] {
        &self.history[self.run_start.min(self.history.len())..]
    }

    /// Append an entry to the current run.
    ///
    /// Fails once the run has recorded its final answer; the answer is always
    /// the last entry of a completed run.
    pub fn add_event(&mut self, event: Event) -> Result<(), Error> {
        if self.current_run().iter().any(Event::is_final_answer) {
            return Err(Error::HistorySealed(self.id.clone()));
        }
        self.history.push(event);
        Ok(())
    }

    pub fn pending_approval(&self) -> Option<Uuid> {
        self.pending_approval
    }

    /// Mark an approval request as outstanding. Only one may be outstanding.
    pub fn begin_approval(&mut self, request_id: Uuid) -> Result<(), Error> {
        if self.pending_approval.is_some() {
            return Err(Error::ApprovalPending(self.id.clone()));
        }
        self.pending_approval = Some(request_id);
        self.agent_state = AgentState::AwaitingApproval;
        self.metrics.approvals_requested += 1;
        Ok(())
    }

    pub fn end_approval(&mut self, request_id: Uuid) {
        if self.pending_approval == Some(request_id) {
            self.pending_approval = None;
        }
    }
}

/// Persistence for session history.
///
/// How history reaches disk is up to the implementation; the kernel only
/// loads on first use and saves after each run.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<Vec<Event>>, Error>;

    async fn save(&self, session_id: &str, history: &[Event]) -> Result<(), Error>;

    async fn delete(&self, session_id: &str) -> Result<(), Error>;
}

/// Process-local store. History is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Vec<Event>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, session_id: &str) -> Result<Option<Vec<Event>>, Error> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, history: &[Event]) -> Result<(), Error> {
        self.sessions
            .lock()
            .await
            .insert(session_id.to_string(), history.to_vec());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), Error> {
        self.sessions.lock().await.remove(session_id);
        Ok(())
    }
}
