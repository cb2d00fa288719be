//! Reasoning kernel - the per-session think/act/observe loop.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::approval::{
    self, ApprovalContext, ApprovalEngine, ApprovalKind, ApprovalOutcome, ApprovalRequest,
    Decision, InteractionHandler,
};
use crate::comm::{self, Outbox, PeerDirectory};
use crate::event::{Event, EventPayload, Input, Proposal, ProposedAction, Step, ToolOutcome};
use crate::state::{AgentState, Session};
use crate::stream::{EventBus, RuntimeEvent, RuntimeEventKind};
use crate::Error;

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Everything the reasoning engine sees for one iteration.
#[derive(Debug, Clone)]
pub struct ReasoningContext {
    pub session_id: String,
    pub iteration: u32,
    pub messages: Vec<Message>,
    /// Other sessions currently online.
    pub peers: Vec<String>,
}

/// Produces the next step for a session.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn propose(&self, context: &ReasoningContext) -> Result<Proposal, Error>;
}

/// Runs named tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: &Value) -> Result<String, Error>;
}

/// What happens when the engine proposes a tool call that was rejected earlier
/// in the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Gate it again like any other proposal.
    #[default]
    AllowRepropose,
    /// Refuse it without asking.
    ForbidRepeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub max_iterations: u32,
    /// Raise a checkpoint every N iterations; 0 disables checkpoints.
    pub checkpoint_interval: u32,
    /// Extra attempts after a reasoning engine failure.
    pub engine_retries: u32,
    pub approval_timeout_secs: u64,
    pub tool_timeout_secs: Option<u64>,
    pub rejection_policy: RejectionPolicy,
    pub system_prompt: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            checkpoint_interval: 0,
            engine_retries: 2,
            approval_timeout_secs: 300,
            tool_timeout_secs: None,
            rejection_policy: RejectionPolicy::AllowRepropose,
            system_prompt: None,
        }
    }
}

impl KernelConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }

    fn is_checkpoint(&self, iteration: u32) -> bool {
        self.checkpoint_interval > 0 && iteration % self.checkpoint_interval == 0
    }
}

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCause {
    /// A human answered "cancel".
    Operator,
    /// Nobody answered an approval request in time.
    ApprovalTimeout,
    /// The run's cancellation token fired.
    Signal,
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Cancelled(CancelCause),
    Failed(String),
    IterationLimitReached,
}

impl RunStatus {
    pub fn agent_state(&self) -> AgentState {
        match self {
            RunStatus::Done => AgentState::Done,
            RunStatus::Cancelled(_) => AgentState::Cancelled,
            RunStatus::Failed(_) => AgentState::Failed,
            RunStatus::IterationLimitReached => AgentState::IterationLimitReached,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Done => f.write_str("done"),
            RunStatus::Cancelled(CancelCause::Operator) => f.write_str("cancelled by operator"),
            RunStatus::Cancelled(CancelCause::ApprovalTimeout) => {
                f.write_str("cancelled: approval timed out")
            }
            RunStatus::Cancelled(CancelCause::Signal) => f.write_str("cancelled"),
            RunStatus::Failed(cause) => write!(f, "failed: {cause}"),
            RunStatus::IterationLimitReached => f.write_str("iteration limit reached"),
        }
    }
}

/// Result of one kernel run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub session_id: String,
    pub status: RunStatus,
    pub final_answer: Option<String>,
    pub iterations: u32,
}

#[derive(Default)]
struct RunState {
    iterations: u32,
    /// `name:args` of tool calls rejected in this run.
    rejected: HashSet<String>,
    final_answer: Option<String>,
}

/// Drives runs for any number of sessions. One run per session at a time is
/// the caller's responsibility.
pub struct ReasoningKernel {
    engine: Arc<dyn ReasoningEngine>,
    tools: Arc<dyn ToolExecutor>,
    handler: Arc<dyn InteractionHandler>,
    approvals: Arc<ApprovalEngine>,
    events: EventBus,
    outbox: Option<Arc<dyn Outbox>>,
    peers: Option<Arc<dyn PeerDirectory>>,
    config: KernelConfig,
}

impl ReasoningKernel {
    pub fn new(
        engine: Arc<dyn ReasoningEngine>,
        tools: Arc<dyn ToolExecutor>,
        handler: Arc<dyn InteractionHandler>,
    ) -> Self {
        Self {
            engine,
            tools,
            handler,
            approvals: Arc::new(ApprovalEngine::default()),
            events: EventBus::new(),
            outbox: None,
            peers: None,
            config: KernelConfig::default(),
        }
    }

    pub fn with_approvals(mut self, approvals: Arc<ApprovalEngine>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn with_peers(mut self, peers: Arc<dyn PeerDirectory>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn approvals(&self) -> &ApprovalEngine {
        &self.approvals
    }

    /// Run the loop for `session` until it reaches a terminal state.
    pub async fn run(
        &self,
        session: &mut Session,
        input: Input,
        cancel: &CancellationToken,
    ) -> RunResult {
        let run_id = Uuid::new_v4();
        info!(
            session = %session.id,
            run = %run_id,
            synthetic = input.is_synthetic(),
            "Starting run"
        );
        self.publish(
            &session.id,
            RuntimeEventKind::RunStarted {
                run_id,
                source: input.source.clone(),
            },
        );
        session.begin_run(input);

        let mut run = RunState::default();
        let status = match self.drive(session, &mut run, cancel).await {
            Ok(status) => status,
            Err(e) => {
                error!(session = %session.id, run = %run_id, error = %e, "Run failed");
                RunStatus::Failed(e.to_string())
            }
        };

        session.end_run(status.agent_state());
        info!(
            session = %session.id,
            run = %run_id,
            status = %status,
            iterations = run.iterations,
            "Run finished"
        );
        self.publish(
            &session.id,
            RuntimeEventKind::RunFinished {
                run_id,
                status: status.clone(),
            },
        );

        RunResult {
            run_id,
            session_id: session.id.clone(),
            status,
            final_answer: run.final_answer,
            iterations: run.iterations,
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        run: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, Error> {
        loop {
            if cancel.is_cancelled() {
                return Ok(RunStatus::Cancelled(CancelCause::Signal));
            }
            if run.iterations >= self.config.max_iterations {
                warn!(session = %session.id, max = self.config.max_iterations, "Iteration limit reached");
                return Ok(RunStatus::IterationLimitReached);
            }

            run.iterations += 1;
            let iteration = run.iterations;
            session.metrics.iterations += 1;
            session.agent_state = AgentState::Thinking;
            debug!(session = %session.id, iteration, "Agent iteration");
            self.publish(&session.id, RuntimeEventKind::StepStarted { iteration });

            if self.config.is_checkpoint(iteration) {
                let context = ApprovalContext::checkpoint(session.id.clone(), iteration);
                if let Decision::Needed { kind, reason } = self.approvals.evaluate(&context) {
                    match self.gate(session, context, kind, reason, cancel).await? {
                        ApprovalOutcome::Approved => {}
                        ApprovalOutcome::Modified { content } => {
                            self.note(session, format!("Operator guidance: {content}"))?;
                        }
                        ApprovalOutcome::Rejected => {
                            self.note(
                                session,
                                format!(
                                    "Operator rejected the checkpoint at iteration {iteration}; reconsider the current approach."
                                ),
                            )?;
                        }
                        ApprovalOutcome::Cancelled => {
                            return Ok(RunStatus::Cancelled(cancel_cause(cancel)));
                        }
                        ApprovalOutcome::TimedOut => {
                            return Ok(RunStatus::Cancelled(CancelCause::ApprovalTimeout));
                        }
                    }
                }
            }

            let Some(proposal) = self.propose(session, iteration, cancel).await? else {
                return Ok(RunStatus::Cancelled(CancelCause::Signal));
            };

            if let Some(thought) = proposal.thought.as_deref().filter(|t| !t.trim().is_empty()) {
                self.record(session, Step::Thought { text: thought.to_string() })?;
                self.relay(&session.id, thought).await;
            }

            match &proposal.action {
                ProposedAction::Continue => {}

                ProposedAction::ToolInvocation { name, args } => {
                    let key = format!("{name}:{args}");
                    if self.config.rejection_policy == RejectionPolicy::ForbidRepeat
                        && run.rejected.contains(&key)
                    {
                        info!(session = %session.id, tool = %name, "Refusing repeat of a rejected tool call");
                        self.note(
                            session,
                            format!(
                                "The call to {name} with these arguments was already rejected in this run; choose a different action."
                            ),
                        )?;
                        continue;
                    }

                    let args = match self.review(session, iteration, &proposal, cancel).await? {
                        ApprovalOutcome::Approved => args.clone(),
                        ApprovalOutcome::Modified { content } => {
                            serde_json::from_str(&content).unwrap_or(Value::String(content))
                        }
                        ApprovalOutcome::Rejected => {
                            run.rejected.insert(key);
                            self.note(session, format!("Rejected proposal: call {name} with {args}"))?;
                            continue;
                        }
                        ApprovalOutcome::Cancelled => {
                            return Ok(RunStatus::Cancelled(cancel_cause(cancel)));
                        }
                        ApprovalOutcome::TimedOut => {
                            return Ok(RunStatus::Cancelled(CancelCause::ApprovalTimeout));
                        }
                    };

                    self.execute(session, name, args).await?;
                }

                ProposedAction::FinalAnswer { text } => {
                    let text = match self.review(session, iteration, &proposal, cancel).await? {
                        ApprovalOutcome::Approved => text.clone(),
                        ApprovalOutcome::Modified { content } => content,
                        ApprovalOutcome::Rejected => {
                            self.note(session, format!("Rejected final answer: {text}"))?;
                            continue;
                        }
                        ApprovalOutcome::Cancelled => {
                            return Ok(RunStatus::Cancelled(cancel_cause(cancel)));
                        }
                        ApprovalOutcome::TimedOut => {
                            return Ok(RunStatus::Cancelled(CancelCause::ApprovalTimeout));
                        }
                    };

                    self.record(session, Step::FinalAnswer { text: text.clone() })?;
                    self.publish(&session.id, RuntimeEventKind::FinalAnswer { text: text.clone() });
                    self.relay(&session.id, &text).await;
                    run.final_answer = Some(text);
                    return Ok(RunStatus::Done);
                }
            }
        }
    }

    /// Ask the engine for a proposal, retrying failures with the same context.
    /// `None` when the run was cancelled while waiting.
    async fn propose(
        &self,
        session: &mut Session,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<Proposal>, Error> {
        let context = ReasoningContext {
            session_id: session.id.clone(),
            iteration,
            messages: self.build_messages(session),
            peers: self.active_peers(&session.id).await,
        };

        let mut last_error = None;
        for attempt in 0..=self.config.engine_retries {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                result = self.engine.propose(&context) => result,
            };
            match result {
                Ok(proposal) => return Ok(Some(proposal)),
                Err(e) => {
                    session.metrics.engine_errors += 1;
                    warn!(session = %session.id, iteration, attempt, error = %e, "Reasoning engine failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Engine("no attempts made".into())))
    }

    async fn review(
        &self,
        session: &mut Session,
        iteration: u32,
        proposal: &Proposal,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome, Error> {
        let context = ApprovalContext::for_proposal(session.id.clone(), iteration, proposal.clone());
        match self.approvals.evaluate(&context) {
            Decision::NotNeeded => Ok(ApprovalOutcome::Approved),
            Decision::Needed { kind, reason } => {
                self.gate(session, context, kind, reason, cancel).await
            }
        }
    }

    /// Raise an approval request and block this session's run until it
    /// resolves.
    async fn gate(
        &self,
        session: &mut Session,
        context: ApprovalContext,
        kind: ApprovalKind,
        reason: String,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome, Error> {
        let request = ApprovalRequest::new(context, kind, reason, self.config.approval_timeout());
        session.begin_approval(request.id)?;

        info!(
            session = %session.id,
            request = %request.id,
            kind = %kind,
            reason = %request.reason,
            "Approval requested"
        );
        self.publish(
            &session.id,
            RuntimeEventKind::ApprovalRequested {
                request_id: request.id,
                kind,
                reason: request.reason.clone(),
            },
        );

        let outcome = approval::await_decision(self.handler.as_ref(), &request, cancel).await;

        session.end_approval(request.id);
        session.agent_state = AgentState::Thinking;
        if !outcome.is_granted() {
            session.metrics.approvals_denied += 1;
        }
        info!(session = %session.id, request = %request.id, outcome = ?outcome, "Approval resolved");
        self.publish(
            &session.id,
            RuntimeEventKind::ApprovalResolved {
                request_id: request.id,
                outcome: outcome.clone(),
            },
        );

        Ok(outcome)
    }

    async fn execute(&self, session: &mut Session, name: &str, args: Value) -> Result<(), Error> {
        self.record(
            session,
            Step::ToolInvocation {
                name: name.to_string(),
                args: args.clone(),
            },
        )?;
        session.agent_state = AgentState::Executing;
        session.metrics.tool_calls += 1;
        self.publish(&session.id, RuntimeEventKind::ToolInvoked { name: name.to_string() });
        debug!(session = %session.id, tool = %name, "Executing tool");

        let result = match self.config.tool_timeout() {
            Some(limit) => match tokio::time::timeout(limit, self.tools.execute(name, &args)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Tool(format!("timed out after {}s", limit.as_secs()))),
            },
            None => self.tools.execute(name, &args).await,
        };

        let outcome = match result {
            Ok(output) => ToolOutcome::Success { output },
            Err(e) => {
                warn!(session = %session.id, tool = %name, error = %e, "Tool execution failed");
                session.metrics.tool_failures += 1;
                ToolOutcome::Failure {
                    error: e.to_string(),
                }
            }
        };

        self.record(
            session,
            Step::Observation {
                tool: name.to_string(),
                outcome,
            },
        )?;
        session.agent_state = AgentState::Thinking;
        Ok(())
    }

    fn record(&self, session: &mut Session, step: Step) -> Result<(), Error> {
        session.add_event(Event::step(step.clone()))?;
        self.publish(&session.id, RuntimeEventKind::StepRecorded { step });
        Ok(())
    }

    fn note(&self, session: &mut Session, text: String) -> Result<(), Error> {
        debug!(session = %session.id, note = %text, "System note");
        session.add_event(Event::note(text))
    }

    fn publish(&self, session_id: &str, kind: RuntimeEventKind) {
        self.events.publish(RuntimeEvent::new(session_id, kind));
    }

    async fn relay(&self, session_id: &str, text: &str) {
        let Some(outbox) = &self.outbox else {
            return;
        };
        for target in comm::relay(outbox.as_ref(), session_id, text).await {
            info!(session = %session_id, target = %target, "Message sent");
            self.publish(session_id, RuntimeEventKind::MessageSent { to: target });
        }
    }

    async fn active_peers(&self, session_id: &str) -> Vec<String> {
        match &self.peers {
            Some(directory) => directory
                .active_peers()
                .await
                .into_iter()
                .filter(|peer| peer != session_id)
                .collect(),
            None => Vec::new(),
        }
    }

    fn build_messages(&self, session: &Session) -> Vec<Message> {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.config.system_prompt {
            messages.push(Message {
                role: MessageRole::System,
                content: prompt.clone(),
            });
        }

        for event in &session.history {
            let (role, content) = match &event.payload {
                EventPayload::Input(input) => (MessageRole::User, input.render()),
                EventPayload::Note { text } => (MessageRole::System, text.clone()),
                EventPayload::Step(Step::Thought { text }) => {
                    (MessageRole::Assistant, format!("Thought: {text}"))
                }
                EventPayload::Step(Step::ToolInvocation { name, args }) => {
                    (MessageRole::Assistant, format!("Tool call: {name} {args}"))
                }
                EventPayload::Step(Step::Observation { tool, outcome }) => match outcome {
                    ToolOutcome::Success { output } => {
                        (MessageRole::User, format!("Tool result ({tool}): {output}"))
                    }
                    ToolOutcome::Failure { error } => {
                        (MessageRole::User, format!("Tool error ({tool}): {error}"))
                    }
                },
                EventPayload::Step(Step::FinalAnswer { text }) => {
                    (MessageRole::Assistant, text.clone())
                }
            };
            messages.push(Message { role, content });
        }

        messages
    }
}

fn cancel_cause(cancel: &CancellationToken) -> CancelCause {
    if cancel.is_cancelled() {
        CancelCause::Signal
    } else {
        CancelCause::Operator
    }
}
