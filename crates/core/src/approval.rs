//! Human approval gating.
//!
//! Strategies are pure functions from an [`ApprovalContext`] to a
//! [`Decision`]. The [`ApprovalEngine`] asks them in order and returns the
//! first one that wants approval. Only the kernel talks to an
//! [`InteractionHandler`], through [`await_decision`], which bounds the wait
//! with the request timeout and the run's cancellation token.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{Proposal, ProposedAction};
use crate::Error;

/// Tools flagged by the risk strategy when configuration names none.
pub const DEFAULT_HIGH_RISK_TOOLS: &[&str] =
    &["execute_trade", "send_email", "file_write", "system_command"];

/// Words flagged by the keyword strategy when configuration names none.
pub const DEFAULT_SENSITIVE_KEYWORDS: &[&str] =
    &["delete", "format", "reset", "purchase", "sell", "transfer"];

/// Why a human is being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    ToolExecution,
    HighRiskAction,
    IterationCheckpoint,
    FinalAnswer,
    CustomIntervention,
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalKind::ToolExecution => "tool_execution",
            ApprovalKind::HighRiskAction => "high_risk_action",
            ApprovalKind::IterationCheckpoint => "iteration_checkpoint",
            ApprovalKind::FinalAnswer => "final_answer",
            ApprovalKind::CustomIntervention => "custom_intervention",
        };
        f.write_str(s)
    }
}

/// Read-only input to the strategies.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalContext {
    pub session_id: String,
    pub iteration: u32,
    /// `None` for a periodic checkpoint.
    pub proposal: Option<Proposal>,
    pub timestamp: DateTime<Utc>,
}

impl ApprovalContext {
    pub fn for_proposal(session_id: impl Into<String>, iteration: u32, proposal: Proposal) -> Self {
        Self {
            session_id: session_id.into(),
            iteration,
            proposal: Some(proposal),
            timestamp: Utc::now(),
        }
    }

    pub fn checkpoint(session_id: impl Into<String>, iteration: u32) -> Self {
        Self {
            session_id: session_id.into(),
            iteration,
            proposal: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_checkpoint(&self) -> bool {
        self.proposal.is_none()
    }

    pub fn action(&self) -> Option<&ProposedAction> {
        self.proposal.as_ref().map(|p| &p.action)
    }
}

/// A strategy's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NotNeeded,
    Needed { kind: ApprovalKind, reason: String },
}

impl Decision {
    pub fn needed(kind: ApprovalKind, reason: impl Into<String>) -> Self {
        Decision::Needed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_needed(&self) -> bool {
        matches!(self, Decision::Needed { .. })
    }
}

/// One pluggable approval policy. Must not block and must not have side
/// effects.
pub trait ApprovalStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, context: &ApprovalContext) -> Decision;
}

/// Flags high-risk tools, final answers and periodic checkpoints.
#[derive(Debug, Clone)]
pub struct RiskStrategy {
    high_risk_tools: HashSet<String>,
    require_final_approval: bool,
    checkpoint_interval: u32,
}

impl Default for RiskStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_RISK_TOOLS.iter().copied(), false, 5)
    }
}

impl RiskStrategy {
    pub fn new<I, S>(high_risk_tools: I, require_final_approval: bool, checkpoint_interval: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            high_risk_tools: high_risk_tools.into_iter().map(Into::into).collect(),
            require_final_approval,
            checkpoint_interval,
        }
    }
}

impl ApprovalStrategy for RiskStrategy {
    fn name(&self) -> &str {
        "risk"
    }

    fn evaluate(&self, context: &ApprovalContext) -> Decision {
        match context.action() {
            Some(ProposedAction::ToolInvocation { name, .. })
                if self.high_risk_tools.contains(name) =>
            {
                Decision::needed(ApprovalKind::HighRiskAction, format!("high-risk tool: {name}"))
            }
            Some(ProposedAction::FinalAnswer { .. }) if self.require_final_approval => {
                Decision::needed(ApprovalKind::FinalAnswer, "final answer requires confirmation")
            }
            None if self.checkpoint_interval > 0
                && context.iteration > 0
                && context.iteration % self.checkpoint_interval == 0 =>
            {
                Decision::needed(
                    ApprovalKind::IterationCheckpoint,
                    format!("checkpoint at iteration {}", context.iteration),
                )
            }
            _ => Decision::NotNeeded,
        }
    }
}

/// Flags any proposal containing a sensitive substring (case-insensitive).
#[derive(Debug, Clone)]
pub struct KeywordStrategy {
    keywords: Vec<String>,
}

impl Default for KeywordStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_KEYWORDS.iter().copied())
    }
}

impl KeywordStrategy {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

impl ApprovalStrategy for KeywordStrategy {
    fn name(&self) -> &str {
        "keyword"
    }

    fn evaluate(&self, context: &ApprovalContext) -> Decision {
        let Some(proposal) = &context.proposal else {
            return Decision::NotNeeded;
        };
        let text = proposal.serialized_content().to_lowercase();
        match self.keywords.iter().find(|k| text.contains(k.as_str())) {
            Some(keyword) => Decision::needed(
                ApprovalKind::HighRiskAction,
                format!("sensitive keyword: {keyword}"),
            ),
            None => Decision::NotNeeded,
        }
    }
}

type Predicate = dyn Fn(&ApprovalContext) -> Option<String> + Send + Sync;

/// User-supplied predicate. Returns the reason when approval is needed.
pub struct CustomStrategy {
    name: String,
    kind: ApprovalKind,
    predicate: Box<Predicate>,
}

impl CustomStrategy {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ApprovalContext) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: ApprovalKind::CustomIntervention,
            predicate: Box::new(predicate),
        }
    }

    pub fn with_kind(mut self, kind: ApprovalKind) -> Self {
        self.kind = kind;
        self
    }
}

impl ApprovalStrategy for CustomStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, context: &ApprovalContext) -> Decision {
        match (self.predicate)(context) {
            Some(reason) => Decision::needed(self.kind, reason),
            None => Decision::NotNeeded,
        }
    }
}

/// Ordered list of strategies; first non-trivial decision wins.
pub struct ApprovalEngine {
    strategies: Vec<Box<dyn ApprovalStrategy>>,
    enabled: AtomicBool,
}

impl Default for ApprovalEngine {
    fn default() -> Self {
        Self::new(vec![
            Box::new(RiskStrategy::default()),
            Box::new(KeywordStrategy::default()),
        ])
    }
}

impl ApprovalEngine {
    pub fn new(strategies: Vec<Box<dyn ApprovalStrategy>>) -> Self {
        Self {
            strategies,
            enabled: AtomicBool::new(true),
        }
    }

    /// Engine that never asks for approval.
    pub fn disabled() -> Self {
        let engine = Self::new(Vec::new());
        engine.disable();
        engine
    }

    pub fn with_strategy(mut self, strategy: impl ApprovalStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        info!("Human approval enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        info!("Human approval disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn evaluate(&self, context: &ApprovalContext) -> Decision {
        if !self.is_enabled() {
            return Decision::NotNeeded;
        }
        for strategy in &self.strategies {
            let decision = strategy.evaluate(context);
            if decision.is_needed() {
                debug!(
                    strategy = strategy.name(),
                    session = %context.session_id,
                    iteration = context.iteration,
                    "Approval needed"
                );
                return decision;
            }
        }
        Decision::NotNeeded
    }
}

/// A pending question to a human. Resolves to exactly one outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub context: ApprovalContext,
    pub kind: ApprovalKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub allow_modification: bool,
}

impl ApprovalRequest {
    pub fn new(
        context: ApprovalContext,
        kind: ApprovalKind,
        reason: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            kind,
            reason: reason.into(),
            created_at: Utc::now(),
            timeout,
            allow_modification: kind != ApprovalKind::IterationCheckpoint,
        }
    }

    /// Text of the proposal under review; empty for checkpoints.
    pub fn proposed_content(&self) -> String {
        self.context
            .proposal
            .as_ref()
            .map(Proposal::serialized_content)
            .unwrap_or_default()
    }

    /// The request in the shape handed to interaction front-ends.
    pub fn prompt(&self) -> ApprovalPrompt {
        ApprovalPrompt {
            kind: self.kind,
            reason: self.reason.clone(),
            proposed_content: self.proposed_content(),
            timeout_seconds: self.timeout.as_secs(),
            allow_modification: self.allow_modification,
        }
    }
}

/// Wire shape of an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPrompt {
    pub kind: ApprovalKind,
    pub reason: String,
    pub proposed_content: String,
    pub timeout_seconds: u64,
    pub allow_modification: bool,
}

/// A human's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalResponse {
    Approve,
    Reject,
    Modify { new_content: String },
    Cancel,
}

/// How an approval request ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    Modified { content: String },
    Cancelled,
    TimedOut,
}

impl ApprovalOutcome {
    /// Map a handler response. A modification the request does not allow is
    /// treated as a rejection.
    pub fn from_response(response: ApprovalResponse, allow_modification: bool) -> Self {
        match response {
            ApprovalResponse::Approve => ApprovalOutcome::Approved,
            ApprovalResponse::Reject => ApprovalOutcome::Rejected,
            ApprovalResponse::Modify { new_content } if allow_modification => {
                ApprovalOutcome::Modified {
                    content: new_content,
                }
            }
            ApprovalResponse::Modify { .. } => ApprovalOutcome::Rejected,
            ApprovalResponse::Cancel => ApprovalOutcome::Cancelled,
        }
    }

    /// Outcomes that end the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApprovalOutcome::Cancelled | ApprovalOutcome::TimedOut)
    }

    pub fn is_granted(&self) -> bool {
        matches!(
            self,
            ApprovalOutcome::Approved | ApprovalOutcome::Modified { .. }
        )
    }
}

/// Front-end that asks a human.
#[async_trait]
pub trait InteractionHandler: Send + Sync {
    async fn request_approval(&self, request: &ApprovalRequest) -> Result<ApprovalResponse, Error>;
}

/// Approves everything. For unattended runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl InteractionHandler for AutoApprove {
    async fn request_approval(&self, request: &ApprovalRequest) -> Result<ApprovalResponse, Error> {
        debug!(kind = %request.kind, reason = %request.reason, "Auto-approving");
        Ok(ApprovalResponse::Approve)
    }
}

/// A request forwarded to whoever holds the receiving end.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    pub reply: oneshot::Sender<ApprovalResponse>,
}

/// Forwards requests over a channel and waits for the reply.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelHandler {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl InteractionHandler for ChannelHandler {
    async fn request_approval(&self, request: &ApprovalRequest) -> Result<ApprovalResponse, Error> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(PendingApproval {
                request: request.clone(),
                reply,
            })
            .await
            .map_err(|_| Error::Handler("approval channel closed".into()))?;
        response
            .await
            .map_err(|_| Error::Handler("approval dropped without a response".into()))
    }
}

/// Wait for a decision on `request`.
///
/// Never resolves to `Approved` on its own: expiry gives `TimedOut`,
/// cancellation or a handler failure gives `Cancelled`.
pub async fn await_decision(
    handler: &dyn InteractionHandler,
    request: &ApprovalRequest,
    cancel: &CancellationToken,
) -> ApprovalOutcome {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!(request = %request.id, "Approval wait cancelled");
            ApprovalOutcome::Cancelled
        }
        result = tokio::time::timeout(request.timeout, handler.request_approval(request)) => {
            match result {
                Err(_) => {
                    warn!(
                        request = %request.id,
                        timeout_secs = request.timeout.as_secs(),
                        "Approval timed out"
                    );
                    ApprovalOutcome::TimedOut
                }
                Ok(Ok(response)) => {
                    ApprovalOutcome::from_response(response, request.allow_modification)
                }
                Ok(Err(e)) => {
                    warn!(request = %request.id, error = %e, "Interaction handler failed");
                    ApprovalOutcome::Cancelled
                }
            }
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }
}
