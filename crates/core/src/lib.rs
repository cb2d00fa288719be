//! Reasoning kernel, approval gating and shared contracts for agent sessions.

pub mod approval;
pub mod comm;
pub mod controller;
pub mod event;
pub mod state;
pub mod stream;

pub use approval::{
    ApprovalContext, ApprovalEngine, ApprovalKind, ApprovalOutcome, ApprovalPrompt,
    ApprovalRequest, ApprovalResponse, ApprovalStrategy, AutoApprove, ChannelHandler,
    CustomStrategy, Decision, InteractionHandler, KeywordStrategy, PendingApproval, RiskStrategy,
};
pub use comm::{parse_communication, CommunicationRequest, Outbox, PeerDirectory};
pub use controller::{
    CancelCause, KernelConfig, Message, MessageRole, ReasoningContext, ReasoningEngine,
    ReasoningKernel, RejectionPolicy, RunResult, RunStatus, ToolExecutor,
};
pub use event::{
    Event, EventId, EventPayload, Input, InputSource, Proposal, ProposedAction, Step, ToolOutcome,
};
pub use state::{AgentState, MemoryStore, Metrics, Session, SessionStore};
pub use stream::{EventBus, RuntimeEvent, RuntimeEventKind};

/// Error types for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Reasoning engine error: {0}")]
    Engine(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Session {0} already has a final answer for this run")]
    HistorySealed(String),

    #[error("Session {0} already has an approval pending")]
    ApprovalPending(String),

    #[error("Interaction handler error: {0}")]
    Handler(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
