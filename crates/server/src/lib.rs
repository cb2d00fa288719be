//! Process-level services for agent sessions: bus transport, presence,
//! inter-session messaging, triggers and the per-session dispatcher.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod messaging;
pub mod registry;
pub mod runtime;
pub mod trigger;

pub use bus::{BusError, MemoryBus, MessageBus, RedisBus, RetryPolicy};
pub use config::{ApprovalConfig, Config, ConfigError, PresenceConfig, RedisConfig, TriggerConfig};
pub use dispatch::Dispatcher;
pub use messaging::{Message, Messenger};
pub use registry::{PresenceRecord, SessionRegistry};
pub use runtime::{Collaborators, Runtime};
pub use trigger::{
    Condition, CustomTriggers, DeadlineAt, TriggerError, TriggerKind, TriggerScheduler,
    TriggerSpec, TriggerStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error("Session {0} is closed")]
    SessionClosed(String),

    #[error("Run for session {0} was dropped before it finished")]
    RunDropped(String),
}
