//! Background triggers.
//!
//! A trigger is an independent task that watches a clock, an inbox or a
//! custom condition and, when it fires, queues synthetic input for its
//! session through the [`Dispatcher`]. Triggers never touch session state
//! directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{BoxStream, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use agent_mesh_core::Input;

use crate::dispatch::Dispatcher;
use crate::messaging::{Message, Messenger};

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Trigger {name} is already running for session {session}")]
    AlreadyRunning { session: String, name: String },

    #[error("Unknown custom trigger handler: {0}")]
    UnknownHandler(String),

    #[error("Custom trigger {handler} rejected its params: {reason}")]
    InvalidParams { handler: String, reason: String },

    #[error("Trigger {name} needs a period greater than zero")]
    ZeroPeriod { name: String },
}

/// When a deadline trigger fires.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadlineAt {
    Absolute(DateTime<Utc>),
    After(Duration),
}

impl DeadlineAt {
    fn remaining(&self) -> Duration {
        match self {
            DeadlineAt::Absolute(at) => (*at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            DeadlineAt::After(delay) => *delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerKind {
    /// Fires every `every`, starting one period after it is started.
    Interval { every: Duration, message: String },
    /// Fires once, then removes itself.
    Deadline { at: DeadlineAt, message: String },
    /// Fires for every message arriving in the session's inbox.
    InboxListener,
    /// Polls a registered condition every `poll`.
    Custom {
        handler: String,
        poll: Duration,
        params: serde_json::Value,
    },
}

impl TriggerKind {
    pub fn label(&self) -> &'static str {
        match self {
            TriggerKind::Interval { .. } => "interval",
            TriggerKind::Deadline { .. } => "deadline",
            TriggerKind::InboxListener => "inbox",
            TriggerKind::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    pub name: String,
    pub kind: TriggerKind,
}

impl TriggerSpec {
    pub fn new(name: impl Into<String>, kind: TriggerKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn interval(name: impl Into<String>, every: Duration, message: impl Into<String>) -> Self {
        Self::new(
            name,
            TriggerKind::Interval {
                every,
                message: message.into(),
            },
        )
    }

    pub fn inbox(name: impl Into<String>) -> Self {
        Self::new(name, TriggerKind::InboxListener)
    }
}

/// A user-defined firing condition, polled by a custom trigger.
#[async_trait]
pub trait Condition: Send {
    /// Content for the synthetic input when the condition holds.
    async fn poll(&mut self) -> Option<String>;

    /// True once the condition can never fire again.
    fn exhausted(&self) -> bool {
        false
    }
}

pub type ConditionBuilder =
    Arc<dyn Fn(&serde_json::Value) -> Result<Box<dyn Condition>, String> + Send + Sync>;

/// Named custom trigger handlers.
#[derive(Clone, Default)]
pub struct CustomTriggers {
    builders: HashMap<String, ConditionBuilder>,
}

impl CustomTriggers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `clock` and `file_exists` handlers.
    pub fn with_builtins() -> Self {
        let mut triggers = Self::new();
        triggers.register("clock", |_params| Ok(Box::new(Clock) as Box<dyn Condition>));
        triggers.register("file_exists", |params| {
            let path = params
                .get("path")
                .and_then(|p| p.as_str())
                .filter(|p| !p.is_empty())
                .ok_or_else(|| "missing `path`".to_string())?;
            let message = params
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{path} now exists."));
            Ok(Box::new(FileExists {
                path: PathBuf::from(path),
                message,
                fired: false,
            }) as Box<dyn Condition>)
        });
        triggers
    }

    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn Condition>, String> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Arc::new(builder));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build(&self, name: &str, params: &serde_json::Value) -> Result<Box<dyn Condition>, TriggerError> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| TriggerError::UnknownHandler(name.to_string()))?;
        builder(params).map_err(|reason| TriggerError::InvalidParams {
            handler: name.to_string(),
            reason,
        })
    }
}

/// Always fires with the current time.
struct Clock;

#[async_trait]
impl Condition for Clock {
    async fn poll(&mut self) -> Option<String> {
        Some(format!(
            "Scheduled check: it is now {}. Confirm the current time.",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ))
    }
}

/// Fires once when a path appears.
struct FileExists {
    path: PathBuf,
    message: String,
    fired: bool,
}

#[async_trait]
impl Condition for FileExists {
    async fn poll(&mut self) -> Option<String> {
        if self.fired {
            return None;
        }
        match tokio::fs::try_exists(&self.path).await {
            Ok(true) => {
                self.fired = true;
                Some(self.message.clone())
            }
            Ok(false) => None,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Could not stat watched path");
                None
            }
        }
    }

    fn exhausted(&self) -> bool {
        self.fired
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerStatus {
    pub name: String,
    pub kind: String,
    pub running: bool,
    pub fired: u64,
}

struct RunningTrigger {
    kind: &'static str,
    generation: u64,
    fired: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

type TriggerKey = (String, String);
type TriggerMap = Arc<Mutex<HashMap<TriggerKey, RunningTrigger>>>;

fn lock_triggers(map: &TriggerMap) -> MutexGuard<'_, HashMap<TriggerKey, RunningTrigger>> {
    map.lock().unwrap_or_else(|p| p.into_inner())
}

fn is_running(triggers: &HashMap<TriggerKey, RunningTrigger>, key: &TriggerKey) -> bool {
    triggers.get(key).is_some_and(|t| !t.handle.is_finished())
}

/// Remove a trigger's own entry once it is done, unless it was replaced.
fn retire(map: &TriggerMap, key: &TriggerKey, generation: u64) {
    let mut triggers = lock_triggers(map);
    if triggers.get(key).is_some_and(|t| t.generation == generation) {
        triggers.remove(key);
    }
}

/// Everything a firing task needs.
#[derive(Clone)]
struct Firing {
    dispatcher: Arc<Dispatcher>,
    session_id: String,
    name: String,
    fired: Arc<AtomicU64>,
}

impl Firing {
    /// Queue `input`. False once the session no longer accepts input.
    fn fire(&self, input: Input) -> bool {
        match self.dispatcher.inject(&self.session_id, input) {
            Ok(()) => {
                let count = self.fired.fetch_add(1, Ordering::SeqCst) + 1;
                info!(session = %self.session_id, trigger = %self.name, count, "Trigger fired");
                true
            }
            Err(e) => {
                warn!(session = %self.session_id, trigger = %self.name, error = %e, "Trigger input rejected");
                false
            }
        }
    }
}

pub struct TriggerScheduler {
    dispatcher: Arc<Dispatcher>,
    messenger: Messenger,
    custom: CustomTriggers,
    triggers: TriggerMap,
    generation: AtomicU64,
}

impl TriggerScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, messenger: Messenger, custom: CustomTriggers) -> Self {
        Self {
            dispatcher,
            messenger,
            custom,
            triggers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn custom(&self) -> &CustomTriggers {
        &self.custom
    }

    /// Start `spec` for `session_id` as its own task.
    pub async fn start(&self, session_id: &str, spec: TriggerSpec) -> Result<(), TriggerError> {
        let period = match &spec.kind {
            TriggerKind::Interval { every, .. } => Some(*every),
            TriggerKind::Custom { poll, .. } => Some(*poll),
            _ => None,
        };
        if period.is_some_and(|p| p.is_zero()) {
            return Err(TriggerError::ZeroPeriod { name: spec.name });
        }

        let key = (session_id.to_string(), spec.name.clone());
        let already_running = || TriggerError::AlreadyRunning {
            session: session_id.to_string(),
            name: spec.name.clone(),
        };
        if is_running(&lock_triggers(&self.triggers), &key) {
            return Err(already_running());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let fired = Arc::new(AtomicU64::new(0));
        let firing = Firing {
            dispatcher: self.dispatcher.clone(),
            session_id: session_id.to_string(),
            name: spec.name.clone(),
            fired: fired.clone(),
        };
        let kind = spec.kind.label();
        let triggers = self.triggers.clone();

        let task: BoxFuture<'static, ()> = match spec.kind {
            TriggerKind::Interval { every, message } => run_interval(firing, every, message).boxed(),
            TriggerKind::Deadline { at, message } => {
                let key = key.clone();
                async move {
                    tokio::time::sleep(at.remaining()).await;
                    firing.fire(Input::trigger(&firing.name, message));
                    retire(&triggers, &key, generation);
                }
                .boxed()
            }
            TriggerKind::InboxListener => {
                // Subscribe before returning so no message sent after start
                // is missed.
                let inbox = self.messenger.subscribe(session_id).await;
                run_inbox(firing, inbox).boxed()
            }
            TriggerKind::Custom {
                handler,
                poll,
                params,
            } => {
                let condition = self.custom.build(&handler, &params)?;
                let key = key.clone();
                async move {
                    run_custom(firing, condition, poll).await;
                    retire(&triggers, &key, generation);
                }
                .boxed()
            }
        };

        // Check and claim the slot under one lock, and spawn while holding it
        // so a task that retires at once finds its own entry.
        let previous = {
            let mut running = lock_triggers(&self.triggers);
            if is_running(&running, &key) {
                return Err(already_running());
            }
            running.insert(
                key,
                RunningTrigger {
                    kind,
                    generation,
                    fired,
                    handle: tokio::spawn(task),
                },
            )
        };
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        info!(session = %session_id, trigger = %spec.name, kind, "Trigger started");
        Ok(())
    }

    /// Stop future firings. Input already queued still runs.
    pub fn stop(&self, session_id: &str, name: &str) -> bool {
        let removed = lock_triggers(&self.triggers).remove(&(session_id.to_string(), name.to_string()));
        match removed {
            Some(trigger) => {
                trigger.handle.abort();
                info!(session = %session_id, trigger = %name, "Trigger stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_session(&self, session_id: &str) -> usize {
        let stopped: Vec<RunningTrigger> = {
            let mut triggers = lock_triggers(&self.triggers);
            let keys: Vec<TriggerKey> = triggers
                .keys()
                .filter(|(session, _)| session == session_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| triggers.remove(k)).collect()
        };
        for trigger in &stopped {
            trigger.handle.abort();
        }
        if !stopped.is_empty() {
            info!(session = %session_id, count = stopped.len(), "Session triggers stopped");
        }
        stopped.len()
    }

    pub fn stop_all(&self) {
        let stopped: Vec<RunningTrigger> = lock_triggers(&self.triggers).drain().map(|(_, t)| t).collect();
        for trigger in &stopped {
            trigger.handle.abort();
        }
        debug!(count = stopped.len(), "All triggers stopped");
    }

    /// Triggers currently registered for `session_id`, sorted by name.
    pub fn status(&self, session_id: &str) -> Vec<TriggerStatus> {
        let mut status: Vec<TriggerStatus> = lock_triggers(&self.triggers)
            .iter()
            .filter(|((session, _), _)| session == session_id)
            .map(|((_, name), trigger)| TriggerStatus {
                name: name.clone(),
                kind: trigger.kind.to_string(),
                running: !trigger.handle.is_finished(),
                fired: trigger.fired.load(Ordering::SeqCst),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }
}

impl Drop for TriggerScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn run_interval(firing: Firing, every: Duration, message: String) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !firing.fire(Input::trigger(&firing.name, message.clone())) {
            break;
        }
    }
}

async fn run_inbox(firing: Firing, mut inbox: BoxStream<'static, Message>) {
    while let Some(message) = inbox.next().await {
        if message.to != firing.session_id {
            continue;
        }
        if message.from == firing.session_id {
            debug!(session = %firing.session_id, "Ignoring message from self");
            continue;
        }
        if message.payload.trim().is_empty() {
            debug!(session = %firing.session_id, from = %message.from, "Ignoring empty message");
            continue;
        }
        if !firing.fire(Input::message(message.from, message.payload)) {
            break;
        }
    }
}

async fn run_custom(firing: Firing, mut condition: Box<dyn Condition>, poll: Duration) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Some(content) = condition.poll().await {
            if !firing.fire(Input::trigger(&firing.name, content)) {
                break;
            }
        }
        if condition.exhausted() {
            debug!(session = %firing.session_id, trigger = %firing.name, "Custom trigger exhausted");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use agent_mesh_core::{
        ApprovalEngine, AutoApprove, MemoryStore, Proposal, ReasoningContext, ReasoningEngine,
        ReasoningKernel, RuntimeEventKind, ToolExecutor,
    };

    struct Echo;

    #[async_trait]
    impl ReasoningEngine for Echo {
        async fn propose(&self, context: &ReasoningContext) -> Result<Proposal, agent_mesh_core::Error> {
            let last = context.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(Proposal::final_answer(last))
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolExecutor for NoTools {
        async fn execute(&self, name: &str, _args: &serde_json::Value) -> Result<String, agent_mesh_core::Error> {
            Err(agent_mesh_core::Error::Tool(format!("no tool {name}")))
        }
    }

    fn scheduler() -> (TriggerScheduler, Arc<Dispatcher>, Messenger) {
        let kernel = ReasoningKernel::new(Arc::new(Echo), Arc::new(NoTools), Arc::new(AutoApprove))
            .with_approvals(Arc::new(ApprovalEngine::disabled()));
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(kernel), Arc::new(MemoryStore::new())));
        let messenger = Messenger::new(Arc::new(MemoryBus::new()), "test");
        let scheduler = TriggerScheduler::new(
            dispatcher.clone(),
            messenger.clone(),
            CustomTriggers::with_builtins(),
        );
        (scheduler, dispatcher, messenger)
    }

    fn final_answers(dispatcher: &Dispatcher, session_id: &str) -> Vec<String> {
        dispatcher
            .kernel()
            .events()
            .for_session(session_id)
            .into_iter()
            .filter_map(|e| match e.kind {
                RuntimeEventKind::FinalAnswer { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_fires_until_stopped() {
        let (scheduler, dispatcher, _) = scheduler();
        scheduler
            .start("s1", TriggerSpec::interval("tick", Duration::from_secs(5), "check"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(scheduler.status("s1")[0].fired, 2);

        assert!(scheduler.stop("s1", "tick"));
        assert!(!scheduler.stop("s1", "tick"));
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(scheduler.status("s1").is_empty());
        assert_eq!(final_answers(&dispatcher, "s1"), vec!["[trigger tick] check"; 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_start_rejected() {
        let (scheduler, _, _) = scheduler();
        let spec = TriggerSpec::interval("tick", Duration::from_secs(5), "check");
        scheduler.start("s1", spec.clone()).await.unwrap();
        assert!(matches!(
            scheduler.start("s1", spec.clone()).await,
            Err(TriggerError::AlreadyRunning { .. })
        ));
        // Same name on another session is independent.
        scheduler.start("s2", spec).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_starts_claim_one_slot() {
        let (scheduler, _, _) = scheduler();
        let (a, b) = tokio::join!(
            scheduler.start("sam", TriggerSpec::inbox("inbox")),
            scheduler.start("sam", TriggerSpec::inbox("inbox")),
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(
            a.err().or(b.err()),
            Some(TriggerError::AlreadyRunning { .. })
        ));
        assert_eq!(scheduler.status("sam").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_rejected() {
        let (scheduler, _, _) = scheduler();
        assert!(matches!(
            scheduler
                .start("s1", TriggerSpec::interval("tick", Duration::ZERO, "check"))
                .await,
            Err(TriggerError::ZeroPeriod { .. })
        ));
        let poll_zero = TriggerSpec::new(
            "now",
            TriggerKind::Custom {
                handler: "clock".into(),
                poll: Duration::ZERO,
                params: serde_json::json!({}),
            },
        );
        assert!(matches!(
            scheduler.start("s1", poll_zero).await,
            Err(TriggerError::ZeroPeriod { .. })
        ));
        assert!(scheduler.status("s1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_once_and_removes_itself() {
        let (scheduler, dispatcher, _) = scheduler();
        let spec = TriggerSpec::new(
            "reminder",
            TriggerKind::Deadline {
                at: DeadlineAt::After(Duration::from_secs(60)),
                message: "standup".into(),
            },
        );
        scheduler.start("s1", spec).await.unwrap();
        assert_eq!(scheduler.status("s1").len(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(scheduler.status("s1").is_empty());
        assert_eq!(final_answers(&dispatcher, "s1"), vec!["[trigger reminder] standup"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fires_immediately() {
        let (scheduler, dispatcher, _) = scheduler();
        let spec = TriggerSpec::new(
            "late",
            TriggerKind::Deadline {
                at: DeadlineAt::Absolute(Utc::now() - chrono::Duration::seconds(5)),
                message: "overdue".into(),
            },
        );
        scheduler.start("s1", spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(final_answers(&dispatcher, "s1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbox_ignores_self_and_blank_messages() {
        let (scheduler, dispatcher, messenger) = scheduler();
        scheduler.start("sam", TriggerSpec::inbox("inbox")).await.unwrap();

        messenger.send("sam", "sam", "talking to myself").await.unwrap();
        messenger.send("bill", "sam", "   ").await.unwrap();
        messenger.send("bill", "sam", "ping").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(final_answers(&dispatcher, "sam"), vec!["[from bill] ping"]);
        assert_eq!(scheduler.status("sam")[0].fired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_trigger_runs_registered_condition() {
        struct Countdown(u32);

        #[async_trait]
        impl Condition for Countdown {
            async fn poll(&mut self) -> Option<String> {
                self.0 = self.0.saturating_sub(1);
                (self.0 == 0).then(|| "liftoff".to_string())
            }

            fn exhausted(&self) -> bool {
                self.0 == 0
            }
        }

        let (mut scheduler, dispatcher, _) = scheduler();
        let mut custom = CustomTriggers::new();
        custom.register("countdown", |params| {
            let from = params.get("from").and_then(|v| v.as_u64()).ok_or("missing `from`")?;
            Ok(Box::new(Countdown(from as u32)) as Box<dyn Condition>)
        });
        scheduler.custom = custom;

        let bad = TriggerSpec::new(
            "launch",
            TriggerKind::Custom {
                handler: "countdown".into(),
                poll: Duration::from_secs(1),
                params: serde_json::json!({}),
            },
        );
        assert!(matches!(
            scheduler.start("s1", bad).await,
            Err(TriggerError::InvalidParams { .. })
        ));

        let spec = TriggerSpec::new(
            "launch",
            TriggerKind::Custom {
                handler: "countdown".into(),
                poll: Duration::from_secs(1),
                params: serde_json::json!({"from": 3}),
            },
        );
        scheduler.start("s1", spec).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(final_answers(&dispatcher, "s1"), vec!["[trigger launch] liftoff"]);
        assert!(scheduler.status("s1").is_empty());
    }

    #[test]
    fn test_builtin_handlers() {
        let custom = CustomTriggers::with_builtins();
        assert_eq!(custom.names(), vec!["clock", "file_exists"]);
        assert!(custom.build("file_exists", &serde_json::json!({})).is_err());
        assert!(custom.build("file_exists", &serde_json::json!({"path": "/tmp/x"})).is_ok());
        assert!(matches!(
            custom.build("nope", &serde_json::json!({})),
            Err(TriggerError::UnknownHandler(_))
        ));
    }
}
