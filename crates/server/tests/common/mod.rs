#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use agent_mesh_core::{
    Error, InteractionHandler, MemoryStore, Proposal, ReasoningContext, ReasoningEngine,
    RuntimeEvent, RuntimeEventKind, ToolExecutor,
};
use agent_mesh_server::{Collaborators, Config, CustomTriggers, MemoryBus, Runtime};

pub fn last_message(context: &ReasoningContext) -> String {
    context
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// Engine driven by a plain function of the context.
pub struct FnEngine<F>(pub F);

#[async_trait]
impl<F> ReasoningEngine for FnEngine<F>
where
    F: Fn(&ReasoningContext) -> Proposal + Send + Sync,
{
    async fn propose(&self, context: &ReasoningContext) -> Result<Proposal, Error> {
        Ok((self.0)(context))
    }
}

/// Takes `delay` per proposal, echoes the last message as a final answer and
/// remembers whether two proposals ever overlapped.
pub struct SlowEngine {
    delay: Duration,
    busy: AtomicBool,
    overlapped: AtomicBool,
    seen: Mutex<Vec<String>>,
}

impl SlowEngine {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            busy: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningEngine for SlowEngine {
    async fn propose(&self, context: &ReasoningContext) -> Result<Proposal, Error> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let last = last_message(context);
        self.seen.lock().unwrap().push(last.clone());
        tokio::time::sleep(self.delay).await;
        self.busy.store(false, Ordering::SeqCst);
        Ok(Proposal::final_answer(format!("handled: {last}")))
    }
}

#[derive(Default)]
pub struct RecordingTools {
    calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingTools {
    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for RecordingTools {
    async fn execute(&self, name: &str, args: &serde_json::Value) -> Result<String, Error> {
        self.calls.lock().unwrap().push((name.to_string(), args.clone()));
        Ok(format!("{name} ok"))
    }
}

pub struct Harness {
    pub runtime: Runtime,
    pub tools: Arc<RecordingTools>,
    pub store: Arc<MemoryStore>,
}

pub async fn start(
    bus: &MemoryBus,
    config: &str,
    engine: Arc<dyn ReasoningEngine>,
    handler: Arc<dyn InteractionHandler>,
) -> Harness {
    let custom = CustomTriggers::with_builtins();
    let config = Config::parse(config, &custom).unwrap();
    let tools = Arc::new(RecordingTools::default());
    let store = Arc::new(MemoryStore::new());
    let runtime = Runtime::start(
        config,
        Arc::new(bus.clone()),
        Collaborators {
            engine,
            tools: tools.clone(),
            handler,
            store: store.clone(),
        },
        custom,
    )
    .await
    .unwrap();
    Harness {
        runtime,
        tools,
        store,
    }
}

/// `(started, finished)` counts, asserting runs never interleave.
pub fn run_boundaries(events: &[RuntimeEvent]) -> (usize, usize) {
    let mut open = false;
    let (mut started, mut finished) = (0, 0);
    for event in events {
        match &event.kind {
            RuntimeEventKind::RunStarted { .. } => {
                assert!(!open, "run started while another was active");
                open = true;
                started += 1;
            }
            RuntimeEventKind::RunFinished { .. } => {
                assert!(open, "run finished without starting");
                open = false;
                finished += 1;
            }
            _ => {}
        }
    }
    (started, finished)
}
