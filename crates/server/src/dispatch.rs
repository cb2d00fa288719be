//! Per-session injection queues.
//!
//! Every session gets one worker task that drains its queue in arrival order
//! and runs the kernel for each item, one run at a time. Sessions never share
//! a worker, so a run waiting on approval only holds up its own session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agent_mesh_core::{Input, ReasoningKernel, RunResult, Session, SessionStore};

use crate::Error;

struct Injection {
    input: Input,
    reply: Option<oneshot::Sender<RunResult>>,
}

#[derive(Default)]
struct WorkerState {
    queued: AtomicUsize,
    current: Mutex<Option<CancellationToken>>,
}

impl WorkerState {
    fn current(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct Worker {
    tx: mpsc::UnboundedSender<Injection>,
    state: Arc<WorkerState>,
    closed: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Dispatcher {
    kernel: Arc<ReasoningKernel>,
    store: Arc<dyn SessionStore>,
    workers: Mutex<HashMap<String, Worker>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(kernel: Arc<ReasoningKernel>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            kernel,
            store,
            workers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn kernel(&self) -> &Arc<ReasoningKernel> {
        &self.kernel
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, Worker>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue `input` for `session_id` without waiting for the run.
    pub fn inject(&self, session_id: &str, input: Input) -> Result<(), Error> {
        self.enqueue(session_id, Injection { input, reply: None })
    }

    /// Queue `input` and get a receiver for the result of its run. The
    /// receiver errors if the item is dropped before it runs.
    pub fn submit(&self, session_id: &str, input: Input) -> Result<oneshot::Receiver<RunResult>, Error> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(
            session_id,
            Injection {
                input,
                reply: Some(reply),
            },
        )?;
        Ok(rx)
    }

    fn enqueue(&self, session_id: &str, injection: Injection) -> Result<(), Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::SessionClosed(session_id.to_string()));
        }

        let mut workers = self.workers();
        let worker = workers
            .entry(session_id.to_string())
            .or_insert_with(|| self.spawn_worker(session_id));

        worker.state.queued.fetch_add(1, Ordering::SeqCst);
        if worker.tx.send(injection).is_err() {
            worker.state.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::SessionClosed(session_id.to_string()));
        }
        debug!(
            session = %session_id,
            queued = worker.state.queued.load(Ordering::SeqCst),
            "Input queued"
        );
        Ok(())
    }

    fn spawn_worker(&self, session_id: &str) -> Worker {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(WorkerState::default());
        let closed = self.shutdown.child_token();
        let handle = tokio::spawn(drain(
            self.kernel.clone(),
            self.store.clone(),
            session_id.to_string(),
            rx,
            state.clone(),
            closed.clone(),
        ));
        info!(session = %session_id, "Session worker started");
        Worker {
            tx,
            state,
            closed,
            handle,
        }
    }

    /// Items queued for `session_id` that have not started yet.
    pub fn pending(&self, session_id: &str) -> usize {
        self.workers()
            .get(session_id)
            .map(|w| w.state.queued.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.workers()
            .get(session_id)
            .is_some_and(|w| w.state.current().is_some())
    }

    /// Cancel the run in progress for `session_id`, if any. Queued items
    /// still run afterwards.
    pub fn cancel_run(&self, session_id: &str) -> bool {
        let workers = self.workers();
        let Some(worker) = workers.get(session_id) else {
            return false;
        };
        match worker.state.current().as_ref() {
            Some(token) => {
                info!(session = %session_id, "Cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop the worker for `session_id`. The run in progress is cancelled
    /// and queued items are dropped.
    pub async fn close(&self, session_id: &str) {
        let worker = self.workers().remove(session_id);
        if let Some(worker) = worker {
            worker.closed.cancel();
            drop(worker.tx);
            if let Err(e) = worker.handle.await {
                warn!(session = %session_id, error = %e, "Session worker ended abnormally");
            }
        }
    }

    /// Cancel every session and wait for the workers to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers: Vec<(String, Worker)> = self.workers().drain().collect();
        for (session_id, worker) in workers {
            drop(worker.tx);
            if let Err(e) = worker.handle.await {
                warn!(session = %session_id, error = %e, "Session worker ended abnormally");
            }
        }
        info!("Dispatcher stopped");
    }
}

async fn load_session(store: &dyn SessionStore, session_id: &str) -> Session {
    match store.load(session_id).await {
        Ok(Some(history)) => {
            debug!(session = %session_id, entries = history.len(), "Loaded session history");
            Session::with_history(session_id, history)
        }
        Ok(None) => Session::new(session_id),
        Err(e) => {
            warn!(session = %session_id, error = %e, "Could not load history, starting empty");
            Session::new(session_id)
        }
    }
}

async fn drain(
    kernel: Arc<ReasoningKernel>,
    store: Arc<dyn SessionStore>,
    session_id: String,
    mut rx: mpsc::UnboundedReceiver<Injection>,
    state: Arc<WorkerState>,
    closed: CancellationToken,
) {
    let mut session = load_session(store.as_ref(), &session_id).await;

    loop {
        let injection = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = rx.recv() => match next {
                Some(injection) => injection,
                None => break,
            },
        };
        state.queued.fetch_sub(1, Ordering::SeqCst);

        let cancel = closed.child_token();
        *state.current() = Some(cancel.clone());
        let result = kernel.run(&mut session, injection.input, &cancel).await;
        state.current().take();

        if let Err(e) = store.save(&session_id, &session.history).await {
            warn!(session = %session_id, error = %e, "Could not save history");
        }
        if let Some(reply) = injection.reply {
            // The caller may have stopped waiting.
            let _ = reply.send(result);
        }
    }

    let dropped = state.queued.swap(0, Ordering::SeqCst);
    if dropped > 0 {
        warn!(session = %session_id, dropped, "Session closed with queued input");
    }
    debug!(session = %session_id, "Session worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use async_trait::async_trait;
    use agent_mesh_core::{
        ApprovalEngine, AutoApprove, CancelCause, MemoryStore, Proposal, ReasoningContext, ReasoningEngine,
        RunStatus, ToolExecutor,
    };

    /// Answers after a delay and fails if two proposals overlap.
    struct SlowEngine {
        busy: AtomicBool,
        overlapped: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl ReasoningEngine for SlowEngine {
        async fn propose(&self, context: &ReasoningContext) -> Result<Proposal, agent_mesh_core::Error> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(self.delay).await;
            self.busy.store(false, Ordering::SeqCst);
            let last = context.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(Proposal::final_answer(format!("done: {last}")))
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolExecutor for NoTools {
        async fn execute(&self, name: &str, _args: &serde_json::Value) -> Result<String, agent_mesh_core::Error> {
            Err(agent_mesh_core::Error::Tool(format!("no tool {name}")))
        }
    }

    fn dispatcher(delay: Duration) -> (Dispatcher, Arc<SlowEngine>, Arc<MemoryStore>) {
        let engine = Arc::new(SlowEngine {
            busy: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            delay,
        });
        let kernel = ReasoningKernel::new(engine.clone(), Arc::new(NoTools), Arc::new(AutoApprove))
            .with_approvals(Arc::new(ApprovalEngine::disabled()));
        let store = Arc::new(MemoryStore::new());
        (Dispatcher::new(Arc::new(kernel), store.clone()), engine, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_are_serialized_in_fifo_order() {
        let (dispatcher, engine, store) = dispatcher(Duration::from_secs(1));

        let first = dispatcher.submit("s1", Input::user("one")).unwrap();
        let second = dispatcher.submit("s1", Input::user("two")).unwrap();
        let third = dispatcher.submit("s1", Input::user("three")).unwrap();

        let results = [first.await.unwrap(), second.await.unwrap(), third.await.unwrap()];
        for (result, expected) in results.iter().zip(["one", "two", "three"]) {
            assert_eq!(result.status, RunStatus::Done);
            assert!(result.final_answer.as_deref().unwrap().ends_with(expected));
        }
        assert!(!engine.overlapped.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pending("s1"), 0);

        let history = store.load("s1").await.unwrap().unwrap();
        assert_eq!(history.iter().filter(|e| e.is_final_answer()).count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_run_independently() {
        let (dispatcher, _, _) = dispatcher(Duration::from_secs(1));
        let a = dispatcher.submit("a", Input::user("x")).unwrap();
        let b = dispatcher.submit("b", Input::user("y")).unwrap();
        assert_eq!(a.await.unwrap().session_id, "a");
        assert_eq!(b.await.unwrap().session_id, "b");
        assert_eq!(dispatcher.sessions(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_run_keeps_queue() {
        let (dispatcher, _, _) = dispatcher(Duration::from_secs(10));
        let first = dispatcher.submit("s1", Input::user("one")).unwrap();
        let second = dispatcher.submit("s1", Input::user("two")).unwrap();

        // Let the first run reach the engine.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(dispatcher.is_running("s1"));
        assert_eq!(dispatcher.pending("s1"), 1);

        assert!(dispatcher.cancel_run("s1"));
        assert_eq!(
            first.await.unwrap().status,
            RunStatus::Cancelled(CancelCause::Signal)
        );
        assert_eq!(second.await.unwrap().status, RunStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_new_input() {
        let (dispatcher, _, _) = dispatcher(Duration::from_millis(1));
        dispatcher.submit("s1", Input::user("one")).unwrap().await.unwrap();

        dispatcher.shutdown().await;
        assert!(matches!(
            dispatcher.inject("s1", Input::user("late")),
            Err(Error::SessionClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_queued_items() {
        let (dispatcher, _, _) = dispatcher(Duration::from_secs(10));
        let _running = dispatcher.submit("s1", Input::user("one")).unwrap();
        let queued = dispatcher.submit("s1", Input::user("two")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        dispatcher.close("s1").await;
        assert!(queued.await.is_err());
        assert!(dispatcher.sessions().is_empty());
    }
}
