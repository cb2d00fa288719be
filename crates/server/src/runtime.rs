//! Process wiring.
//!
//! A [`Runtime`] owns the bus handle, the session registry, the dispatcher and
//! the trigger scheduler for one process, and tears them down in order.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use agent_mesh_core::{
    EventBus, Input, InteractionHandler, ReasoningEngine, ReasoningKernel, RunResult,
    SessionStore, ToolExecutor,
};

use crate::Error;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::messaging::Messenger;
use crate::registry::SessionRegistry;
use crate::trigger::{CustomTriggers, TriggerScheduler};

/// The pluggable pieces a runtime drives.
pub struct Collaborators {
    pub engine: Arc<dyn ReasoningEngine>,
    pub tools: Arc<dyn ToolExecutor>,
    pub handler: Arc<dyn InteractionHandler>,
    pub store: Arc<dyn SessionStore>,
}

pub struct Runtime {
    config: Config,
    bus: Arc<dyn MessageBus>,
    messenger: Messenger,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    triggers: TriggerScheduler,
    open: Mutex<BTreeSet<String>>,
}

impl Runtime {
    pub async fn start(
        config: Config,
        bus: Arc<dyn MessageBus>,
        collaborators: Collaborators,
        custom: CustomTriggers,
    ) -> Result<Self, Error> {
        config.validate(&custom)?;

        let prefix = config.redis.prefix.clone();
        let messenger = Messenger::new(bus.clone(), prefix.clone());
        let registry = Arc::new(SessionRegistry::new(bus.clone(), prefix));
        registry.start().await;

        let kernel = ReasoningKernel::new(
            collaborators.engine,
            collaborators.tools,
            collaborators.handler,
        )
        .with_config(config.kernel_config())
        .with_approvals(Arc::new(config.approval_engine()))
        .with_events(EventBus::new())
        .with_outbox(Arc::new(messenger.clone()))
        .with_peers(registry.clone());

        let dispatcher = Arc::new(Dispatcher::new(Arc::new(kernel), collaborators.store));
        let triggers = TriggerScheduler::new(dispatcher.clone(), messenger.clone(), custom);

        info!(
            prefix = %config.redis.prefix,
            triggers = config.triggers.len(),
            "Runtime started"
        );
        Ok(Self {
            config,
            bus,
            messenger,
            registry,
            dispatcher,
            triggers,
            open: Mutex::new(BTreeSet::new()),
        })
    }

    fn open(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.open.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Announce `session_id` and start its configured triggers. Opening a
    /// session that is already open does nothing.
    pub async fn open_session(
        &self,
        session_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        let specs = self.config.trigger_specs(self.triggers.custom())?;
        if !self.open().insert(session_id.to_string()) {
            debug!(session = %session_id, "Session already open");
            return Ok(());
        }

        self.registry
            .announce(session_id, self.config.presence.ttl_secs, metadata)
            .await;
        let mut started: Vec<String> = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = spec.name.clone();
            if let Err(e) = self.triggers.start(session_id, spec).await {
                for name in &started {
                    self.triggers.stop(session_id, name);
                }
                self.registry.withdraw(session_id).await;
                self.open().remove(session_id);
                return Err(e.into());
            }
            started.push(name);
        }
        info!(session = %session_id, "Session opened");
        Ok(())
    }

    /// Queue `input` and wait for the run it starts.
    pub async fn ask(&self, session_id: &str, input: Input) -> Result<RunResult, Error> {
        let result = self.dispatcher.submit(session_id, input)?;
        result
            .await
            .map_err(|_| Error::RunDropped(session_id.to_string()))
    }

    /// Queue `input` without waiting.
    pub fn inject(&self, session_id: &str, input: Input) -> Result<(), Error> {
        self.dispatcher.inject(session_id, input)
    }

    /// Withdraw `session_id`, stop its triggers and end its worker.
    pub async fn close_session(&self, session_id: &str) {
        self.open().remove(session_id);
        self.registry.withdraw(session_id).await;
        self.triggers.stop_session(session_id);
        self.dispatcher.close(session_id).await;
        info!(session = %session_id, "Session closed");
    }

    pub fn sessions(&self) -> Vec<String> {
        self.open().iter().cloned().collect()
    }

    /// Sessions visible anywhere on the bus, this process included.
    pub fn list_active(&self) -> Vec<String> {
        self.registry.list_active()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        self.dispatcher.kernel().events()
    }

    pub fn kernel(&self) -> &ReasoningKernel {
        self.dispatcher.kernel()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn triggers(&self) -> &TriggerScheduler {
        &self.triggers
    }

    /// Withdraw presence, stop triggers, finish runs, then let go of the bus.
    pub async fn shutdown(self) {
        info!(sessions = self.open().len(), "Shutting down runtime");
        self.registry.shutdown().await;
        self.triggers.stop_all();
        self.dispatcher.shutdown().await;

        let Runtime {
            bus,
            messenger,
            registry,
            dispatcher,
            triggers,
            ..
        } = self;
        drop(triggers);
        drop(dispatcher);
        drop(registry);
        drop(messenger);
        drop(bus);
        info!("Runtime stopped");
    }
}
