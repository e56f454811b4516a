//! Orchestrator: the single dispatch entry point
//!
//! Owns the agent registry and the lifecycle state machine
//! (`Created → Active → Draining → Stopped`). Every dispatch is an independent
//! task tracked so that shutdown can wait for in-flight work.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::agents::registry::SYSTEM_PREFIX;
use crate::agents::{Agent, AgentRegistry};
use crate::error::AgentError;
use crate::types::{AgentInfo, AgentStatus, Message, RawMessage, Response};

/// Generic text returned for failures that were not classified by the agent
pub(crate) const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred while handling the request";

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub name: String,
    pub dispatch_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: "orchestrator".to_string(),
            dispatch_timeout_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

impl OrchestratorConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Lifecycle state of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Created,
    Active,
    Draining,
    Stopped,
}

impl OrchestratorState {
    /// Status reported for registered agents while in this state
    pub fn agent_status(self) -> AgentStatus {
        match self {
            Self::Created => AgentStatus::Registered,
            Self::Active => AgentStatus::Active,
            Self::Draining => AgentStatus::ShuttingDown,
            Self::Stopped => AgentStatus::Stopped,
        }
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Per-call dispatch settings
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Overrides `dispatch_timeout_secs` for this call
    pub timeout: Option<Duration>,
    /// Fires when the caller stops waiting
    pub cancel: Option<CancellationToken>,
}

impl DispatchOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Outcome of [`Orchestrator::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// All in-flight dispatches finished within the grace period
    pub drained: bool,
    /// Agent tasks still running when the grace period ran out
    pub abandoned: usize,
}

pub(crate) struct Inner {
    pub(crate) state: OrchestratorState,
    pub(crate) registry: AgentRegistry,
    pub(crate) started_at: Option<DateTime<Utc>>,
}

/// Routes messages to agents by action prefix
pub struct Orchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) inner: RwLock<Inner>,
    /// Serializes register/startup/shutdown against each other
    lifecycle: Mutex<()>,
    pub(crate) tracker: TaskTracker,
    pub(crate) shutdown_signal: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        info!(
            "Orchestrator '{}': created (dispatch timeout {}s, shutdown grace {}s)",
            config.name, config.dispatch_timeout_secs, config.shutdown_grace_secs
        );
        Self {
            config,
            inner: RwLock::new(Inner {
                state: OrchestratorState::Created,
                registry: AgentRegistry::new(),
                started_at: None,
            }),
            lifecycle: Mutex::new(()),
            tracker: TaskTracker::new(),
            shutdown_signal: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Weak handle agents use to dispatch follow-up messages
    pub fn handle(self: &Arc<Self>) -> DispatchHandle {
        DispatchHandle {
            orchestrator: Arc::downgrade(self),
        }
    }

    pub async fn state(&self) -> OrchestratorState {
        self.inner.read().await.state
    }

    /// Number of agent invocations currently running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Token cancelled once shutdown has been requested (by `system_shutdown`
    /// or [`Orchestrator::shutdown`])
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown_signal.clone()
    }

    /// Register an agent. Only allowed before startup.
    pub async fn register(&self, agent: Arc<dyn Agent>) -> Result<(), AgentError> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut inner = self.inner.write().await;
        if inner.state != OrchestratorState::Created {
            return Err(AgentError::conflict(format!(
                "Cannot register agent '{}': registry is frozen once the orchestrator has started (state: {})",
                agent.name(),
                inner.state
            )));
        }
        inner.registry.register(agent)
    }

    /// Remove an agent. Not allowed while the orchestrator is active.
    pub async fn unregister(&self, agent: &Arc<dyn Agent>) -> Result<bool, AgentError> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut inner = self.inner.write().await;
        if inner.state == OrchestratorState::Active {
            return Err(AgentError::conflict(format!(
                "Cannot unregister agent '{}' while the orchestrator is active",
                agent.name()
            )));
        }
        Ok(inner.registry.unregister(agent))
    }

    /// Registered agents with their lifecycle status
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let inner = self.inner.read().await;
        let status = inner.state.agent_status();
        inner
            .registry
            .list()
            .into_iter()
            .map(|mut info| {
                info.status = status;
                info
            })
            .collect()
    }

    /// Validate the registry, start every agent and begin accepting dispatches
    pub async fn startup(&self) -> Result<(), AgentError> {
        let _lifecycle = self.lifecycle.lock().await;

        let agents: Vec<Arc<dyn Agent>> = {
            let inner = self.inner.read().await;
            if inner.state != OrchestratorState::Created {
                return Err(AgentError::internal(format!(
                    "Cannot start orchestrator '{}' from state {}",
                    self.config.name, inner.state
                )));
            }
            inner.registry.validate().map_err(|e| {
                error!("Orchestrator '{}': registry validation failed: {}", self.config.name, e);
                AgentError::internal(format!("Agent registry is inconsistent: {}", e))
            })?;
            inner.registry.agents().cloned().collect()
        };

        let mut started: Vec<Arc<dyn Agent>> = Vec::with_capacity(agents.len());
        for agent in agents {
            if let Err(e) = agent.start().await {
                error!("Orchestrator: agent '{}' failed to start: {:#}", agent.name(), e);
                for running in started.iter().rev() {
                    if let Err(e) = running.stop().await {
                        warn!("Orchestrator: agent '{}' failed to stop: {:#}", running.name(), e);
                    }
                }
                return Err(AgentError::internal(format!(
                    "Agent '{}' failed to start",
                    agent.name()
                )));
            }
            debug!("Orchestrator: started agent '{}'", agent.name());
            started.push(agent);
        }

        let mut inner = self.inner.write().await;
        inner.state = OrchestratorState::Active;
        inner.started_at = Some(Utc::now());
        info!(
            "Orchestrator '{}': active with {} agents",
            self.config.name,
            started.len()
        );
        Ok(())
    }

    /// Mark the orchestrator as draining and fire the shutdown signal.
    /// Returns false if it was not active.
    pub(crate) async fn request_shutdown(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.state != OrchestratorState::Active {
            return false;
        }
        inner.state = OrchestratorState::Draining;
        drop(inner);
        info!("Orchestrator '{}': shutdown requested, draining", self.config.name);
        self.shutdown_signal.cancel();
        true
    }

    /// Stop accepting dispatches, wait for in-flight work up to the grace
    /// period, stop every agent, and transition to `Stopped`.
    pub async fn shutdown(&self) -> ShutdownReport {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = {
            let mut inner = self.inner.write().await;
            let previous = inner.state;
            match previous {
                OrchestratorState::Stopped => {
                    return ShutdownReport { drained: true, abandoned: 0 };
                }
                OrchestratorState::Created => {
                    inner.state = OrchestratorState::Stopped;
                    drop(inner);
                    self.shutdown_signal.cancel();
                    self.tracker.close();
                    info!("Orchestrator '{}': stopped before startup", self.config.name);
                    return ShutdownReport { drained: true, abandoned: 0 };
                }
                OrchestratorState::Active | OrchestratorState::Draining => {
                    inner.state = OrchestratorState::Draining;
                }
            }
            previous
        };
        self.shutdown_signal.cancel();
        self.tracker.close();

        let grace = self.config.shutdown_grace();
        info!(
            "Orchestrator '{}': draining {} in-flight dispatches (was {}, grace {:?})",
            self.config.name,
            self.tracker.len(),
            previous,
            grace
        );
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        let abandoned = if drained { 0 } else { self.tracker.len() };
        if !drained {
            warn!(
                "Orchestrator '{}': grace period expired with {} dispatches still running",
                self.config.name, abandoned
            );
        }

        let agents: Vec<Arc<dyn Agent>> = self.inner.read().await.registry.agents().cloned().collect();
        for agent in agents.iter().rev() {
            if let Err(e) = agent.stop().await {
                warn!("Orchestrator: agent '{}' failed to stop: {:#}", agent.name(), e);
            }
        }

        self.inner.write().await.state = OrchestratorState::Stopped;
        info!("Orchestrator '{}': stopped", self.config.name);
        ShutdownReport { drained, abandoned }
    }

    /// Start up, run `f`, and shut down again on every exit path
    pub async fn run_scoped<F, Fut, T>(self: &Arc<Self>, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.startup().await?;
        let result = f(self.clone()).await;
        let report = self.shutdown().await;
        if !report.drained {
            warn!(
                "Orchestrator '{}': scope ended with {} abandoned dispatches",
                self.config.name, report.abandoned
            );
        }
        result
    }

    /// Validate untrusted input, then dispatch it
    pub async fn dispatch_raw(&self, raw: RawMessage) -> Response {
        let supplied = raw.correlation_id.clone();
        match Message::try_from(raw) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                let correlation_id = supplied
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                warn!(correlation_id = %correlation_id, "Rejected invalid message: {}", e);
                Response::error(correlation_id, &e)
            }
        }
    }

    /// Dispatch with the configured timeout and no external cancellation
    pub async fn dispatch(&self, message: Message) -> Response {
        self.dispatch_with(message, DispatchOptions::default()).await
    }

    /// Route a message to its agent and normalize whatever happens into a
    /// [`Response`] carrying the message's correlation id
    pub async fn dispatch_with(&self, message: Message, options: DispatchOptions) -> Response {
        let correlation_id = message.correlation_id().to_string();
        let span = info_span!(
            "dispatch",
            correlation_id = %correlation_id,
            action = %message.action()
        );

        async move {
            debug!("Dispatching '{}'", message.action());
            let (handled_by, outcome) = self.route(message, options).await;
            let mut response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    debug!("Dispatch failed: {}", e);
                    Response::error(correlation_id.clone(), &e)
                }
            };
            if let Some(name) = &handled_by {
                response.set_handled_by(name);
            }

            if response.correlation_id() != correlation_id {
                warn!(
                    "Agent {} returned correlation id '{}', restoring '{}'",
                    response.handled_by().unwrap_or("(unknown)"),
                    response.correlation_id(),
                    correlation_id
                );
                response.set_correlation_id(&correlation_id);
            }
            debug!(success = response.is_success(), "Dispatch complete");
            response
        }
        .instrument(span)
        .await
    }

    /// Returns the name of whoever handled the message alongside the outcome.
    /// The name is None when the message never reached a handler.
    async fn route(
        &self,
        message: Message,
        options: DispatchOptions,
    ) -> (Option<String>, Result<Response, AgentError>) {
        let correlation_id = message.correlation_id().to_string();
        let caller = options.cancel.unwrap_or_default();
        // Cancelled only after this dispatch has stopped waiting
        let agent_token = CancellationToken::new();

        let (agent, mut handle) = match self.admit(message, &agent_token).await {
            Ok(Target::Agent(agent, handle)) => (agent, handle),
            Ok(Target::System(outcome)) => return (Some(self.config.name.clone()), outcome),
            Err(e) => return (None, Err(e)),
        };

        let timeout = options.timeout.unwrap_or_else(|| self.config.dispatch_timeout());
        let outcome = tokio::select! {
            biased;
            joined = &mut handle => match joined {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(classify_failure(e, agent.name(), &correlation_id)),
                Err(join_err) => {
                    error!(
                        correlation_id = %correlation_id,
                        "Agent '{}' task failed: {}", agent.name(), join_err
                    );
                    Err(AgentError::internal(INTERNAL_ERROR_MESSAGE))
                }
            },
            _ = caller.cancelled() => {
                agent_token.cancel();
                info!("Caller cancelled dispatch to agent '{}'", agent.name());
                Err(AgentError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                agent_token.cancel();
                warn!("Agent '{}' did not respond within {:?}", agent.name(), timeout);
                Err(AgentError::Timeout(format!(
                    "Agent '{}' did not respond within {}s",
                    agent.name(),
                    timeout.as_secs_f64()
                )))
            }
        };
        (Some(agent.name().to_string()), outcome)
    }

    /// Check the lifecycle state and either answer a system action or start
    /// the owning agent on the tracker
    async fn admit(&self, message: Message, agent_token: &CancellationToken) -> Result<Target, AgentError> {
        let inner = self.inner.read().await;
        match inner.state {
            OrchestratorState::Active => {}
            OrchestratorState::Created => {
                return Err(AgentError::routing(format!(
                    "Orchestrator '{}' has not been started",
                    self.config.name
                )));
            }
            OrchestratorState::Draining | OrchestratorState::Stopped => {
                return Err(AgentError::ShuttingDown);
            }
        }

        if message.prefix() == SYSTEM_PREFIX {
            drop(inner);
            return Ok(Target::System(self.handle_system(&message).await));
        }

        let agent = inner.registry.resolve(message.prefix())?;

        // Spawned while the read guard is held so shutdown cannot slip
        // between the state check and the tracker registration
        let task_agent = agent.clone();
        let token = agent_token.clone();
        let handle = self
            .tracker
            .spawn(async move { task_agent.handle(&message, &token).await }.in_current_span());
        Ok(Target::Agent(agent, handle))
    }
}

enum Target {
    System(Result<Response, AgentError>),
    Agent(Arc<dyn Agent>, JoinHandle<anyhow::Result<Response>>),
}

/// Keep typed agent errors, demote everything else to a generic internal error
fn classify_failure(err: anyhow::Error, agent: &str, correlation_id: &str) -> AgentError {
    match err.downcast::<AgentError>() {
        Ok(typed) => {
            debug!("Agent '{}' reported {}: {}", agent, typed.kind(), typed);
            typed
        }
        Err(raw) => {
            error!(
                agent = agent,
                correlation_id = %correlation_id,
                "Unclassified agent failure: {:#}", raw
            );
            AgentError::internal(INTERNAL_ERROR_MESSAGE)
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.try_read() {
            if inner.state == OrchestratorState::Active {
                warn!(
                    "Orchestrator '{}' dropped while active; call shutdown() first",
                    self.config.name
                );
            }
        }
    }
}

/// Cloneable, non-owning handle for dispatching through an orchestrator.
///
/// Agents use this to reach other agents; they never hold direct references
/// to each other.
#[derive(Clone)]
pub struct DispatchHandle {
    orchestrator: Weak<Orchestrator>,
}

impl DispatchHandle {
    pub async fn dispatch(&self, message: Message) -> Response {
        self.dispatch_with(message, DispatchOptions::default()).await
    }

    pub async fn dispatch_with(&self, message: Message, options: DispatchOptions) -> Response {
        match self.orchestrator.upgrade() {
            Some(orchestrator) => orchestrator.dispatch_with(message, options).await,
            None => message.reply_error(&AgentError::routing("Orchestrator is no longer available")),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.orchestrator.strong_count() > 0
    }
}

impl std::fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("connected", &self.is_connected())
            .finish()
    }
}
