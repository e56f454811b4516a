//! `system_*` actions answered by the orchestrator itself

use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::error::AgentError;
use crate::orchestrator::Orchestrator;
use crate::types::{Message, Response};

pub const SYSTEM_STATUS: &str = "system_status";
pub const SYSTEM_AGENTS: &str = "system_agents";
pub const SYSTEM_SHUTDOWN: &str = "system_shutdown";

/// Every system action the orchestrator understands
pub const SYSTEM_ACTIONS: &[&str] = &[SYSTEM_STATUS, SYSTEM_AGENTS, SYSTEM_SHUTDOWN];

impl Orchestrator {
    pub(crate) async fn handle_system(&self, message: &Message) -> Result<Response, AgentError> {
        match message.action() {
            SYSTEM_STATUS => Ok(self.system_status(message).await),
            SYSTEM_AGENTS => Ok(self.system_agents(message).await),
            SYSTEM_SHUTDOWN => Ok(self.system_shutdown(message).await),
            other => Err(AgentError::routing(format!(
                "Unknown system action: {}. Expected one of {:?}",
                other, SYSTEM_ACTIONS
            ))),
        }
    }

    async fn system_status(&self, message: &Message) -> Response {
        let (state, started_at) = {
            let inner = self.inner.read().await;
            (inner.state, inner.started_at)
        };
        let agents = self.list_agents().await;
        let uptime_secs = started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0))
            .unwrap_or(0);

        message.reply(json!({
            "orchestrator": {
                "name": self.name(),
                "version": env!("CARGO_PKG_VERSION"),
                "state": state,
                "in_flight": self.in_flight(),
                "started_at": started_at,
                "uptime_secs": uptime_secs,
            },
            "total_agents": agents.len(),
            "agents": agents,
        }))
    }

    async fn system_agents(&self, message: &Message) -> Response {
        let agents = self.list_agents().await;
        message.reply(json!({
            "count": agents.len(),
            "agents": agents,
        }))
    }

    async fn system_shutdown(&self, message: &Message) -> Response {
        info!(
            correlation_id = %message.correlation_id(),
            sender = message.sender().unwrap_or("unknown"),
            "Shutdown requested via {}", SYSTEM_SHUTDOWN
        );
        let initiated = self.request_shutdown().await;
        message.reply(json!({
            "shutdown": true,
            "initiated": initiated,
        }))
    }
}
