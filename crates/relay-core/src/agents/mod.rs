//! Agent capabilities and the prefix registry that routes to them
//!
//! Every handler (business logic, storage, console UI) implements [`Agent`].
//! The orchestrator treats all of them identically: it only knows the
//! prefixes an agent claims and how to hand it a [`Message`].

pub mod registry;

pub use registry::AgentRegistry;

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{AgentInfo, AgentStatus, Message, Response};

/// Contract every routed handler implements
#[async_trait]
pub trait Agent: Send + Sync {
    /// Unique, human-readable name
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    /// Routing keys this agent claims (the part of an action before `_`)
    fn prefixes(&self) -> Vec<String>;

    /// Full action names this agent understands, for introspection only
    fn supported_actions(&self) -> Vec<String> {
        Vec::new()
    }

    fn describe(&self) -> AgentInfo {
        AgentInfo {
            name: self.name().to_string(),
            version: self.version().to_string(),
            prefixes: self.prefixes().into_iter().collect::<BTreeSet<_>>(),
            supported_actions: self.supported_actions(),
            status: AgentStatus::Registered,
        }
    }

    /// Called once by `Orchestrator::startup`
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Called once by `Orchestrator::shutdown` after in-flight work drained
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Handle one message.
    ///
    /// Expected failures should either be turned into an error [`Response`]
    /// or returned as an [`crate::AgentError`]. Any other error is reported to
    /// the caller as a generic `InternalError`. `cancel` fires when the caller
    /// stops waiting; honouring it is optional.
    async fn handle(&self, message: &Message, cancel: &CancellationToken) -> Result<Response>;
}
