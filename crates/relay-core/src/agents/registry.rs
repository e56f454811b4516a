//! Agent registry: maps action prefixes to exactly one agent

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::Agent;
use crate::error::AgentError;
use crate::types::{ACTION_SEPARATOR, AgentInfo};

/// Prefix reserved for actions the orchestrator answers itself
pub const SYSTEM_PREFIX: &str = "system";

/// Flat table of agents plus a prefix index into it
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<dyn Agent>>,
    routes: HashMap<String, usize>,
}

fn same_agent(a: &Arc<dyn Agent>, b: &Arc<dyn Agent>) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn validate_prefix(agent: &str, prefix: &str) -> Result<(), AgentError> {
    if prefix.is_empty() {
        return Err(AgentError::invalid_field(
            "prefixes",
            format!("Agent '{}' claims an empty prefix", agent),
        ));
    }
    if prefix.contains(ACTION_SEPARATOR) {
        return Err(AgentError::invalid_field(
            "prefixes",
            format!(
                "Agent '{}' prefix '{}' must not contain '{}'",
                agent, prefix, ACTION_SEPARATOR
            ),
        ));
    }
    if prefix == SYSTEM_PREFIX {
        return Err(AgentError::conflict(format!(
            "Prefix '{}' is reserved for the orchestrator (claimed by '{}')",
            SYSTEM_PREFIX, agent
        )));
    }
    Ok(())
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of(&self, agent: &Arc<dyn Agent>) -> Option<usize> {
        self.agents.iter().position(|a| same_agent(a, agent))
    }

    /// Register an agent under all of its prefixes.
    ///
    /// Fails without modifying the table if any prefix is invalid or already
    /// owned by a different agent. Re-registering the same agent is a no-op.
    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<(), AgentError> {
        let name = agent.name().to_string();
        let prefixes = agent.prefixes();
        if prefixes.is_empty() {
            return Err(AgentError::invalid_field(
                "prefixes",
                format!("Agent '{}' claims no prefixes", name),
            ));
        }

        let existing = self.index_of(&agent);
        for prefix in &prefixes {
            validate_prefix(&name, prefix)?;
            if let Some(&idx) = self.routes.get(prefix) {
                if Some(idx) != existing {
                    let owner = self.agents[idx].name();
                    warn!(
                        "AgentRegistry: prefix '{}' conflict: '{}' already owns it, '{}' rejected",
                        prefix, owner, name
                    );
                    return Err(AgentError::conflict(format!(
                        "Prefix '{}' is already registered to agent '{}'",
                        prefix, owner
                    )));
                }
            }
        }

        let idx = match existing {
            Some(idx) => {
                debug!("AgentRegistry: agent '{}' already registered", name);
                idx
            }
            None => {
                self.agents.push(agent);
                self.agents.len() - 1
            }
        };
        for prefix in prefixes {
            self.routes.insert(prefix, idx);
        }

        info!(
            "AgentRegistry: registered agent '{}' ({} agents, {} prefixes)",
            name,
            self.agents.len(),
            self.routes.len()
        );
        Ok(())
    }

    /// Find the agent owning `prefix`
    pub fn resolve(&self, prefix: &str) -> Result<Arc<dyn Agent>, AgentError> {
        self.routes
            .get(prefix)
            .map(|&idx| self.agents[idx].clone())
            .ok_or_else(|| AgentError::routing(format!("No agent for prefix '{}'", prefix)))
    }

    /// Remove an agent and all of its prefixes. Returns false if it was unknown.
    pub fn unregister(&mut self, agent: &Arc<dyn Agent>) -> bool {
        let Some(idx) = self.index_of(agent) else {
            return false;
        };
        self.agents.remove(idx);
        self.routes.retain(|_, i| *i != idx);
        for i in self.routes.values_mut() {
            if *i > idx {
                *i -= 1;
            }
        }
        info!("AgentRegistry: unregistered agent '{}'", agent.name());
        true
    }

    /// Check that every prefix points at a live agent that still claims it
    pub fn validate(&self) -> Result<(), AgentError> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        for agent in &self.agents {
            for prefix in agent.prefixes() {
                if let Some(other) = seen.insert(prefix.clone(), agent.name()) {
                    return Err(AgentError::conflict(format!(
                        "Prefix '{}' claimed by both '{}' and '{}'",
                        prefix,
                        other,
                        agent.name()
                    )));
                }
                match self.routes.get(&prefix) {
                    Some(&idx) if same_agent(&self.agents[idx], agent) => {}
                    _ => {
                        return Err(AgentError::conflict(format!(
                            "Prefix '{}' of agent '{}' is not routed to it",
                            prefix,
                            agent.name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Registered agents in registration order
    pub fn agents(&self) -> impl Iterator<Item = &Arc<dyn Agent>> {
        self.agents.iter()
    }

    /// Metadata for every agent in registration order
    pub fn list(&self) -> Vec<AgentInfo> {
        self.agents.iter().map(|a| a.describe()).collect()
    }

    pub fn contains_prefix(&self, prefix: &str) -> bool {
        self.routes.contains_key(prefix)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
