//! relay-core - The routing core of the relay todo application
//!
//! This crate provides:
//! - The Message/Response envelope that crosses every component boundary
//! - The `Agent` capability trait every handler implements
//! - A prefix registry guaranteeing unambiguous routing
//! - The `Orchestrator`, which dispatches, manages lifecycle, and turns
//!   unexpected failures into typed errors

pub mod agents;
pub mod error;
pub mod orchestrator;
pub mod system;
pub mod types;

// Re-export main types for convenience
pub use agents::{Agent, AgentRegistry};
pub use error::{AgentError, ErrorKind};
pub use orchestrator::{
    DispatchHandle, DispatchOptions, Orchestrator, OrchestratorConfig, OrchestratorState,
    ShutdownReport,
};
pub use tokio_util::sync::CancellationToken;
pub use types::{
    ACTION_SEPARATOR, AgentInfo, AgentStatus, ErrorInfo, Message, RawMessage, Response,
    split_action,
};
