//! Built-in agents wired into the `relay` binary

pub mod storage;
pub mod task;

use std::sync::Arc;

use anyhow::Result;
use relay_core::Orchestrator;

use crate::config::RelayConfig;

pub use storage::StorageAgent;
pub use task::TaskAgent;

/// Register the storage and task agents. Must run before startup.
pub async fn register_builtin(orchestrator: &Arc<Orchestrator>, cfg: &RelayConfig) -> Result<()> {
    orchestrator
        .register(Arc::new(StorageAgent::new(cfg.storage.max_records)))
        .await?;
    orchestrator
        .register(Arc::new(TaskAgent::new(orchestrator.handle())))
        .await?;
    Ok(())
}
