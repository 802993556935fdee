//! Wiring of stores, adapters and connections into a scheduler.

use std::sync::Arc;

use herald_adapters::{FileConnectionRegistry, builtin_adapters};
use herald_scheduler::{Dispatcher, FileAttemptLog, FileJobStore, Scheduler};
use miette::Result;

use crate::config::HeraldConfig;

/// Open the file-backed stores under the data directory.
pub async fn open_scheduler(config: &HeraldConfig) -> Result<Scheduler> {
    config.validate().map_err(|e| miette::miette!("{}", e))?;

    let store = FileJobStore::open(config.jobs_dir())
        .await
        .map_err(|e| miette::miette!("failed to open job store: {}", e))?;
    let log = FileAttemptLog::new(config.attempts_dir());

    let connections = FileConnectionRegistry::load(config.connections_path())
        .await
        .map_err(|e| miette::miette!("failed to load connections: {}", e))?;

    let adapters = builtin_adapters()
        .map_err(|e| miette::miette!("failed to build HTTP client: {}", e))?;

    let dispatcher = Dispatcher::new(
        Arc::new(store),
        Arc::new(log),
        Arc::new(connections),
        Arc::new(adapters),
        config.scheduler.clone(),
    );
    Ok(Scheduler::new(Arc::new(dispatcher)))
}
