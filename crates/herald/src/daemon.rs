//! Daemon command: run the scheduler loop until interrupted.

use miette::Result;
use tokio::sync::watch;
use tracing::info;

use crate::app;
use crate::config::HeraldConfig;

pub async fn run(config: &HeraldConfig) -> Result<()> {
    let scheduler = app::open_scheduler(config).await?;

    info!(
        data_dir = %config.data_dir.display(),
        tick_secs = config.scheduler.tick_interval_secs,
        max_concurrent_jobs = config.scheduler.max_concurrent_jobs,
        "herald daemon starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received Ctrl-C, finishing in-flight dispatches");
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await;
    Ok(())
}
