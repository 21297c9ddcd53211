//! Run command implementation
//!
//! Runs a manifest target. Ctrl-C cancels the run cooperatively: running stages are
//! interrupted, containers are stopped and removed, and the command exits cleanly.

use anyhow::Result;
use infinity_core::config::RunnerConfig;
use infinity_core::engine::Runner;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Execute the run command
pub async fn execute_run(config: RunnerConfig, target: &str) -> Result<()> {
    debug!(?config, "Starting run");

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, canceling run");
                cancel.cancel();
            }
        })
    };

    let runner = Runner::new(config);
    let result = runner.run(target, &cancel).await;

    watcher.abort();
    result?;
    Ok(())
}
