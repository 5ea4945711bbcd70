use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tidepool_core::QueueItem;
use tidepool_infra::{HandlerError, WorkerConfig};
use tidepool_worker::WorkerApp;

/// Item type handled out of the box, for smoke-testing a deployment.
const ECHO: &str = "tidepool.echo";

async fn echo(item: QueueItem, _cancel: CancellationToken) -> Result<(), HandlerError> {
    info!(item_id = %item.id, payload = %item.payload, "echo");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tidepool_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let mut app = WorkerApp::new(config);
    app.register_fn(ECHO, echo);

    let worker = app.start_postgres().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    if !worker.shutdown().await {
        warn!("some jobs did not stop within the grace period");
    }
    Ok(())
}
