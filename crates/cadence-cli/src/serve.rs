use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::runtime::Runtime;

/// Run the scheduler until Ctrl+C.
pub async fn run_serve(mut runtime: Runtime) -> Result<()> {
    let cancel = CancellationToken::new();
    let background = runtime.start_background(&cancel);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    info!(
        coordinator_id = %runtime.dispatcher.coordinator_id(),
        tick_interval_secs = runtime.config.scheduler.tick_interval_secs,
        "cadence scheduler running (Ctrl+C to stop)"
    );
    runtime.dispatcher.run(cancel.clone()).await;

    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
    info!("cadence scheduler stopped");
    Ok(())
}
