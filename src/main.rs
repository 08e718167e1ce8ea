//! Pushrelay daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

use pushrelay::{Config, LogReporter, Router, Update};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting pushrelay with config: {:?}", cfg);

    let router = Arc::new(Router::with_reporter(cfg, Arc::new(LogReporter)));

    // Relayed updates land here; the push server drains this channel.
    let (update_tx, mut update_rx) = mpsc::channel::<Update>(128);

    let router_for_listener = Arc::clone(&router);
    let mut listener_handle = tokio::spawn(async move {
        if let Err(e) = router_for_listener.handle_updates(Arc::new(update_tx)).await {
            error!("Update listener failed: {}", e);
        }
    });

    let consumer_handle = tokio::spawn(async move {
        while let Some(update) = update_rx.recv().await {
            info!(
                "Relayed update for {} on channel {} at version {}",
                update.client_id, update.channel_id, update.version
            );
        }
    });

    // Graceful Shutdown
    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        _ = &mut listener_handle => {
            error!("Update listener stopped, shutting down...");
        }
    }

    listener_handle.abort();
    consumer_handle.abort();
    router.close_routes().await;

    info!("Shutdown complete.");
    Ok(())
}
