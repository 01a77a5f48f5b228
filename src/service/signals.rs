use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `cancellation` on Ctrl+C (and SIGTERM on unix).
///
/// Running operations stop at their next checkpoint and report the
/// remaining entries as cancelled.
pub fn setup_shutdown_handler(cancellation: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                cancellation.cancel();
            }
            _ = cancellation.cancelled() => {}
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, cancelling"),
        _ = ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await
}

async fn ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, cancelling"),
        Err(e) => {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await
        }
    }
}
