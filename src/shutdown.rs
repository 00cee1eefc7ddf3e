//! Process shutdown signal.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Resolves on SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Returns a sender that fires once the process is asked to stop.
///
/// Every component subscribes its own receiver.
pub fn install() -> broadcast::Sender<()> {
    let (tx, _) = broadcast::channel(1);
    let signal_tx = tx.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Signal received, shutting down gracefully");
        // No subscribers left is fine
        let _ = signal_tx.send(());
    });

    tx
}
