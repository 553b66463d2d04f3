use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Install a handler that cancels the returned token on SIGINT or SIGTERM
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        if wait_for_signal().await {
            token_clone.cancel();
        }
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers, interrupts will not stop workers");
            return false;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, stopping campaign");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, stopping campaign");
        }
    }
    true
}

#[cfg(not(unix))]
async fn wait_for_signal() -> bool {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl-C, stopping campaign");
            true
        }
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            false
        }
    }
}
