use tokio::{
    select,
    signal::ctrl_c,
    task::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

#[cfg(unix)]
async fn sigterm_listener() {
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm_listener() {
    std::future::pending::<()>().await;
}

/// Cancels `cancel_token` on Ctrl+C or SIGTERM so that in-flight transfers
/// stop at their next chunk or window boundary.
pub fn run(cancel_token: CancellationToken) -> JoinHandle<()> {
    task::spawn(async move {
        select! {
            _ = cancel_token.cancelled() => return,
            _ = ctrl_c() => warn!("Ctrl+C received"),
            _ = sigterm_listener() => warn!("SIGTERM received"),
        };
        info!("Cancelling running operation");
        cancel_token.cancel();
    })
}
