use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// The scheduler stops its cycle loop when the token fires and the engine then
/// waits for in-flight tasks. If a handler cannot be installed the error is
/// logged and the token is only cancelled by the remaining signal.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                None
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGINT handler");
                None
            }
        };

        tokio::select! {
            Some(_) = recv(&mut sigterm) => {
                tracing::info!("Received SIGTERM, draining running tasks");
            }
            Some(_) = recv(&mut sigint) => {
                tracing::info!("Received SIGINT, draining running tasks");
            }
            else => return,
        }

        token_clone.cancel();
    });

    token
}

async fn recv(sig: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match sig {
        Some(s) => s.recv().await,
        None => None,
    }
}
