use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// If a handler cannot be installed the error is logged and that signal is
/// simply not watched.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

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
        if sigterm.is_none() && sigint.is_none() {
            return;
        }

        tokio::select! {
            Some(_) = async { sigterm.as_mut()?.recv().await } => {
                tracing::info!("Received SIGTERM, closing scheduler");
            }
            Some(_) = async { sigint.as_mut()?.recv().await } => {
                tracing::info!("Received SIGINT, closing scheduler");
            }
        }

        cancel.cancel();
    });

    token
}
