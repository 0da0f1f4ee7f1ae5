use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or Ctrl-C.
///
/// The maintenance loop and the HTTP server both watch this token; the
/// server stops accepting connections and drains in-flight requests.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = terminate() => {
                tracing::info!("Received SIGTERM, shutting down coordinator");
            }
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("Received SIGINT, shutting down coordinator"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for SIGINT"),
            },
        }
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
