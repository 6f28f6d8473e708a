//! Operator shutdown.

/// Resolves on SIGINT or, on unix, SIGTERM.
///
/// # Panics
///
/// Panics if the signal handlers cannot be installed, which only happens when
/// called outside a tokio runtime. That is a startup bug and should fail fast.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is the tokio runtime running?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is the tokio runtime running?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
