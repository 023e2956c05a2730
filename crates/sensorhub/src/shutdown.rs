use tracing::{info, warn};

/// Wait for SIGTERM or ctrl-c.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("ctrl-c received");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received");
    Ok(())
}

/// After the first signal, a second one skips the graceful drain.
pub fn exit_on_second_signal() {
    tokio::spawn(async {
        if shutdown_signal().await.is_ok() {
            warn!("Second shutdown signal, exiting without draining");
            std::process::exit(130);
        }
    });
}
