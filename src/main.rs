use sslly_nginx::app::App;
use sslly_nginx::logging::LogController;
use sslly_nginx::paths::Paths;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log = LogController::init();

    info!("starting sslly-nginx");
    let paths = Paths::production();
    let app = App::new(paths, log).map_err(|e| {
        error!(error = %format!("{e:#}"), "failed to create application");
        e
    })?;

    app.start().await.map_err(|e| {
        error!(error = %format!("{e:#}"), "failed to start application");
        e
    })?;

    // Run until SIGINT or SIGTERM; SIGHUP-style reloads come from the
    // filesystem watchers instead of a signal.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down...");
    }

    app.stop().await;
    Ok(())
}
