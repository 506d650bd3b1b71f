use anyhow::Result;
use clap::Parser;
use confab::config::load_config;
use confab::http::{create_router, AppState};
use confab::logging;
use confab_sfu::engine::{LocalEngine, MediaEngine};
use confab_sfu::SfuServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Confab SFU signaling server
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the configuration file (defaults to ./config.yaml if present)
    #[arg(short, long, env = "CONFAB_CONFIG_PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration (fail fast on misconfigurations)
    let config = load_config(cli.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Confab server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Start the worker pool
    let engine: Arc<dyn MediaEngine> = Arc::new(LocalEngine::new());
    let sfu = SfuServer::init(config.sfu.clone(), engine).await?;

    // 4. Serve HTTP and WebSocket signaling
    let listener = tokio::net::TcpListener::bind(config.http_address())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {}: {e}", config.http_address()))?;
    info!("HTTP server listening on {}", config.http_address());

    let router = create_router(AppState {
        sfu: Arc::clone(&sfu),
        signaling: config.signaling.clone(),
    });
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let http = tokio::spawn(async move {
        let graceful = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("HTTP server error: {}", e);
        }
        info!("HTTP server shut down gracefully");
    });

    // 5. Run until a shutdown signal or a fatal worker death
    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutting down...");
            let _ = shutdown_tx.send(true);
            sfu.close().await;
            if tokio::time::timeout(Duration::from_secs(10), http).await.is_err() {
                error!("HTTP server did not stop within 10s");
            }
            info!("Confab server stopped");
            Ok(())
        }
        err = sfu.wait_for_worker_death() => {
            error!(error = %err, "Media worker died, exiting");
            let _ = shutdown_tx.send(true);
            Err(err.into())
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
