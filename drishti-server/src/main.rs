// Drishti stream server
// Runs the frame scheduler on its own thread and serves viewers over WebSocket

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use drishti_server::cli::ServerArgs;
use drishti_core::init_tracing;
use drishti_server::{create_router, AppState, Pipeline, StreamTransport, TransportConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    let config = args.load_config().context("failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!("Starting Drishti stream server...");
    info!(
        "Scheduler: {} fps (max {}), source: {:?} {}x{}",
        config.scheduler.target_fps,
        config.scheduler.max_fps,
        config.source.kind,
        config.source.width,
        config.source.height
    );

    let transport = Arc::new(StreamTransport::new(TransportConfig::from(&config.server)));
    let pipeline = Pipeline::spawn(&config, transport.clone()).context("failed to start pipeline")?;
    info!("Pipeline ready");

    let state = AppState::new(transport.clone(), pipeline.stats(), pipeline.injector());
    let app = create_router(state);

    let address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    info!("Listening on http://{}", address);
    info!("  stream:   ws://{}/ws/stream", address);
    info!("  raw feed: ws://{}/ws/raw_feed", address);

    let stop = pipeline.stop_handle();
    let shutdown_transport = transport.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown().await;
            stop.stop();
            shutdown_transport.close_all();
        })
        .await
        .context("HTTP server error")?;

    info!("Shutting down...");
    if pipeline.is_finished() {
        warn!("Scheduler thread had already stopped");
    }
    let summary = tokio::task::spawn_blocking(move || pipeline.shutdown())
        .await
        .context("scheduler join failed")?;
    if let Some(summary) = summary {
        info!(
            "Scheduler summary: {} raw, {} inferred, {} dropped, {} degraded",
            summary.frames_raw, summary.frames_inferred, summary.frames_dropped, summary.frames_degraded
        );
    }

    info!("Drishti stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}
