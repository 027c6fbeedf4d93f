mod cli;
mod live;
mod router;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use chatlog_notify::Hub;
use chatlog_scheduler::Scheduler;
use clap::Parser;
use tracing::{info, warn};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    chatlog_core::config::load_dotenv();
    let mut config = chatlog_core::Config::from_env();
    cli.apply(&mut config);
    config.log_summary();

    serve(config).await
}

async fn serve(config: chatlog_core::Config) -> anyhow::Result<()> {
    let scheduler = Scheduler::start(config.scheduler.clone())?;
    let hub = Hub::start(config.hub.clone(), Arc::new(scheduler.clone()));
    let bridge = hub.spawn_status_bridge(scheduler.watch());
    let ticker =
        live::spawn_stats_ticker(scheduler.clone(), hub.clone(), config.hub.stats_interval());

    let state = Arc::new(AppState {
        scheduler: scheduler.clone(),
        hub: hub.clone(),
    });
    let app = router::build_router(state, &config.server.cors_origin);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(hub.clone()))
        .await?;

    ticker.abort();
    scheduler.shutdown().await;
    bridge.abort();
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C after telling every websocket client we are going away,
/// so upgraded connections close before the listener drains.
async fn shutdown_signal(hub: Hub) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
    hub.shutdown().await;
}
