//! PacePulse API
//!
//! Race-timing results ingestion, athlete reconciliation and endpoint
//! monitoring, exposed over REST and a CLI.

mod cli;
mod config;
mod fetch;
mod ingest;
mod matcher;
mod monitor;
mod names;
mod notify;
mod queue;
mod routes;
mod scheduler;
mod scraper;
mod storage;
mod types;

use axum::{routing::get, routing::post, Router};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::routes::AppState;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => run_server(Some(host), Some(port)).await,
        Commands::Scrape { url, organiser } => cli::run_scrape(url, organiser).await,
        Commands::Analyze { url } => cli::run_analyze(url).await,
        Commands::Drain => cli::run_drain().await,
        Commands::Monitor => cli::run_monitor().await,
        Commands::Match { athlete, batch } => cli::run_match(athlete, batch).await,
        Commands::Watch {
            url,
            organiser,
            name,
            interval,
        } => cli::run_watch(url, organiser, name, interval).await,
    }
}

/// Run the API server.
async fn run_server(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pacepulse_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut config = AppConfig::load()?;

    // Override with CLI args
    if let Some(h) = host {
        config.server.host = h;
    }
    if let Some(p) = port {
        config.server.port = p;
    }

    tracing::info!("Configuration loaded");
    tracing::info!("Database path: {}", config.database.path);

    let pipeline = cli::build_pipeline(&config)?;

    // Background drivers: monitor pass and retry drain
    let scheduler = Scheduler::start(pipeline.clone(), config.monitor.enabled);

    // Create application state
    let state = Arc::new(AppState {
        pipeline: pipeline.clone(),
        config: config.clone(),
    });

    // Build router
    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/analyze", post(routes::analyze))
        .route("/scrape", post(routes::scrape))
        .route("/monitor", post(routes::monitor_pass))
        .route("/drain", post(routes::drain))
        .route("/jobs", get(routes::list_jobs))
        .route("/jobs/:id", get(routes::get_job))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Start server
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Tear down background work and the shared browser
    scheduler.shutdown();
    pipeline.ctx.cancel.cancel();
    pipeline.ctx.renderer.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
