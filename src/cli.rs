//! CLI commands for pacepulse-api.
//!
//! Supports the API server mode plus one-shot ingestion, analysis, retry
//! draining, monitoring and athlete matching from the terminal.

use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::ingest::Pipeline;
use crate::matcher;
use crate::monitor;
use crate::notify::Notifier;
use crate::queue;
use crate::scraper::{Organiser, ProgressSender, ScrapeContext};
use crate::storage::models::MonitoredEndpoint;
use crate::storage::{new_id, Store};

#[derive(Parser)]
#[command(name = "pacepulse-api")]
#[command(version, about = "PacePulse: race results ingestion and endpoint monitoring", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },

    /// Scrape one event URL and persist the results
    Scrape {
        /// Event URL
        url: String,

        /// Organiser hint (hopasports, evochip); auto-detected when omitted
        #[arg(short, long)]
        organiser: Option<String>,
    },

    /// Probe an event URL without scraping it
    Analyze {
        /// Event URL
        url: String,
    },

    /// Run one retry-queue drain pass
    Drain,

    /// Run one endpoint monitor pass
    Monitor,

    /// Auto-match unlinked results to athletes
    Match {
        /// Suggest matches for one athlete instead of auto-linking
        #[arg(short, long)]
        athlete: Option<String>,

        /// Maximum unlinked results to consider
        #[arg(short, long, default_value_t = 500)]
        batch: u32,
    },

    /// Register an endpoint for liveness monitoring
    Watch {
        /// URL to probe
        url: String,

        /// Organiser tag
        #[arg(short, long)]
        organiser: String,

        /// Display name
        #[arg(short, long)]
        name: String,

        /// Check interval in minutes
        #[arg(short, long, default_value_t = 15)]
        interval: u32,
    },
}

/// Build the shared pipeline from configuration.
pub fn build_pipeline(config: &AppConfig) -> anyhow::Result<Arc<Pipeline>> {
    let store = Arc::new(Store::open(Path::new(&config.database.path))?);
    let ctx = Arc::new(ScrapeContext::new(config.scraper.politeness_delay_ms));
    let notifier = Arc::new(Notifier::new(
        config.notifier.enabled,
        config.notifier.webhook_url.clone(),
    ));
    Ok(Arc::new(Pipeline::new(
        store,
        ctx,
        notifier,
        config.scraper.validation_floor,
    )))
}

/// Scrape one URL from the terminal.
pub async fn run_scrape(url: String, organiser: Option<String>) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let pipeline = build_pipeline(&config)?;

    let job = pipeline
        .store
        .create_job(organiser.as_deref(), &url, config.scraper.max_retries)?;
    eprintln!("job {} created for {}", job.short_id(), url);

    let (progress, mut rx) = ProgressSender::channel(64);
    let printer = tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            if p.total_pages > 0 {
                eprintln!(
                    "  {:?}: page {}/{} ({} results)",
                    p.stage, p.current_page, p.total_pages, p.results_scraped
                );
            } else {
                eprintln!("  {:?}", p.stage);
            }
        }
    });

    pipeline.run_job(&job, &progress).await?;
    drop(progress);
    let _ = printer.await;

    let stored = pipeline
        .store
        .get_job(&job.id)?
        .expect("job row exists after run");
    println!("{}", serde_json::to_string_pretty(&stored)?);
    pipeline.ctx.renderer.shutdown().await;
    Ok(())
}

/// Probe a URL and print the analysis.
pub async fn run_analyze(url: String) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let pipeline = build_pipeline(&config)?;

    let Some(organiser) = Organiser::for_url(&url) else {
        anyhow::bail!("no scraper matches {}", url);
    };
    let analysis = organiser.analyze_url(&pipeline.ctx, &url).await?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

/// Drain due retry jobs once.
pub async fn run_drain() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let pipeline = build_pipeline(&config)?;

    let processed = queue::drain(&pipeline).await?;
    eprintln!("processed {} job(s)", processed);
    pipeline.ctx.renderer.shutdown().await;
    Ok(())
}

/// Run one monitor pass.
pub async fn run_monitor() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let pipeline = build_pipeline(&config)?;

    let fetcher = monitor::probe_fetcher();
    let edges = monitor::run_monitor_pass(&pipeline.store, &fetcher).await?;
    eprintln!("monitor pass complete, {} edge(s)", edges.len());
    for edge in edges {
        println!("{:?}", edge);
    }
    Ok(())
}

/// Auto-match unlinked results, or list suggestions for one athlete.
pub async fn run_match(athlete: Option<String>, batch: u32) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let pipeline = build_pipeline(&config)?;

    match athlete {
        Some(athlete_id) => {
            let suggestions =
                matcher::suggest_matches_for_athlete(&pipeline.store, &athlete_id, batch)?;
            eprintln!("{} suggestion(s)", suggestions.len());
            for (result, confidence) in suggestions {
                println!("{}  {}  confidence {}", result.id, result.name, confidence);
            }
        }
        None => {
            let (linked, skipped) = matcher::auto_match_all(&pipeline.store, batch)?;
            eprintln!("linked {}, skipped {} for review", linked, skipped);
        }
    }
    Ok(())
}

/// Register a monitored endpoint.
pub async fn run_watch(
    url: String,
    organiser: String,
    name: String,
    interval: u32,
) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let store = Store::open(Path::new(&config.database.path))?;

    store.insert_endpoint(&MonitoredEndpoint {
        id: new_id(),
        organiser,
        name: name.clone(),
        url: url.clone(),
        enabled: true,
        check_interval_minutes: interval,
    })?;
    eprintln!("watching {} ({}) every {} minutes", name, url, interval);
    Ok(())
}
