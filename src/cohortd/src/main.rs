//! Cohort — dynamic user segmentation service.
//!
//! Main entry point: loads configuration, recovers the expiration journal,
//! wires the orchestrator and starts the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use cohort_api::ApiServer;
use cohort_core::config::AppConfig;
use cohort_scheduler::{ExpirationScheduler, FileExpirationLog, SchedulerSettings};
use cohort_service::{RandomSampler, ReportWriter, SegmentService};
use cohort_store::InMemoryStore;

#[derive(Parser, Debug)]
#[command(name = "cohortd")]
#[command(about = "Dynamic user segmentation service with TTL-based expiration")]
#[command(version)]
struct Cli {
    /// HTTP port (overrides config)
    #[arg(long, env = "COHORT__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Expiration journal path (overrides config)
    #[arg(long, env = "COHORT__SCHEDULER__JOURNAL_PATH")]
    journal_path: Option<String>,

    /// Reports directory (overrides config)
    #[arg(long, env = "COHORT__REPORTS__DIR")]
    reports_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cohortd=info,cohort_service=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Cohort starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(path) = cli.journal_path {
        config.scheduler.journal_path = path;
    }
    if let Some(dir) = cli.reports_dir {
        config.reports.dir = dir;
    }

    info!(
        http_port = config.api.http_port,
        journal = %config.scheduler.journal_path,
        reports_dir = %config.reports.dir,
        "Configuration loaded"
    );

    // Recover the expiration journal; entries scheduled before the last
    // shutdown fire on the first tick.
    let journal = Arc::new(FileExpirationLog::open(&config.scheduler.journal_path)?);
    let scheduler = Arc::new(ExpirationScheduler::recover(
        journal,
        SchedulerSettings::from(&config.scheduler),
    )?);

    let store = Arc::new(InMemoryStore::new());
    let reports = ReportWriter::new(
        &config.reports.dir,
        format!(
            "http://{}:{}",
            config.reports.public_host, config.api.http_port
        ),
    );

    let service = Arc::new(SegmentService::new(
        store,
        scheduler.clone(),
        Arc::new(RandomSampler),
        reports,
        Duration::from_millis(config.store.request_timeout_ms),
    ));

    // Start the expiration worker
    let worker = scheduler.run(service.clone());
    info!(
        pending = scheduler.pending_count(),
        tick_ms = config.scheduler.tick_interval_ms,
        "Expiration worker started"
    );

    // Start API server
    let api_server = ApiServer::new(config.clone(), service);

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Cohort is ready to serve traffic");

    // Blocks until shutdown
    api_server.start_http().await?;

    worker.abort();
    Ok(())
}
