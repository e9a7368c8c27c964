//! forecast-pipeline: one scheduled invocation of the ingestion and
//! forecast-refresh pipeline. Failed entities are picked up again by the
//! next scheduled invocation; this process does not loop.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forecast_pipeline::auth::EnvCredentialProvider;
use forecast_pipeline::fetch::{HttpSourceFetcher, RetryPolicy};
use forecast_pipeline::forecast::{ForecastTrigger, HttpForecastService};
use forecast_pipeline::holiday::HolidayCalendar;
use forecast_pipeline::models::Config;
use forecast_pipeline::pipeline::{log_report, PipelineOrchestrator, RunOptions};
use forecast_pipeline::store::ReconciliationStore;

#[derive(Parser, Debug)]
#[command(name = "forecast-pipeline", about = "Incremental ingestion and forecast refresh")]
struct Args {
    /// Entities to process (overrides PIPELINE_ENTITIES).
    #[arg(long, value_delimiter = ',')]
    entities: Vec<String>,

    /// Re-ingest from the source epoch; the only mode allowed to rewind
    /// watermarks.
    #[arg(long)]
    backfill: bool,

    /// Database path (overrides DATABASE_PATH).
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forecast_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    let entities = if !args.entities.is_empty() {
        args.entities.clone()
    } else {
        config.entities.clone()
    };
    if entities.is_empty() {
        anyhow::bail!("No entities configured; set PIPELINE_ENTITIES or pass --entities");
    }

    let database_path = args
        .database
        .clone()
        .unwrap_or_else(|| config.database_path.clone());

    let provider = Arc::new(EnvCredentialProvider::new());
    let store = ReconciliationStore::open(&database_path)
        .with_context(|| format!("Failed to open store at {}", database_path))?;
    let calendar = Arc::new(
        HolidayCalendar::for_region(&config.calendar_region)
            .context("Invalid calendar region")?,
    );

    let retry = RetryPolicy {
        max_attempts: config.retry_max_attempts,
        base_delay: StdDuration::from_millis(config.retry_base_delay_ms),
        multiplier: config.retry_multiplier,
        max_delay: StdDuration::from_millis(config.retry_max_delay_ms),
        ..RetryPolicy::default()
    };
    let fetcher = Arc::new(HttpSourceFetcher::new(
        config.source_base_url.clone(),
        config.source_page_size,
        config.source_pages_per_batch,
        config.source_epoch,
        retry,
        provider.clone(),
    ));
    let forecaster = Arc::new(HttpForecastService::new(
        config.forecast_base_url.clone(),
        config.forecast_min_observations,
        provider,
    ));
    let trigger = ForecastTrigger::new(
        config.forecast_min_new_records,
        Duration::seconds(config.forecast_max_staleness_secs),
    );

    let orchestrator = PipelineOrchestrator::new(
        fetcher,
        calendar,
        store,
        trigger,
        forecaster,
        Duration::seconds(config.granularity_secs),
        config.forecast_horizon_length,
        config.source_epoch,
        StdDuration::from_secs(config.entity_timeout_secs),
    );

    if args.backfill {
        warn!("Backfill mode: watermarks may be rewound");
    }
    let report = orchestrator
        .run(&entities, RunOptions { backfill: args.backfill })
        .await;
    log_report(&report);

    if report.succeeded() == 0 {
        anyhow::bail!("All {} entities failed this invocation", report.failed());
    }
    info!(
        "Invocation complete: {}/{} entities succeeded",
        report.succeeded(),
        report.outcomes.len()
    );
    Ok(())
}
