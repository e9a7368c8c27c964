use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A single observation pulled from the external source.
///
/// Uniquely identified by `(entity_id, timestamp)`. Immutable once
/// reconciled; a later fetch with the same key replaces the stored row only
/// when `source_version` differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub source_version: String,
}

impl Record {
    /// Boundary validation applied by the fetcher before anything downstream
    /// sees the record.
    pub fn validate(&self) -> Result<(), String> {
        if self.entity_id.trim().is_empty() {
            return Err("empty entity_id".to_string());
        }
        if !self.value.is_finite() {
            return Err(format!(
                "non-finite value {} at {}",
                self.value, self.timestamp
            ));
        }
        if self.source_version.is_empty() {
            return Err("empty source_version".to_string());
        }
        Ok(())
    }
}

/// Latest timestamp known to be fully reconciled for an entity.
///
/// Owned exclusively by the reconciliation store; advanced at the end of a
/// successful run, never regressed outside backfill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub entity_id: String,
    pub last_seen_timestamp: DateTime<Utc>,
    pub last_fetch_run_id: String,
}

/// Holiday annotation for one timestamp. Derived, never persisted on its
/// own; joined transiently to records before forecasting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolidayMask {
    pub timestamp: DateTime<Utc>,
    pub is_holiday: bool,
    pub holiday_name: Option<String>,
}

/// One point of a forecast horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub predicted_value: f64,
}

/// A completed forecast computation. Append-only: later runs supersede
/// earlier ones, nothing is ever mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastRun {
    pub entity_id: String,
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub horizon: Vec<ForecastPoint>,
}

/// Outcome of one atomic upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertResult {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl UpsertResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.skipped
    }
}

/// Pipeline stage names, used for failure attribution in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetching,
    Enriching,
    Reconciling,
    Forecasting,
    Persisting,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetching => "fetching",
            Stage::Enriching => "enriching",
            Stage::Reconciling => "reconciling",
            Stage::Forecasting => "forecasting",
            Stage::Persisting => "persisting",
        }
    }
}

/// Terminal result of one entity's run within a pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntityOutcome {
    Completed {
        entity_id: String,
        upsert: UpsertResult,
        forecasted: bool,
    },
    Failed {
        entity_id: String,
        stage: Stage,
        error: String,
    },
}

impl EntityOutcome {
    pub fn entity_id(&self) -> &str {
        match self {
            EntityOutcome::Completed { entity_id, .. } => entity_id,
            EntityOutcome::Failed { entity_id, .. } => entity_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, EntityOutcome::Failed { .. })
    }
}

/// Aggregated result of one pipeline invocation across all entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<EntityOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_failure()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub source_base_url: String,
    pub source_page_size: u32,
    pub source_pages_per_batch: u32,
    pub calendar_region: String,
    /// Series granularity in seconds (86400 = daily).
    pub granularity_secs: i64,
    /// Minimum new records since the last forecast before recomputing.
    pub forecast_min_new_records: usize,
    /// Maximum staleness in seconds before a forecast is recomputed anyway.
    pub forecast_max_staleness_secs: i64,
    pub forecast_horizon_length: usize,
    pub forecast_min_observations: usize,
    pub forecast_base_url: String,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    pub entity_timeout_secs: u64,
    pub entities: Vec<String>,
    /// Earliest timestamp any fetch may request, per entity epoch.
    pub source_epoch: DateTime<Utc>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./forecast_pipeline.db".to_string());

        let source_base_url = std::env::var("SOURCE_BASE_URL")
            .unwrap_or_else(|_| "https://api.example.com/v2/time_entries".to_string());

        let source_page_size = std::env::var("SOURCE_PAGE_SIZE")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        let source_pages_per_batch = std::env::var("SOURCE_PAGES_PER_BATCH")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let calendar_region =
            std::env::var("CALENDAR_REGION").unwrap_or_else(|_| "uk-england-wales".to_string());

        let granularity_secs = std::env::var("GRANULARITY_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .unwrap_or(86_400);

        let forecast_min_new_records = std::env::var("FORECAST_MIN_NEW_RECORDS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let forecast_max_staleness_secs = std::env::var("FORECAST_MAX_STALENESS_SECS")
            .unwrap_or_else(|_| "604800".to_string())
            .parse()
            .unwrap_or(604_800);

        let forecast_horizon_length = std::env::var("FORECAST_HORIZON_LENGTH")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let forecast_min_observations = std::env::var("FORECAST_MIN_OBSERVATIONS")
            .unwrap_or_else(|_| "14".to_string())
            .parse()
            .unwrap_or(14);

        let forecast_base_url = std::env::var("FORECAST_BASE_URL")
            .unwrap_or_else(|_| "https://forecast.example.com/api".to_string());

        let retry_max_attempts = std::env::var("RETRY_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let retry_base_delay_ms = std::env::var("RETRY_BASE_DELAY_MS")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        let retry_multiplier = std::env::var("RETRY_MULTIPLIER")
            .unwrap_or_else(|_| "2.0".to_string())
            .parse()
            .unwrap_or(2.0);

        let retry_max_delay_ms = std::env::var("RETRY_MAX_DELAY_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .unwrap_or(30_000);

        let entity_timeout_secs = std::env::var("ENTITY_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let entities = std::env::var("PIPELINE_ENTITIES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let source_epoch = std::env::var("SOURCE_EPOCH")
            .ok()
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(|| {
                // Default epoch: ten years back, clamped to midnight.
                (Utc::now() - Duration::days(3650))
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc())
                    .unwrap_or_else(Utc::now)
            });

        Ok(Self {
            database_path,
            source_base_url,
            source_page_size,
            source_pages_per_batch,
            calendar_region,
            granularity_secs,
            forecast_min_new_records,
            forecast_max_staleness_secs,
            forecast_horizon_length,
            forecast_min_observations,
            forecast_base_url,
            retry_max_attempts,
            retry_base_delay_ms,
            retry_multiplier,
            retry_max_delay_ms,
            entity_timeout_secs,
            entities,
            source_epoch,
        })
    }
}
