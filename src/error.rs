//! Pipeline error taxonomy.
//!
//! Errors are scoped to the failing entity: the orchestrator catches them,
//! attributes them to a stage, and carries on with the other entities.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Transient source failure that survived the bounded retry schedule.
    /// Aborts the entity's sub-run; the entity is retried on the next
    /// scheduled pipeline invocation.
    #[error("source unavailable after {attempts} attempts: {last_error}")]
    SourceUnavailable { attempts: u32, last_error: String },

    /// A fetch was requested for a range preceding the entity's epoch.
    #[error("fetch since {requested} precedes source epoch {epoch}")]
    EpochViolation {
        requested: DateTime<Utc>,
        epoch: DateTime<Utc>,
    },

    /// Configuration error: the calendar has no data for this region.
    #[error("unknown calendar region '{0}'")]
    UnknownCalendarRegion(String),

    /// A timestamp fell outside the calendar's supported year range.
    /// Failing hard here avoids masking real holidays as ordinary days.
    #[error("year {year} outside supported calendar range {min}..={max}")]
    CalendarRangeExceeded { year: i32, min: i32, max: i32 },

    /// Attempted to move a watermark backwards without backfill mode.
    #[error("watermark regression for '{entity_id}': {attempted} < {current}")]
    WatermarkRegression {
        entity_id: String,
        current: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    /// Not enough observations to forecast. Structural, not transient:
    /// reported and left for the entity to accumulate more data.
    #[error("insufficient history: have {have} observations, need {need}")]
    InsufficientHistory { have: usize, need: usize },

    /// A record failed boundary validation at the fetcher.
    #[error("invalid record from source: {0}")]
    InvalidRecord(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Forecast service transport or protocol failure.
    #[error("forecast service error: {0}")]
    Forecast(#[source] anyhow::Error),

    /// Credential could not be resolved for a named secret.
    #[error("credential error: {0}")]
    Credential(String),

    /// The entity's run exceeded its timeout and was cancelled.
    #[error("entity run timed out after {0} seconds")]
    Timeout(u64),
}

impl PipelineError {
    /// Whether the next scheduled invocation is expected to succeed without
    /// operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::SourceUnavailable { .. } | PipelineError::Timeout(_)
        )
    }
}
