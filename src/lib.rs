//! Incremental data-ingestion and forecast-refresh pipeline.
//!
//! Pulls external time-series records through a paginated API, annotates
//! them with holiday metadata, reconciles them idempotently into a
//! watermark-tracked store, and refreshes holiday-aware forecasts when new
//! volume or staleness warrants it.

pub mod auth;
pub mod error;
pub mod fetch;
pub mod forecast;
pub mod holiday;
pub mod models;
pub mod pipeline;
pub mod store;

pub use error::PipelineError;
pub use models::Config;
