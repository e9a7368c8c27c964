//! Source fetching: paginated, rate-limited retrieval of raw time-series
//! records from the external API.

pub mod http_source;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PipelineError;
use crate::models::Record;

/// Boundary to the external time-series source.
///
/// `fetch` returns the finite set of records for one entity at or after
/// `since`, in timestamp order. Implementations keep no state between calls
/// beyond an in-call page cursor, discarded on success.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Record>, PipelineError>;
}

pub use http_source::HttpSourceFetcher;
pub use retry::RetryPolicy;
