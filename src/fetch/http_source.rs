//! Paginated HTTP source client.
//!
//! Page 1 doubles as a probe reporting `total_pages`/`total_entries`; the
//! remaining pages are fetched in bounded concurrent batches, each page
//! retried under the bounded policy. The page cursor lives only for the
//! duration of one `fetch` call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::Deserialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::auth::{source_headers, CredentialProvider};
use crate::error::PipelineError;
use crate::fetch::{RetryPolicy, SourceFetcher};
use crate::models::Record;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Minimum spacing between requests; the source rate-limits per account.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);

/// One page of the source API response.
#[derive(Debug, Deserialize)]
struct SourcePage {
    #[serde(alias = "time_entries")]
    entries: Vec<SourceEntry>,
    total_pages: u32,
    #[serde(default)]
    total_entries: u64,
    page: u32,
}

/// Raw record shape on the wire. Anything loosely typed upstream is pinned
/// down here and validated before it becomes a `Record`.
#[derive(Debug, Deserialize)]
struct SourceEntry {
    entity_id: String,
    timestamp: DateTime<Utc>,
    value: f64,
    source_version: String,
}

struct RateLimiter {
    last_request: tokio::time::Instant,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_request: tokio::time::Instant::now() - min_interval,
            min_interval,
        }
    }

    async fn acquire(&mut self) {
        let elapsed = self.last_request.elapsed();
        if elapsed < self.min_interval {
            sleep(self.min_interval - elapsed).await;
        }
        self.last_request = tokio::time::Instant::now();
    }
}

pub struct HttpSourceFetcher {
    client: Client,
    base_url: String,
    page_size: u32,
    pages_per_batch: u32,
    epoch: DateTime<Utc>,
    retry: RetryPolicy,
    provider: Arc<dyn CredentialProvider>,
    rate_limiter: tokio::sync::Mutex<RateLimiter>,
}

impl HttpSourceFetcher {
    pub fn new(
        base_url: String,
        page_size: u32,
        pages_per_batch: u32,
        epoch: DateTime<Utc>,
        retry: RetryPolicy,
        provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url,
            page_size,
            pages_per_batch: pages_per_batch.max(1),
            epoch,
            retry,
            provider,
            rate_limiter: tokio::sync::Mutex::new(RateLimiter::new(MIN_REQUEST_INTERVAL)),
        }
    }

    async fn fetch_page(
        &self,
        headers: &HeaderMap,
        entity_id: &str,
        since: DateTime<Utc>,
        page: u32,
    ) -> Result<SourcePage, PipelineError> {
        let query = [
            ("entity_id".to_string(), entity_id.to_string()),
            ("from".to_string(), since.to_rfc3339()),
            ("page".to_string(), page.to_string()),
            ("per_page".to_string(), self.page_size.to_string()),
        ];

        let mut last_error = String::new();

        for attempt in 0..self.retry.max_attempts {
            self.rate_limiter.lock().await.acquire().await;

            let request = self
                .client
                .get(&self.base_url)
                .headers(headers.clone())
                .query(&query);

            match timeout(REQUEST_TIMEOUT, request.send()).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<SourcePage>().await.map_err(|e| {
                            PipelineError::InvalidRecord(format!(
                                "malformed page {} payload: {}",
                                page, e
                            ))
                        });
                    } else if status == StatusCode::TOO_MANY_REQUESTS
                        || status.is_server_error()
                    {
                        last_error = format!("HTTP {} on page {}", status, page);
                        warn!(
                            "Transient source error (attempt {}): {}",
                            attempt + 1,
                            last_error
                        );
                    } else {
                        // Client errors other than 429 will not heal on retry.
                        let text = response.text().await.unwrap_or_default();
                        return Err(PipelineError::SourceUnavailable {
                            attempts: attempt + 1,
                            last_error: format!("HTTP {} on page {}: {}", status, page, text),
                        });
                    }
                }
                Ok(Err(e)) => {
                    last_error = format!("request failed on page {}: {}", page, e);
                    warn!("{} (attempt {})", last_error, attempt + 1);
                }
                Err(_) => {
                    last_error = format!("request timeout on page {}", page);
                    warn!("{} (attempt {})", last_error, attempt + 1);
                }
            }

            if !self.retry.attempts_exhausted(attempt) {
                let delay = self.retry.jittered_delay(attempt);
                debug!("Retrying page {} in {:?}", page, delay);
                sleep(delay).await;
            }
        }

        Err(PipelineError::SourceUnavailable {
            attempts: self.retry.max_attempts,
            last_error,
        })
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Record>, PipelineError> {
        if since < self.epoch {
            return Err(PipelineError::EpochViolation {
                requested: since,
                epoch: self.epoch,
            });
        }

        // Credential resolved once per call batch, dropped at the end.
        let headers = source_headers(self.provider.as_ref()).await?;

        // Page 1 is the probe: it carries the page count for the rest.
        let first = self.fetch_page(&headers, entity_id, since, 1).await?;
        let total_pages = first.total_pages.max(first.page);
        debug!(
            "Source probe for '{}': {} pages, {} entries",
            entity_id, total_pages, first.total_entries
        );

        let mut entries = first.entries;
        let mut next_page = 2u32;
        while next_page <= total_pages {
            let batch_end = (next_page + self.pages_per_batch - 1).min(total_pages);
            debug!("Fetching pages {} to {}", next_page, batch_end);

            let pages = try_join_all(
                (next_page..=batch_end)
                    .map(|page| self.fetch_page(&headers, entity_id, since, page)),
            )
            .await?;

            for page in pages {
                entries.extend(page.entries);
            }
            next_page = batch_end + 1;
        }

        let records = records_from_entries(entity_id, entries, since)?;
        info!(
            "Fetched {} records for '{}' since {}",
            records.len(),
            entity_id,
            since
        );
        Ok(records)
    }
}

/// Validate and normalize raw entries: drop rows for other entities, drop
/// rows before `since`, enforce the record invariants, and return them in
/// non-decreasing timestamp order.
fn records_from_entries(
    entity_id: &str,
    entries: Vec<SourceEntry>,
    since: DateTime<Utc>,
) -> Result<Vec<Record>, PipelineError> {
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.entity_id != entity_id {
            warn!(
                "Source returned row for '{}' while fetching '{}'; dropping",
                entry.entity_id, entity_id
            );
            continue;
        }
        if entry.timestamp < since {
            continue;
        }
        let record = Record {
            entity_id: entry.entity_id,
            timestamp: entry.timestamp,
            value: entry.value,
            source_version: entry.source_version,
        };
        record.validate().map_err(PipelineError::InvalidRecord)?;
        records.push(record);
    }
    records.sort_by_key(|r| r.timestamp);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(day: u32, value: f64) -> SourceEntry {
        SourceEntry {
            entity_id: "E1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, day, 0, 0, 0).unwrap(),
            value,
            source_version: "v1".to_string(),
        }
    }

    #[test]
    fn entries_are_filtered_and_ordered() {
        let since = Utc.with_ymd_and_hms(2025, 6, 3, 0, 0, 0).unwrap();
        let mut rows = vec![entry(5, 1.0), entry(3, 2.0), entry(4, 3.0), entry(1, 9.0)];
        rows.push(SourceEntry {
            entity_id: "OTHER".to_string(),
            ..entry(6, 4.0)
        });

        let records = records_from_entries("E1", rows, since).unwrap();
        let days: Vec<u32> = records
            .iter()
            .map(|r| chrono::Datelike::day(&r.timestamp))
            .collect();
        assert_eq!(days, vec![3, 4, 5]);
    }

    #[test]
    fn non_finite_values_are_rejected_at_the_boundary() {
        let since = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let rows = vec![entry(2, f64::NAN)];
        let err = records_from_entries("E1", rows, since).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRecord(_)));
    }

    #[test]
    fn page_payload_parses_with_source_key_alias() {
        let json = r#"{
            "time_entries": [
                {"entity_id": "E1", "timestamp": "2025-06-01T00:00:00Z",
                 "value": 7.5, "source_version": "2025-06-02T10:00:00Z"}
            ],
            "total_pages": 4,
            "total_entries": 312,
            "page": 1
        }"#;
        let page: SourcePage = serde_json::from_str(json).unwrap();
        assert_eq!(page.total_pages, 4);
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].value, 7.5);
    }
}
