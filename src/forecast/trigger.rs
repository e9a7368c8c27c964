//! Decides whether freshly reconciled data warrants a forecast
//! recomputation.
//!
//! Policy: recompute when the new data volume since the last forecast
//! reaches the configured threshold, or when the last forecast is older
//! than the staleness bound, whichever comes first. An entity with no
//! forecast at all always triggers.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ForecastTrigger {
    pub min_new_records: usize,
    pub max_staleness: Duration,
}

impl ForecastTrigger {
    pub fn new(min_new_records: usize, max_staleness: Duration) -> Self {
        Self {
            min_new_records,
            max_staleness,
        }
    }

    pub fn should_forecast(
        &self,
        entity_id: &str,
        new_record_count: usize,
        last_forecast_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let last = match last_forecast_at {
            Some(ts) => ts,
            None => {
                debug!("'{}': no prior forecast, triggering", entity_id);
                return true;
            }
        };

        if new_record_count >= self.min_new_records {
            debug!(
                "'{}': {} new records >= threshold {}, triggering",
                entity_id, new_record_count, self.min_new_records
            );
            return true;
        }

        let staleness = now - last;
        if staleness >= self.max_staleness {
            debug!(
                "'{}': forecast {}s stale >= bound {}s, triggering",
                entity_id,
                staleness.num_seconds(),
                self.max_staleness.num_seconds()
            );
            return true;
        }

        debug!(
            "'{}': {} new records, {}s stale, skipping forecast",
            entity_id,
            new_record_count,
            staleness.num_seconds()
        );
        false
    }
}
