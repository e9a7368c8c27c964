//! Pipeline orchestration.
//!
//! One invocation runs every configured entity through
//! fetch -> enrich -> reconcile -> maybe-forecast -> persist as an
//! independent tokio task. Entities never block each other; a failure is
//! attributed to its stage, reported, and retried on the next scheduled
//! invocation. The store is only ever mutated with fully-enriched data, and
//! the watermark moves only after persisting succeeds.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::fetch::SourceFetcher;
use crate::forecast::{prepare, ForecastService, ForecastTrigger};
use crate::holiday::HolidayCalendar;
use crate::models::{EntityOutcome, HolidayMask, Record, RunReport, Stage, UpsertResult};
use crate::store::ReconciliationStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Backfill re-ingests from the epoch and may rewind the watermark.
    /// Never set on automatic scheduled runs.
    pub backfill: bool,
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    fetcher: Arc<dyn SourceFetcher>,
    calendar: Arc<HolidayCalendar>,
    store: ReconciliationStore,
    trigger: ForecastTrigger,
    forecaster: Arc<dyn ForecastService>,
    granularity: Duration,
    horizon_length: usize,
    epoch: DateTime<Utc>,
    entity_timeout: StdDuration,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        calendar: Arc<HolidayCalendar>,
        store: ReconciliationStore,
        trigger: ForecastTrigger,
        forecaster: Arc<dyn ForecastService>,
        granularity: Duration,
        horizon_length: usize,
        epoch: DateTime<Utc>,
        entity_timeout: StdDuration,
    ) -> Self {
        Self {
            fetcher,
            calendar,
            store,
            trigger,
            forecaster,
            granularity,
            horizon_length,
            epoch,
            entity_timeout,
        }
    }

    /// Run one pipeline invocation over the given entities.
    pub async fn run(&self, entities: &[String], opts: RunOptions) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(
            "Pipeline run {} starting: {} entities{}",
            run_id,
            entities.len(),
            if opts.backfill { " (backfill)" } else { "" }
        );

        let mut handles = Vec::with_capacity(entities.len());
        for entity_id in entities {
            let orchestrator = self.clone();
            let entity = entity_id.clone();
            let run = run_id.clone();
            // Stage tracker survives a timeout so the report can say where
            // the run was cancelled.
            let stage = Arc::new(Mutex::new(Stage::Fetching));
            let stage_for_task = Arc::clone(&stage);

            // The timeout wraps the task itself: cancellation lands at the
            // entity's next await point and is attributed to the stage it
            // was in.
            let entity_timeout = self.entity_timeout;
            let handle = tokio::spawn(async move {
                match timeout(
                    entity_timeout,
                    orchestrator.run_entity(&entity, &run, opts, &stage_for_task),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => EntityOutcome::Failed {
                        entity_id: entity.clone(),
                        stage: *stage_for_task.lock(),
                        error: PipelineError::Timeout(entity_timeout.as_secs()).to_string(),
                    },
                }
            });
            handles.push((entity_id.clone(), stage, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (entity_id, stage, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => EntityOutcome::Failed {
                    entity_id: entity_id.clone(),
                    stage: *stage.lock(),
                    error: format!("entity task aborted: {}", join_err),
                },
            };
            if let EntityOutcome::Failed { stage, error, .. } = &outcome {
                error!("Entity '{}' failed at {}: {}", entity_id, stage.as_str(), error);
            }
            outcomes.push(outcome);
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        info!(
            "Pipeline run {} finished: {} succeeded, {} failed",
            report.run_id,
            report.succeeded(),
            report.failed()
        );
        report
    }

    /// One entity's state machine. Every fallible step maps its error to
    /// the stage it belongs to; the function never panics the task.
    async fn run_entity(
        &self,
        entity_id: &str,
        run_id: &str,
        opts: RunOptions,
        stage: &Mutex<Stage>,
    ) -> EntityOutcome {
        let fail = |stage: Stage, err: PipelineError| EntityOutcome::Failed {
            entity_id: entity_id.to_string(),
            stage,
            error: err.to_string(),
        };

        // Fetching. A failure here leaves the store untouched.
        *stage.lock() = Stage::Fetching;
        let watermark = match self.store.get_watermark(entity_id) {
            Ok(wm) => wm,
            Err(e) => return fail(Stage::Fetching, e),
        };
        let since = fetch_since(
            watermark.as_ref().map(|wm| wm.last_seen_timestamp),
            self.epoch,
            opts.backfill,
        );
        let records = match self.fetcher.fetch(entity_id, since).await {
            Ok(records) => records,
            Err(e) => return fail(Stage::Fetching, e),
        };

        // Enriching. Still no store mutation: only fully-enriched batches
        // ever reach the reconciliation store.
        *stage.lock() = Stage::Enriching;
        let enriched = match self.calendar.enrich(records) {
            Ok(enriched) => enriched,
            Err(e) => return fail(Stage::Enriching, e),
        };

        // Reconciling. The batch lands atomically; from here on, applied
        // writes are idempotent and are never rolled back.
        *stage.lock() = Stage::Reconciling;
        let batch: Vec<Record> = enriched.iter().map(|(r, _)| r.clone()).collect();
        let upsert = match self.store.upsert(entity_id, &batch) {
            Ok(result) => result,
            Err(e) => return fail(Stage::Reconciling, e),
        };

        let new_watermark = batch
            .iter()
            .map(|r| r.timestamp)
            .max()
            .or(watermark.as_ref().map(|wm| wm.last_seen_timestamp));

        // Maybe-forecasting.
        *stage.lock() = Stage::Forecasting;
        let forecasted = match self.maybe_forecast(entity_id, &enriched).await {
            Ok(forecasted) => forecasted,
            Err((stage_hit, e)) => return fail(stage_hit, e),
        };

        // Persisting: the watermark advances only once everything before it
        // held. On failure the next invocation refetches; idempotent
        // upserts make that safe.
        *stage.lock() = Stage::Persisting;
        if let Some(new_ts) = new_watermark {
            if let Err(e) =
                self.store
                    .advance_watermark(entity_id, new_ts, run_id, opts.backfill)
            {
                return fail(Stage::Persisting, e);
            }
        }

        info!(
            "Entity '{}' done: {} inserted, {} updated, {} skipped, forecasted: {}",
            entity_id, upsert.inserted, upsert.updated, upsert.skipped, forecasted
        );
        EntityOutcome::Completed {
            entity_id: entity_id.to_string(),
            upsert,
            forecasted,
        }
    }

    /// Evaluate the trigger and, when it fires, prepare the series and call
    /// the forecast service, persisting the resulting run. Returns whether
    /// a forecast was produced.
    async fn maybe_forecast(
        &self,
        entity_id: &str,
        enriched: &[(Record, HolidayMask)],
    ) -> Result<bool, (Stage, PipelineError)> {
        let last_run = self
            .store
            .latest_forecast_run(entity_id)
            .map_err(|e| (Stage::Forecasting, e))?;
        let last_generated_at = last_run.as_ref().map(|r| r.generated_at);

        let new_volume = match last_generated_at {
            Some(ts) => self
                .store
                .count_reconciled_since(entity_id, ts)
                .map_err(|e| (Stage::Forecasting, e))?,
            None => enriched.len(),
        };

        if !self
            .trigger
            .should_forecast(entity_id, new_volume, last_generated_at, Utc::now())
        {
            return Ok(false);
        }

        let raw_series = self
            .store
            .series(entity_id)
            .map_err(|e| (Stage::Forecasting, e))?;
        let series = prepare::fill_gaps(&raw_series, self.granularity);
        if series.is_empty() {
            warn!("'{}': trigger fired with an empty series, skipping", entity_id);
            return Ok(false);
        }

        // Mask covers the gap-filled history plus the horizon grid, so the
        // model sees holidays on both sides of the boundary.
        let mut mask = Vec::with_capacity(series.len() + self.horizon_length);
        for &(ts, _) in &series {
            mask.push(
                self.calendar
                    .mask_for(ts)
                    .map_err(|e| (Stage::Forecasting, e))?,
            );
        }
        let series_end = series.last().map(|&(ts, _)| ts).unwrap_or_else(Utc::now);
        for ts in prepare::horizon_grid(series_end, self.granularity, self.horizon_length) {
            mask.push(
                self.calendar
                    .mask_for(ts)
                    .map_err(|e| (Stage::Forecasting, e))?,
            );
        }

        let run = self
            .forecaster
            .generate(entity_id, &series, &mask, self.horizon_length)
            .await
            .map_err(|e| (Stage::Forecasting, e))?;

        self.store
            .record_forecast_run(&run)
            .map_err(|e| (Stage::Persisting, e))?;
        Ok(true)
    }
}

/// Starting point for a fetch: one instant past the committed watermark,
/// the epoch when none exists, and always the epoch in backfill mode.
/// Non-backfill runs therefore never re-request watermarked ranges.
fn fetch_since(
    watermark: Option<DateTime<Utc>>,
    epoch: DateTime<Utc>,
    backfill: bool,
) -> DateTime<Utc> {
    if backfill {
        return epoch;
    }
    match watermark {
        Some(wm) => (wm + Duration::seconds(1)).max(epoch),
        None => epoch,
    }
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("granularity", &self.granularity)
            .field("horizon_length", &self.horizon_length)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Log a finished run the way operators read it.
pub fn log_report(report: &RunReport) {
    for outcome in &report.outcomes {
        match outcome {
            EntityOutcome::Completed {
                entity_id,
                upsert:
                    UpsertResult {
                        inserted,
                        updated,
                        skipped,
                    },
                forecasted,
            } => info!(
                "  {} ok: +{} ~{} ={}{}",
                entity_id,
                inserted,
                updated,
                skipped,
                if *forecasted { ", forecast refreshed" } else { "" }
            ),
            EntityOutcome::Failed {
                entity_id,
                stage,
                error,
            } => warn!("  {} FAILED at {}: {}", entity_id, stage.as_str(), error),
        }
    }
}
