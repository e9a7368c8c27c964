//! End-to-end pipeline runs against an on-disk store, with the source and
//! the forecast service mocked at their trait seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;

use forecast_pipeline::error::PipelineError;
use forecast_pipeline::fetch::SourceFetcher;
use forecast_pipeline::forecast::{ForecastService, ForecastTrigger};
use forecast_pipeline::holiday::HolidayCalendar;
use forecast_pipeline::models::{
    EntityOutcome, ForecastPoint, ForecastRun, HolidayMask, Record, Stage,
};
use forecast_pipeline::pipeline::{PipelineOrchestrator, RunOptions};
use forecast_pipeline::store::ReconciliationStore;

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn daily(entity: &str, year: i32, month: u32, day: u32, value: f64) -> Record {
    Record {
        entity_id: entity.to_string(),
        timestamp: Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap(),
        value,
        source_version: "v1".to_string(),
    }
}

/// Source stub: canned records per entity, `since` filtering applied the
/// way the real API does it server-side.
struct MockFetcher {
    records: HashMap<String, Vec<Record>>,
    failing_entities: Vec<String>,
}

impl MockFetcher {
    fn new(records: HashMap<String, Vec<Record>>) -> Self {
        Self {
            records,
            failing_entities: Vec::new(),
        }
    }

    fn failing_for(mut self, entity: &str) -> Self {
        self.failing_entities.push(entity.to_string());
        self
    }
}

#[async_trait]
impl SourceFetcher for MockFetcher {
    async fn fetch(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Record>, PipelineError> {
        if self.failing_entities.iter().any(|e| e == entity_id) {
            return Err(PipelineError::SourceUnavailable {
                attempts: 3,
                last_error: "connection refused".to_string(),
            });
        }
        Ok(self
            .records
            .get(entity_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Forecast stub: flat mean forecast over the requested horizon, recording
/// the mask it was handed. Optionally fails the first call to exercise the
/// partial-failure path.
struct MockForecaster {
    min_observations: usize,
    fail_next: AtomicBool,
    last_mask: Mutex<Vec<HolidayMask>>,
}

impl MockForecaster {
    fn new(min_observations: usize) -> Self {
        Self {
            min_observations,
            fail_next: AtomicBool::new(false),
            last_mask: Mutex::new(Vec::new()),
        }
    }

    fn fail_once(self) -> Self {
        self.fail_next.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl ForecastService for MockForecaster {
    async fn generate(
        &self,
        entity_id: &str,
        series: &[(DateTime<Utc>, f64)],
        holiday_mask: &[HolidayMask],
        horizon_length: usize,
    ) -> Result<ForecastRun, PipelineError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PipelineError::Forecast(anyhow::anyhow!(
                "forecast service 503"
            )));
        }
        if series.len() < self.min_observations {
            return Err(PipelineError::InsufficientHistory {
                have: series.len(),
                need: self.min_observations,
            });
        }
        *self.last_mask.lock() = holiday_mask.to_vec();

        let mean = series.iter().map(|(_, v)| v).sum::<f64>() / series.len() as f64;
        let last = series.last().unwrap().0;
        let horizon = (1..=horizon_length as i64)
            .map(|i| ForecastPoint {
                timestamp: last + Duration::days(i),
                predicted_value: mean,
            })
            .collect();
        Ok(ForecastRun {
            entity_id: entity_id.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            generated_at: Utc::now(),
            horizon,
        })
    }
}

struct Harness {
    store: ReconciliationStore,
    forecaster: Arc<MockForecaster>,
    orchestrator: Arc<PipelineOrchestrator>,
    _dir: tempfile::TempDir,
}

fn harness(fetcher: MockFetcher, forecaster: MockForecaster) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pipeline.db");
    let store = ReconciliationStore::open(db_path.to_str().unwrap()).unwrap();
    let forecaster = Arc::new(forecaster);
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        Arc::new(fetcher),
        Arc::new(HolidayCalendar::for_region("uk-england-wales").unwrap()),
        store.clone(),
        ForecastTrigger::new(5, Duration::days(7)),
        forecaster.clone(),
        Duration::days(1),
        7,
        epoch(),
        StdDuration::from_secs(30),
    ));
    Harness {
        store,
        forecaster,
        orchestrator,
        _dir: dir,
    }
}

#[tokio::test]
async fn initial_load_reconciles_and_forecasts_over_a_holiday() {
    // Ten daily records spanning the 2025 Summer Bank Holiday (Aug 25).
    let records: Vec<Record> = (20..=29)
        .map(|d| daily("E1", 2025, 8, d, d as f64))
        .collect();
    let h = harness(
        MockFetcher::new(HashMap::from([("E1".to_string(), records)])),
        MockForecaster::new(3),
    );

    let report = h
        .orchestrator
        .run(&["E1".to_string()], RunOptions::default())
        .await;

    assert_eq!(report.succeeded(), 1);
    match &report.outcomes[0] {
        EntityOutcome::Completed {
            upsert, forecasted, ..
        } => {
            assert_eq!(upsert.inserted, 10);
            assert!(forecasted, "initial load exceeds the volume threshold");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    assert_eq!(h.store.record_count("E1").unwrap(), 10);
    let wm = h.store.get_watermark("E1").unwrap().unwrap();
    assert_eq!(
        wm.last_seen_timestamp,
        Utc.with_ymd_and_hms(2025, 8, 29, 0, 0, 0).unwrap()
    );

    let run = h.store.latest_forecast_run("E1").unwrap().unwrap();
    assert_eq!(run.horizon.len(), 7);

    // Exactly one mask entry inside the ingested window marks the holiday.
    let mask = h.forecaster.last_mask.lock();
    let holidays: Vec<_> = mask
        .iter()
        .filter(|m| m.is_holiday && m.timestamp <= wm.last_seen_timestamp)
        .collect();
    assert_eq!(holidays.len(), 1);
    assert_eq!(
        holidays[0].holiday_name.as_deref(),
        Some("Summer Bank Holiday")
    );
}

#[tokio::test]
async fn trivial_ingestion_within_staleness_window_skips_forecast() {
    // Entity with 100 reconciled days, a committed watermark, and a fresh
    // forecast run; the source has exactly one newer record.
    let start = epoch();
    let mut history = Vec::new();
    for i in 0..100 {
        let ts = start + Duration::days(i);
        history.push(Record {
            entity_id: "E2".to_string(),
            timestamp: ts,
            value: 1.0,
            source_version: "v1".to_string(),
        });
    }
    let day101 = start + Duration::days(100);
    let mut source = history.clone();
    source.push(Record {
        entity_id: "E2".to_string(),
        timestamp: day101,
        value: 2.0,
        source_version: "v1".to_string(),
    });

    let h = harness(
        MockFetcher::new(HashMap::from([("E2".to_string(), source)])),
        MockForecaster::new(3),
    );

    h.store.upsert("E2", &history).unwrap();
    h.store
        .advance_watermark("E2", start + Duration::days(99), "seed-run", false)
        .unwrap();
    h.store
        .record_forecast_run(&ForecastRun {
            entity_id: "E2".to_string(),
            run_id: "seed-forecast".to_string(),
            generated_at: Utc::now(),
            horizon: vec![],
        })
        .unwrap();

    let report = h
        .orchestrator
        .run(&["E2".to_string()], RunOptions::default())
        .await;

    assert_eq!(report.succeeded(), 1);
    match &report.outcomes[0] {
        EntityOutcome::Completed {
            upsert, forecasted, ..
        } => {
            assert_eq!(upsert.inserted, 1, "only day 101 is past the watermark");
            assert!(!forecasted, "one record below threshold, staleness not reached");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    // The seed forecast is still the latest; the watermark moved on.
    let latest = h.store.latest_forecast_run("E2").unwrap().unwrap();
    assert_eq!(latest.run_id, "seed-forecast");
    let wm = h.store.get_watermark("E2").unwrap().unwrap();
    assert_eq!(wm.last_seen_timestamp, day101);
    assert_eq!(h.store.record_count("E2").unwrap(), 101);
}

#[tokio::test]
async fn forecast_failure_leaves_data_safe_and_next_run_recovers() {
    let records: Vec<Record> = (1..=10).map(|d| daily("E3", 2025, 3, d, 1.0)).collect();
    let h = harness(
        MockFetcher::new(HashMap::from([("E3".to_string(), records)])),
        MockForecaster::new(3).fail_once(),
    );

    // First run: reconcile succeeds, forecast fails, watermark stays put.
    let report = h
        .orchestrator
        .run(&["E3".to_string()], RunOptions::default())
        .await;
    match &report.outcomes[0] {
        EntityOutcome::Failed { stage, .. } => assert_eq!(*stage, Stage::Forecasting),
        other => panic!("expected forecasting failure, got {:?}", other),
    }
    assert_eq!(h.store.record_count("E3").unwrap(), 10);
    assert!(h.store.get_watermark("E3").unwrap().is_none());
    assert!(h.store.latest_forecast_run("E3").unwrap().is_none());

    // Second run refetches the same range; idempotent upserts add nothing,
    // and the forecast goes through.
    let report = h
        .orchestrator
        .run(&["E3".to_string()], RunOptions::default())
        .await;
    match &report.outcomes[0] {
        EntityOutcome::Completed {
            upsert, forecasted, ..
        } => {
            assert_eq!(upsert.inserted, 0);
            assert_eq!(upsert.skipped, 10);
            assert!(forecasted);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.store.record_count("E3").unwrap(), 10, "no duplicates");
    assert!(h.store.get_watermark("E3").unwrap().is_some());
    assert!(h.store.latest_forecast_run("E3").unwrap().is_some());
}

#[tokio::test]
async fn one_failing_entity_never_blocks_the_others() {
    let good: Vec<Record> = (1..=10).map(|d| daily("GOOD", 2025, 5, d, 1.0)).collect();
    let h = harness(
        MockFetcher::new(HashMap::from([("GOOD".to_string(), good)])).failing_for("BAD"),
        MockForecaster::new(3),
    );

    let report = h
        .orchestrator
        .run(&["BAD".to_string(), "GOOD".to_string()], RunOptions::default())
        .await;

    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);
    let bad = report
        .outcomes
        .iter()
        .find(|o| o.entity_id() == "BAD")
        .unwrap();
    match bad {
        EntityOutcome::Failed { stage, error, .. } => {
            assert_eq!(*stage, Stage::Fetching);
            assert!(error.contains("source unavailable"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    // The failing entity left no trace in the store.
    assert_eq!(h.store.record_count("BAD").unwrap(), 0);
    assert_eq!(h.store.record_count("GOOD").unwrap(), 10);
}

#[tokio::test]
async fn backfill_reingests_without_duplicating_or_regressing_data() {
    let records: Vec<Record> = (1..=10).map(|d| daily("E5", 2025, 7, d, 1.0)).collect();
    let h = harness(
        MockFetcher::new(HashMap::from([("E5".to_string(), records)])),
        MockForecaster::new(3),
    );

    let first = h
        .orchestrator
        .run(&["E5".to_string()], RunOptions::default())
        .await;
    assert_eq!(first.succeeded(), 1);

    // Backfill refetches from the epoch: everything skips, the row count
    // holds, and the run completes rather than tripping the watermark guard.
    let backfill = h
        .orchestrator
        .run(&["E5".to_string()], RunOptions { backfill: true })
        .await;
    assert_eq!(backfill.succeeded(), 1);
    match &backfill.outcomes[0] {
        EntityOutcome::Completed { upsert, .. } => {
            assert_eq!(upsert.inserted, 0);
            assert_eq!(upsert.skipped, 10);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(h.store.record_count("E5").unwrap(), 10);
}
