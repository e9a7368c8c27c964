//! Reconciliation store: the warehouse-table abstraction behind the
//! pipeline.
//!
//! Backed by SQLite in WAL mode. Batch upserts run in a single transaction
//! so a batch is visible to readers entirely or not at all. The per-entity
//! key space means concurrent entity tasks never touch the same rows, so the
//! connection mutex is the only coordination needed.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::models::{ForecastPoint, ForecastRun, Record, UpsertResult, Watermark};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS records (
    entity_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    value REAL NOT NULL,
    source_version TEXT NOT NULL,
    reconciled_at INTEGER NOT NULL,
    PRIMARY KEY (entity_id, timestamp)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS watermarks (
    entity_id TEXT PRIMARY KEY,
    last_seen_timestamp INTEGER NOT NULL,
    last_fetch_run_id TEXT NOT NULL
) WITHOUT ROWID;

-- Forecast runs are append-only; superseded runs are kept, never deleted.
CREATE TABLE IF NOT EXISTS forecast_runs (
    run_id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL,
    generated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS forecast_points (
    run_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    predicted_value REAL NOT NULL,
    PRIMARY KEY (run_id, timestamp)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_records_entity_ts
    ON records(entity_id, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_forecast_runs_entity
    ON forecast_runs(entity_id, generated_at DESC);
"#;

#[derive(Clone)]
pub struct ReconciliationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ReconciliationStore {
    pub fn open(db_path: &str) -> Result<Self, PipelineError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" && db_path != ":memory:" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap_or(0);
        info!(
            "Reconciliation store ready at {} ({} records)",
            db_path, count
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Idempotently merge a batch of records for one entity.
    ///
    /// One transaction per batch: either every row of the batch is visible
    /// or none is. A row with an existing `(entity_id, timestamp)` key is
    /// updated only when the incoming `source_version` differs; otherwise it
    /// is counted as skipped and left untouched.
    pub fn upsert(
        &self,
        entity_id: &str,
        records: &[Record],
    ) -> Result<UpsertResult, PipelineError> {
        if records.is_empty() {
            return Ok(UpsertResult::default());
        }

        let now = Utc::now().timestamp();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut result = UpsertResult::default();

        {
            let mut select = tx.prepare_cached(
                "SELECT source_version FROM records WHERE entity_id = ?1 AND timestamp = ?2",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO records (entity_id, timestamp, value, source_version, reconciled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut update = tx.prepare_cached(
                "UPDATE records SET value = ?3, source_version = ?4, reconciled_at = ?5
                 WHERE entity_id = ?1 AND timestamp = ?2",
            )?;

            for record in records {
                let ts = record.timestamp.timestamp();
                let existing: Option<String> = select
                    .query_row(params![entity_id, ts], |row| row.get(0))
                    .optional()?;

                match existing {
                    None => {
                        insert.execute(params![
                            entity_id,
                            ts,
                            record.value,
                            record.source_version,
                            now
                        ])?;
                        result.inserted += 1;
                    }
                    Some(stored) if stored != record.source_version => {
                        update.execute(params![
                            entity_id,
                            ts,
                            record.value,
                            record.source_version,
                            now
                        ])?;
                        result.updated += 1;
                    }
                    Some(_) => result.skipped += 1,
                }
            }
        }

        tx.commit()?;
        debug!(
            "Upsert for '{}': {} inserted, {} updated, {} skipped",
            entity_id, result.inserted, result.updated, result.skipped
        );
        Ok(result)
    }

    pub fn get_watermark(&self, entity_id: &str) -> Result<Option<Watermark>, PipelineError> {
        let conn = self.conn.lock();
        let wm = conn
            .query_row(
                "SELECT last_seen_timestamp, last_fetch_run_id
                 FROM watermarks WHERE entity_id = ?1",
                params![entity_id],
                |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                },
            )
            .optional()?
            .map(|(ts, run_id)| Watermark {
                entity_id: entity_id.to_string(),
                last_seen_timestamp: from_unix(ts),
                last_fetch_run_id: run_id,
            });
        Ok(wm)
    }

    /// Advance (or, in backfill mode only, rewind) an entity's watermark.
    pub fn advance_watermark(
        &self,
        entity_id: &str,
        new_timestamp: DateTime<Utc>,
        run_id: &str,
        backfill: bool,
    ) -> Result<(), PipelineError> {
        let current = self.get_watermark(entity_id)?;
        if let Some(ref wm) = current {
            if new_timestamp < wm.last_seen_timestamp && !backfill {
                return Err(PipelineError::WatermarkRegression {
                    entity_id: entity_id.to_string(),
                    current: wm.last_seen_timestamp,
                    attempted: new_timestamp,
                });
            }
        }

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO watermarks (entity_id, last_seen_timestamp, last_fetch_run_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_id) DO UPDATE SET
                 last_seen_timestamp = excluded.last_seen_timestamp,
                 last_fetch_run_id = excluded.last_fetch_run_id",
            params![entity_id, new_timestamp.timestamp(), run_id],
        )?;
        debug!(
            "Watermark for '{}' -> {} (run {}{})",
            entity_id,
            new_timestamp,
            run_id,
            if backfill { ", backfill" } else { "" }
        );
        Ok(())
    }

    /// Number of records reconciled (inserted or updated) strictly after
    /// `since`. Drives the forecast volume trigger: it counts arrival, not
    /// observation timestamps, so late backfills still register as new data.
    pub fn count_reconciled_since(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, PipelineError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE entity_id = ?1 AND reconciled_at > ?2",
            params![entity_id, since.timestamp()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Full reconciled series for an entity, timestamp-ascending.
    pub fn series(&self, entity_id: &str) -> Result<Vec<(DateTime<Utc>, f64)>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, value FROM records
             WHERE entity_id = ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![entity_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|(ts, v)| (from_unix(ts), v)).collect())
    }

    /// Append a completed forecast run. Runs are never mutated; a later run
    /// supersedes by `generated_at` ordering.
    pub fn record_forecast_run(&self, run: &ForecastRun) -> Result<(), PipelineError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO forecast_runs (run_id, entity_id, generated_at) VALUES (?1, ?2, ?3)",
            params![run.run_id, run.entity_id, run.generated_at.timestamp()],
        )?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO forecast_points (run_id, timestamp, predicted_value)
                 VALUES (?1, ?2, ?3)",
            )?;
            for point in &run.horizon {
                insert.execute(params![
                    run.run_id,
                    point.timestamp.timestamp(),
                    point.predicted_value
                ])?;
            }
        }
        tx.commit()?;
        info!(
            "Persisted forecast run {} for '{}' ({} horizon points)",
            run.run_id,
            run.entity_id,
            run.horizon.len()
        );
        Ok(())
    }

    /// Most recent forecast run for an entity, with its horizon.
    pub fn latest_forecast_run(
        &self,
        entity_id: &str,
    ) -> Result<Option<ForecastRun>, PipelineError> {
        let conn = self.conn.lock();
        let head = conn
            .query_row(
                "SELECT run_id, generated_at FROM forecast_runs
                 WHERE entity_id = ?1 ORDER BY generated_at DESC, run_id DESC LIMIT 1",
                params![entity_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let (run_id, generated_at) = match head {
            Some(h) => h,
            None => return Ok(None),
        };

        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, predicted_value FROM forecast_points
             WHERE run_id = ?1 ORDER BY timestamp ASC",
        )?;
        let horizon = stmt
            .query_map(params![run_id], |row| {
                Ok(ForecastPoint {
                    timestamp: from_unix(row.get::<_, i64>(0)?),
                    predicted_value: row.get::<_, f64>(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ForecastRun {
            entity_id: entity_id.to_string(),
            run_id,
            generated_at: from_unix(generated_at),
            horizon,
        }))
    }

    /// Total reconciled records for an entity.
    pub fn record_count(&self, entity_id: &str) -> Result<usize, PipelineError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE entity_id = ?1",
            params![entity_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn from_unix(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}
