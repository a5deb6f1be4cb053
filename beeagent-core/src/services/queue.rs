// src/services/queue.rs
//! SQLite-backed work queue for hive observations.
//!
//! - Rows move `queued -> processing -> processed`, never backwards.
//! - `claim_next` is a single `UPDATE ... RETURNING` statement, so two workers
//!   (threads or processes on the same file) can never claim the same row.
//! - `commit` only touches rows that are still `processing`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::domain::{ActionType, NewObservation, Observation, ObservationId, ObservationStatus};
use crate::error::{AgentError, Result};
use crate::services::db::open_connection;

const OBS_COLUMNS: &str = "id, enqueued_ms, temperature, humidity, frames, strength, varroa, \
     predicted_action, confidence, status, claimed_ms, processed_ms";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub queued: u64,
    pub processing: u64,
    pub processed: u64,
}

pub struct WorkQueue {
    db: Mutex<Connection>,
}

impl WorkQueue {
    /// Open/create the queue table in the database at `db_path`.
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        let db = open_connection(db_path, busy_timeout)?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS observations (
              id               INTEGER PRIMARY KEY AUTOINCREMENT,
              enqueued_ms      INTEGER NOT NULL,
              temperature      REAL    NOT NULL,
              humidity         REAL    NOT NULL,
              frames           INTEGER NOT NULL,
              strength         INTEGER NOT NULL,
              varroa           INTEGER NOT NULL,
              predicted_action TEXT,
              confidence       REAL,
              status           TEXT    NOT NULL DEFAULT 'queued'
                               CHECK (status IN ('queued', 'processing', 'processed')),
              claimed_ms       INTEGER,
              processed_ms     INTEGER
            );

            -- claim_next scans queued rows oldest first.
            CREATE INDEX IF NOT EXISTS idx_obs_status_enqueued
              ON observations(status, enqueued_ms, id);
            "#,
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    /// Validate and persist a new observation as `queued`.
    pub fn enqueue(&self, new: NewObservation) -> Result<Observation> {
        new.validate()?;
        let now = Utc::now();
        let enqueued_ms = now.timestamp_millis();

        let db = self.db.lock();
        db.execute(
            "INSERT INTO observations(enqueued_ms, temperature, humidity, frames, strength, varroa, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued')",
            params![
                enqueued_ms,
                new.temperature,
                new.humidity,
                new.frames,
                new.strength,
                new.varroa
            ],
        )?;
        let id = ObservationId(db.last_insert_rowid());
        drop(db);

        tracing::debug!(id = %id, "observation enqueued");
        Ok(Observation {
            id,
            timestamp: from_millis(enqueued_ms).unwrap_or(now),
            temperature: new.temperature,
            humidity: new.humidity,
            frames: new.frames,
            strength: new.strength,
            varroa: new.varroa,
            predicted_action: None,
            confidence: None,
            status: ObservationStatus::Queued,
            claimed_at: None,
            processed_at: None,
        })
    }

    /// Claim the oldest queued observation, or `None` when the queue is empty.
    pub fn claim_next(&self) -> Result<Option<Observation>> {
        let now_ms = Utc::now().timestamp_millis();
        let sql = format!(
            "UPDATE observations
                SET status = 'processing', claimed_ms = ?1
              WHERE id = (SELECT id FROM observations
                           WHERE status = 'queued'
                           ORDER BY enqueued_ms, id
                           LIMIT 1)
                AND status = 'queued'
             RETURNING {OBS_COLUMNS}"
        );
        let db = self.db.lock();
        let claimed = db
            .query_row(&sql, params![now_ms], row_to_observation)
            .optional()?;
        Ok(claimed)
    }

    /// Finish a claimed observation: `processing -> processed` with its result.
    ///
    /// # Errors
    /// * `AgentError::InvalidTransition` if the row is missing or not `processing`.
    /// * `AgentError::Commit` if the write itself fails.
    pub fn commit(&self, id: ObservationId, action: ActionType, confidence: f64) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let db = self.db.lock();
        let changed = db
            .execute(
                "UPDATE observations
                    SET status = 'processed',
                        predicted_action = ?2,
                        confidence = ?3,
                        processed_ms = ?4
                  WHERE id = ?1 AND status = 'processing'",
                params![id.0, action, confidence, now_ms],
            )
            .map_err(|source| AgentError::Commit { id, source })?;
        if changed == 0 {
            return Err(AgentError::InvalidTransition {
                id,
                expected: ObservationStatus::Processing,
            });
        }
        Ok(())
    }

    pub fn get(&self, id: ObservationId) -> Result<Option<Observation>> {
        let sql = format!("SELECT {OBS_COLUMNS} FROM observations WHERE id = ?1");
        let db = self.db.lock();
        let obs = db
            .query_row(&sql, params![id.0], row_to_observation)
            .optional()?;
        Ok(obs)
    }

    /// Number of observations still waiting to be claimed.
    pub fn depth(&self) -> Result<u64> {
        let db = self.db.lock();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM observations WHERE status = 'queued'",
            [],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let db = self.db.lock();
        let mut stmt = db.prepare("SELECT status, COUNT(*) FROM observations GROUP BY status")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, ObservationStatus>(0)?, r.get::<_, i64>(1)?))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, n) = row?;
            let n = n.max(0) as u64;
            match status {
                ObservationStatus::Queued => stats.queued = n,
                ObservationStatus::Processing => stats.processing = n,
                ObservationStatus::Processed => stats.processed = n,
            }
            stats.total += n;
        }
        Ok(stats)
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

fn millis_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        None => Ok(None),
        Some(ms) => from_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
    }
}

fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
    let enqueued_ms: i64 = row.get(1)?;
    let timestamp =
        from_millis(enqueued_ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(1, enqueued_ms))?;
    Ok(Observation {
        id: ObservationId(row.get(0)?),
        timestamp,
        temperature: row.get(2)?,
        humidity: row.get(3)?,
        frames: row.get(4)?,
        strength: row.get(5)?,
        varroa: row.get(6)?,
        predicted_action: row.get(7)?,
        confidence: row.get(8)?,
        status: row.get(9)?,
        claimed_at: millis_column(row, 10)?,
        processed_at: millis_column(row, 11)?,
    })
}
