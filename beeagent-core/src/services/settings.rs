// src/services/settings.rs
//! The single `system_settings` row (id = 1).
//!
//! Counter changes are single SQL statements so the feedback path and the
//! retrain trigger can race without losing increments. The row also carries
//! the retrain claim, so check-train-reset is serialized across processes.

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::domain::SystemSettings;
use crate::error::{AgentError, Result};
use crate::services::db::open_connection;

/// Partial admin update; `None` leaves the field as stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub gold_threshold: Option<i64>,
    #[serde(default)]
    pub enable_retraining: Option<bool>,
    #[serde(default)]
    pub exploration_rate: Option<f64>,
    #[serde(default)]
    pub new_gold_since_last_train: Option<i64>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.gold_threshold.is_none()
            && self.enable_retraining.is_none()
            && self.exploration_rate.is_none()
            && self.new_gold_since_last_train.is_none()
    }

    fn apply_to(&self, s: &mut SystemSettings) {
        if let Some(v) = self.gold_threshold {
            s.gold_threshold = v;
        }
        if let Some(v) = self.enable_retraining {
            s.enable_retraining = v;
        }
        if let Some(v) = self.exploration_rate {
            s.exploration_rate = v;
        }
        if let Some(v) = self.new_gold_since_last_train {
            s.new_gold_since_last_train = v;
        }
    }
}

/// Outcome of `SettingsStore::claim_retrain`.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrainClaim {
    /// This caller may train; `gold` is the counter value it will consume.
    Claimed { token: String, gold: i64 },
    /// Another caller (possibly another process) is training right now.
    InProgress { since_ms: i64 },
    /// Threshold not met or retraining disabled.
    NotDue(SystemSettings),
}

pub struct SettingsStore {
    db: Mutex<Connection>,
}

impl SettingsStore {
    /// Open the table and seed the row from config defaults if it does not exist yet.
    pub fn open(db_path: &Path, busy_timeout: Duration, seed: &CoreConfig) -> Result<Self> {
        let db = open_connection(db_path, busy_timeout)?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS system_settings (
              id                        INTEGER PRIMARY KEY CHECK (id = 1),
              gold_threshold            INTEGER NOT NULL,
              enable_retraining         INTEGER NOT NULL,
              new_gold_since_last_train INTEGER NOT NULL DEFAULT 0,
              exploration_rate          REAL    NOT NULL,
              updated_ms                INTEGER NOT NULL,
              -- live retrain claim, NULL when nobody is training
              retrain_claim_id          TEXT,
              retrain_claimed_gold      INTEGER,
              retrain_claimed_ms        INTEGER
            );
            "#,
        )?;
        ensure_columns(&db)?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        // INSERT OR IGNORE keeps an existing row (and its counter) untouched.
        db.execute(
            "INSERT OR IGNORE INTO system_settings
               (id, gold_threshold, enable_retraining, new_gold_since_last_train, exploration_rate, updated_ms)
             VALUES (1, ?1, ?2, 0, ?3, ?4)",
            params![
                seed.retrain.gold_threshold,
                seed.retrain.enabled,
                seed.scoring.exploration_rate,
                now_ms
            ],
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    /// Read and validate the settings row.
    pub fn load(&self) -> Result<SystemSettings> {
        let db = self.db.lock();
        let settings = read_row(&db)?;
        drop(db);
        settings.validate()?;
        Ok(settings)
    }

    /// Read-modify-write inside one IMMEDIATE transaction, so a concurrent
    /// `increment_gold` is never overwritten with a stale counter.
    pub fn update(&self, update: &SettingsUpdate) -> Result<SystemSettings> {
        let mut db = self.db.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut settings = read_row(&tx)?;
        update.apply_to(&mut settings);
        settings.validate()?;
        tx.execute(
            "UPDATE system_settings
                SET gold_threshold = ?1,
                    enable_retraining = ?2,
                    new_gold_since_last_train = ?3,
                    exploration_rate = ?4,
                    updated_ms = ?5
              WHERE id = 1",
            params![
                settings.gold_threshold,
                settings.enable_retraining,
                settings.new_gold_since_last_train,
                settings.exploration_rate,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;
        tracing::info!(?update, "settings updated");
        Ok(settings)
    }

    /// +1 on the gold counter; returns the new value.
    pub fn increment_gold(&self) -> Result<i64> {
        let db = self.db.lock();
        let n = db.query_row(
            "UPDATE system_settings
                SET new_gold_since_last_train = new_gold_since_last_train + 1
              WHERE id = 1
             RETURNING new_gold_since_last_train",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// Claim the right to retrain, checked and recorded in one IMMEDIATE
    /// transaction on the settings row. Every process sharing the database
    /// goes through here, so at most one holds a live claim at a time.
    ///
    /// Without `force` the threshold and `enable_retraining` must allow it.
    /// A claim older than `claim_timeout` is taken over.
    pub fn claim_retrain(&self, force: bool, claim_timeout: Duration) -> Result<RetrainClaim> {
        let mut db = self.db.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let settings = read_row(&tx)?;
        settings.validate()?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let held: Option<(String, i64)> = tx.query_row(
            "SELECT retrain_claim_id, retrain_claimed_ms FROM system_settings WHERE id = 1",
            [],
            |r| Ok(r.get::<_, Option<String>>(0)?.zip(r.get::<_, Option<i64>>(1)?)),
        )?;
        if let Some((holder, since_ms)) = held {
            let age_ms = now_ms.saturating_sub(since_ms);
            if age_ms < claim_timeout.as_millis() as i64 {
                return Ok(RetrainClaim::InProgress { since_ms });
            }
            tracing::warn!(holder = %holder, age_ms, "taking over an abandoned retrain claim");
        }

        if !force && !settings.should_retrain() {
            return Ok(RetrainClaim::NotDue(settings));
        }

        let token = Uuid::new_v4().to_string();
        let gold = settings.new_gold_since_last_train;
        tx.execute(
            "UPDATE system_settings
                SET retrain_claim_id = ?1, retrain_claimed_gold = ?2, retrain_claimed_ms = ?3
              WHERE id = 1",
            params![token, gold, now_ms],
        )?;
        tx.commit()?;
        Ok(RetrainClaim::Claimed { token, gold })
    }

    /// Finish a successful retrain: subtract the claimed labels (floor 0) and
    /// drop the claim, in one statement. Returns what is left on the counter.
    ///
    /// Fails with `RetrainClaimLost` if `token` no longer holds the claim.
    pub fn complete_retrain(&self, token: &str) -> Result<i64> {
        let db = self.db.lock();
        let left = db
            .query_row(
                "UPDATE system_settings
                    SET new_gold_since_last_train =
                          MAX(new_gold_since_last_train - retrain_claimed_gold, 0),
                        retrain_claim_id = NULL,
                        retrain_claimed_gold = NULL,
                        retrain_claimed_ms = NULL
                  WHERE id = 1 AND retrain_claim_id = ?1
                 RETURNING new_gold_since_last_train",
                params![token],
                |r| r.get(0),
            )
            .optional()?;
        left.ok_or(AgentError::RetrainClaimLost)
    }

    /// Drop the claim after a failed retrain; the counter is left as it is.
    pub fn release_retrain(&self, token: &str) -> Result<()> {
        self.db.lock().execute(
            "UPDATE system_settings
                SET retrain_claim_id = NULL, retrain_claimed_gold = NULL, retrain_claimed_ms = NULL
              WHERE id = 1 AND retrain_claim_id = ?1",
            params![token],
        )?;
        Ok(())
    }
}

/// Add columns introduced after a database was first created.
fn ensure_columns(conn: &Connection) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(system_settings)")?;
    let existing: Vec<String> = stmt
        .query_map([], |r| r.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;
    for (name, decl) in [
        ("retrain_claim_id", "TEXT"),
        ("retrain_claimed_gold", "INTEGER"),
        ("retrain_claimed_ms", "INTEGER"),
    ] {
        if !existing.iter().any(|c| c == name) {
            conn.execute_batch(&format!(
                "ALTER TABLE system_settings ADD COLUMN {name} {decl}"
            ))?;
        }
    }
    Ok(())
}

fn read_row(conn: &Connection) -> rusqlite::Result<SystemSettings> {
    conn.query_row(
        "SELECT gold_threshold, enable_retraining, new_gold_since_last_train, exploration_rate
           FROM system_settings WHERE id = 1",
        [],
        |r| {
            Ok(SystemSettings {
                gold_threshold: r.get(0)?,
                enable_retraining: r.get(1)?,
                new_gold_since_last_train: r.get(2)?,
                exploration_rate: r.get(3)?,
            })
        },
    )
}
