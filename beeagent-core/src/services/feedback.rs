// src/services/feedback.rs
//! Human feedback on predictions.
//!
//! A correction (`correct = false`) is a gold label: the model learns from it
//! right away and the retrain counter goes up by one.

use parking_lot::Mutex;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{ActionType, FeatureVector, ObservationId};
use crate::error::{AgentError, Result};
use crate::services::audit::AuditLog;
use crate::services::classifier::SharedClassifier;
use crate::services::db::open_connection;
use crate::services::queue::WorkQueue;
use crate::services::settings::SettingsStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub observation_id: ObservationId,
    pub user_label: String,
    pub correct: bool,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackReceipt {
    pub feedback_id: i64,
    /// Whether the online update went through.
    pub trained: bool,
    pub new_gold_since_last_train: i64,
}

/// A corrected observation, ready for batch training.
#[derive(Debug, Clone, PartialEq)]
pub struct GoldExample {
    pub feedback_id: i64,
    pub features: FeatureVector,
    pub label: ActionType,
}

pub struct FeedbackStore {
    db: Mutex<Connection>,
}

impl FeedbackStore {
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        let db = open_connection(db_path, busy_timeout)?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS feedback (
              id             INTEGER PRIMARY KEY AUTOINCREMENT,
              observation_id INTEGER NOT NULL,
              user_label     TEXT    NOT NULL,
              correct        INTEGER NOT NULL,
              comment        TEXT,
              created_ms     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_feedback_obs ON feedback(observation_id);
            "#,
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    pub fn insert(
        &self,
        observation_id: ObservationId,
        label: ActionType,
        correct: bool,
        comment: Option<&str>,
    ) -> Result<i64> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock();
        db.execute(
            "INSERT INTO feedback(observation_id, user_label, correct, comment, created_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![observation_id.0, label, correct, comment, now_ms],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Corrections newer than `after_id`, joined with their observation's features.
    pub fn gold_since(&self, after_id: i64) -> Result<Vec<GoldExample>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT f.id, f.user_label, o.temperature, o.humidity, o.frames, o.strength, o.varroa
               FROM feedback f
               JOIN observations o ON o.id = f.observation_id
              WHERE f.correct = 0 AND f.id > ?1
              ORDER BY f.id",
        )?;
        let rows = stmt.query_map(params![after_id], |r| {
            let frames: i64 = r.get(4)?;
            let strength: i64 = r.get(5)?;
            let varroa: bool = r.get(6)?;
            Ok(GoldExample {
                feedback_id: r.get(0)?,
                label: r.get(1)?,
                features: FeatureVector([
                    r.get(2)?,
                    r.get(3)?,
                    frames as f64,
                    strength as f64,
                    if varroa { 1.0 } else { 0.0 },
                ]),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

pub struct FeedbackService {
    queue: Arc<WorkQueue>,
    store: Arc<FeedbackStore>,
    settings: Arc<SettingsStore>,
    classifier: SharedClassifier,
    audit: AuditLog,
}

impl FeedbackService {
    pub fn new(
        queue: Arc<WorkQueue>,
        store: Arc<FeedbackStore>,
        settings: Arc<SettingsStore>,
        classifier: SharedClassifier,
        audit: AuditLog,
    ) -> Self {
        Self {
            queue,
            store,
            settings,
            classifier,
            audit,
        }
    }

    /// Persist feedback; on a correction train once and bump the gold counter once.
    ///
    /// # Errors
    /// * `AgentError::UnknownAction` for an unparseable label.
    /// * `AgentError::NotFound` when the observation does not exist.
    pub fn submit(&self, req: FeedbackRequest) -> Result<FeedbackReceipt> {
        let label: ActionType = req.user_label.parse()?;
        let obs = self
            .queue
            .get(req.observation_id)?
            .ok_or(AgentError::NotFound(req.observation_id))?;

        let feedback_id =
            self.store
                .insert(obs.id, label, req.correct, req.comment.as_deref())?;

        let (trained, gold) = if req.correct {
            (false, self.settings.load()?.new_gold_since_last_train)
        } else {
            // The row is stored either way, so batch retraining still sees it.
            let trained = match self.classifier.train_one(&obs.features(), label) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(observation_id = %obs.id, error = %e, "online training failed");
                    false
                }
            };
            (trained, self.settings.increment_gold()?)
        };

        tracing::info!(
            observation_id = %obs.id,
            feedback_id,
            label = %label,
            correct = req.correct,
            trained,
            gold,
            "feedback recorded"
        );
        self.audit.record_action(
            "feedback",
            "feedback_recorded",
            &json!({
                "feedback_id": feedback_id,
                "observation_id": obs.id,
                "predicted_action": obs.predicted_action,
                "user_label": label,
                "correct": req.correct,
                "trained": trained,
                "new_gold_since_last_train": gold,
            }),
            if req.correct { "low" } else { "medium" },
        );

        Ok(FeedbackReceipt {
            feedback_id,
            trained,
            new_gold_since_last_train: gold,
        })
    }
}
