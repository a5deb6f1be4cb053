// src/services/training.rs
//! Batch retraining over accumulated gold labels.

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::services::classifier::SharedClassifier;
use crate::services::db::open_connection;
use crate::services::feedback::FeedbackStore;

/// Fired by the retrain trigger. Returns the new model version identifier.
pub trait Trainer: Send + Sync {
    fn train_model(&self) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelVersion {
    pub version: String,
    pub trained_ms: i64,
    pub examples: i64,
    pub last_feedback_id: i64,
}

/// Trains the shared classifier on every correction since the previous version.
pub struct GoldTrainer {
    db: Mutex<Connection>,
    feedback: Arc<FeedbackStore>,
    classifier: SharedClassifier,
}

impl GoldTrainer {
    pub fn open(
        db_path: &Path,
        busy_timeout: Duration,
        feedback: Arc<FeedbackStore>,
        classifier: SharedClassifier,
    ) -> Result<Self> {
        let db = open_connection(db_path, busy_timeout)?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS model_versions (
              version          INTEGER PRIMARY KEY AUTOINCREMENT,
              trained_ms       INTEGER NOT NULL,
              examples         INTEGER NOT NULL,
              last_feedback_id INTEGER NOT NULL  -- newest feedback row folded into this version
            );
            "#,
        )?;
        Ok(Self {
            db: Mutex::new(db),
            feedback,
            classifier,
        })
    }

    pub fn latest_version(&self) -> Result<Option<ModelVersion>> {
        let db = self.db.lock();
        let row = db
            .query_row(
                "SELECT version, trained_ms, examples, last_feedback_id
                   FROM model_versions ORDER BY version DESC LIMIT 1",
                [],
                |r| {
                    Ok(ModelVersion {
                        version: format!("v{}", r.get::<_, i64>(0)?),
                        trained_ms: r.get(1)?,
                        examples: r.get(2)?,
                        last_feedback_id: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

impl Trainer for GoldTrainer {
    fn train_model(&self) -> Result<String> {
        let since = self
            .latest_version()?
            .map(|v| v.last_feedback_id)
            .unwrap_or(0);
        let gold = self.feedback.gold_since(since)?;

        let features: Vec<_> = gold.iter().map(|g| g.features).collect();
        let labels: Vec<_> = gold.iter().map(|g| g.label).collect();
        if !gold.is_empty() {
            self.classifier
                .train_batch(&features, &labels)
                .map_err(|e| AgentError::Training(e.to_string()))?;
        }

        let last_feedback_id = gold.last().map(|g| g.feedback_id).unwrap_or(since);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock();
        db.execute(
            "INSERT INTO model_versions(trained_ms, examples, last_feedback_id) VALUES (?1, ?2, ?3)",
            params![now_ms, gold.len() as i64, last_feedback_id],
        )?;
        let version = format!("v{}", db.last_insert_rowid());
        drop(db);

        tracing::info!(version = %version, examples = gold.len(), since, "model retrained");
        Ok(version)
    }
}
