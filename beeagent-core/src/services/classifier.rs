// src/services/classifier.rs
//! Classifier capability plus a small reference model.
//!
//! The tick engine only needs the `Classifier` trait. `PrototypeClassifier` is the
//! default model so the agent runs out of the box: nearest centroid per action over
//! range-normalised features, updated online with running means and persisted
//! in the agent database so every process shares one copy.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{ActionType, FEATURE_LEN, FeatureVector};
use crate::error::{AgentError, Result};
use crate::services::db::open_connection;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub label: ActionType,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub kind: String,
    pub examples_seen: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Anything that can label a feature vector and learn from corrections.
pub trait Classifier: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<Classification>;

    fn train_one(&mut self, features: &FeatureVector, label: ActionType) -> Result<()>;

    /// Default: length check, then `train_one` per example.
    fn train_batch(&mut self, features: &[FeatureVector], labels: &[ActionType]) -> Result<()> {
        if features.len() != labels.len() {
            return Err(AgentError::Classifier(format!(
                "train_batch got {} feature vectors but {} labels",
                features.len(),
                labels.len()
            )));
        }
        for (x, y) in features.iter().zip(labels) {
            self.train_one(x, *y)?;
        }
        Ok(())
    }

    /// True when a newer copy of the model was persisted by someone else.
    fn is_stale(&self) -> bool {
        false
    }

    /// Replace the in-memory model with the persisted one.
    fn reload(&mut self) -> Result<()> {
        Ok(())
    }

    fn info(&self) -> ModelInfo;
}

/// Many concurrent readers (`predict`), one writer (training).
#[derive(Clone)]
pub struct SharedClassifier {
    inner: Arc<RwLock<Box<dyn Classifier>>>,
}

impl SharedClassifier {
    pub fn new(model: Box<dyn Classifier>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(model)),
        }
    }

    /// Pick up a model persisted by another process before reading it.
    fn refresh(&self) {
        if !self.inner.read().is_stale() {
            return;
        }
        let mut model = self.inner.write();
        if !model.is_stale() {
            return;
        }
        match model.reload() {
            Ok(()) => tracing::info!(examples = model.info().examples_seen, "classifier reloaded"),
            Err(e) => tracing::warn!(error = %e, "classifier reload failed; keeping the loaded copy"),
        }
    }

    pub fn predict(&self, features: &FeatureVector) -> Result<Classification> {
        self.refresh();
        self.inner.read().predict(features)
    }

    pub fn train_one(&self, features: &FeatureVector, label: ActionType) -> Result<()> {
        self.inner.write().train_one(features, label)
    }

    pub fn train_batch(&self, features: &[FeatureVector], labels: &[ActionType]) -> Result<()> {
        self.inner.write().train_batch(features, labels)
    }

    pub fn info(&self) -> ModelInfo {
        self.refresh();
        self.inner.read().info()
    }
}

// ---------- reference model ----------

/// Typical spread of each feature; distances are measured in these units.
const FEATURE_SCALE: [f64; FEATURE_LEN] = [5.0, 10.0, 5.0, 2.0, 1.0];

/// Softmax temperature over negative squared distances. Lower is sharper.
const SOFTMAX_TEMPERATURE: f64 = 0.1;

const MODEL_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Prototype {
    label: ActionType,
    centroid: [f64; FEATURE_LEN],
    count: u64,
}

/// Starting point for each action: `[temperature, humidity, frames, strength, varroa]`.
fn bootstrap_example(action: ActionType) -> [f64; FEATURE_LEN] {
    match action {
        ActionType::Nothing => [20.0, 60.0, 10.0, 5.0, 0.0],
        ActionType::EmergencyFeed => [10.0, 70.0, 5.0, 2.0, 0.0],
        ActionType::VarroaCheck => [22.0, 75.0, 12.0, 6.0, 1.0],
        ActionType::HealthCheck => [25.0, 80.0, 15.0, 4.0, 1.0],
        ActionType::Watering => [33.0, 50.0, 10.0, 6.0, 0.0],
        ActionType::Feeding => [18.0, 65.0, 8.0, 3.0, 0.0],
        ActionType::IncreaseFrames => [20.0, 65.0, 15.0, 9.0, 0.0],
        ActionType::DecreaseFrames => [22.0, 70.0, 25.0, 8.0, 0.0],
        ActionType::AdditionalInspection => [20.0, 70.0, 12.0, 7.0, 0.0],
        _ => [20.0, 65.0, 10.0, 5.0, 0.0],
    }
}

/// Persisted form of the model; stored as JSON in the `classifier_model` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelState {
    format: u32,
    examples_seen: u64,
    updated_at: Option<DateTime<Utc>>,
    prototypes: Vec<Prototype>,
}

impl ModelState {
    fn bootstrap() -> Self {
        let prototypes = ActionType::ALL
            .iter()
            .map(|a| Prototype {
                label: *a,
                centroid: bootstrap_example(*a),
                count: 1,
            })
            .collect();
        Self {
            format: MODEL_FORMAT,
            examples_seen: 0,
            updated_at: None,
            prototypes,
        }
    }

    /// Parse a stored body. Actions missing from it keep their bootstrap prototype.
    fn decode(body: &str) -> Result<Self> {
        let stored: ModelState = serde_json::from_str(body)?;
        if stored.format != MODEL_FORMAT {
            return Err(AgentError::Classifier(format!(
                "unsupported model format {}",
                stored.format
            )));
        }
        let mut state = Self::bootstrap();
        for p in stored.prototypes {
            if let Some(slot) = state.prototypes.iter_mut().find(|s| s.label == p.label) {
                *slot = p;
            }
        }
        state.examples_seen = stored.examples_seen;
        state.updated_at = stored.updated_at;
        Ok(state)
    }

    fn learn(&mut self, features: &FeatureVector, label: ActionType) -> Result<()> {
        if features.0.iter().any(|v| !v.is_finite()) {
            return Err(AgentError::Classifier(format!(
                "non-finite features for {label}: {:?}",
                features.0
            )));
        }
        let Some(proto) = self.prototypes.iter_mut().find(|p| p.label == label) else {
            return Err(AgentError::Classifier(format!("no prototype for {label}")));
        };
        proto.count += 1;
        let n = proto.count as f64;
        for (c, x) in proto.centroid.iter_mut().zip(features.0) {
            *c += (x - *c) / n;
        }
        self.examples_seen += 1;
        self.updated_at = Some(Utc::now());
        Ok(())
    }
}

/// The `classifier_model` row shared by every process on one agent database.
/// `revision` goes up by one on each persisted update.
struct ModelStore {
    db: Mutex<Connection>,
}

impl ModelStore {
    fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        let db = open_connection(db_path, busy_timeout)?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS classifier_model (
              id         INTEGER PRIMARY KEY CHECK (id = 1),
              revision   INTEGER NOT NULL,
              body       TEXT    NOT NULL,
              updated_ms INTEGER NOT NULL
            );
            "#,
        )?;
        let seed = serde_json::to_string(&ModelState::bootstrap())?;
        db.execute(
            "INSERT OR IGNORE INTO classifier_model (id, revision, body, updated_ms)
             VALUES (1, 0, ?1, ?2)",
            params![seed, Utc::now().timestamp_millis()],
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn revision(&self) -> Result<i64> {
        let rev = self.db.lock().query_row(
            "SELECT revision FROM classifier_model WHERE id = 1",
            [],
            |r| r.get(0),
        )?;
        Ok(rev)
    }

    fn load(&self) -> Result<(i64, ModelState)> {
        let (rev, body): (i64, String) = self.db.lock().query_row(
            "SELECT revision, body FROM classifier_model WHERE id = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok((rev, ModelState::decode(&body)?))
    }
}

pub struct PrototypeClassifier {
    state: ModelState,
    revision: i64,
    store: Option<ModelStore>,
}

impl PrototypeClassifier {
    /// In-memory model seeded with one bootstrap prototype per action.
    pub fn bootstrap() -> Self {
        Self {
            state: ModelState::bootstrap(),
            revision: 0,
            store: None,
        }
    }

    /// Load the model persisted in the agent database, seeding it on first use.
    ///
    /// Training is a read-modify-write inside one IMMEDIATE transaction: updates
    /// made by other processes are picked up first, never overwritten.
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        let store = ModelStore::open(db_path, busy_timeout)?;
        let (revision, state) = store.load()?;
        tracing::info!(
            db = %db_path.display(),
            revision,
            examples = state.examples_seen,
            "loaded classifier"
        );
        Ok(Self {
            state,
            revision,
            store: Some(store),
        })
    }

    /// Apply `update` on top of the latest persisted model and write it back.
    fn persist_update<F>(&mut self, update: F) -> Result<()>
    where
        F: FnOnce(&mut ModelState) -> Result<()>,
    {
        let Some(store) = &self.store else {
            return update(&mut self.state);
        };
        let mut db = store.db.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (rev, body): (i64, String) = tx.query_row(
            "SELECT revision, body FROM classifier_model WHERE id = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let mut next = if rev == self.revision {
            self.state.clone()
        } else {
            tracing::debug!(ours = self.revision, stored = rev, "classifier changed elsewhere; merging onto stored copy");
            ModelState::decode(&body)?
        };
        update(&mut next)?;

        let next_rev = rev + 1;
        tx.execute(
            "UPDATE classifier_model SET revision = ?1, body = ?2, updated_ms = ?3 WHERE id = 1",
            params![
                next_rev,
                serde_json::to_string(&next)?,
                Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;
        drop(db);

        self.state = next;
        self.revision = next_rev;
        Ok(())
    }
}

fn scaled_distance(a: &[f64; FEATURE_LEN], b: &[f64; FEATURE_LEN]) -> f64 {
    a.iter()
        .zip(b)
        .zip(FEATURE_SCALE)
        .map(|((x, y), s)| {
            let d = (x - y) / s;
            d * d
        })
        .sum()
}

impl Classifier for PrototypeClassifier {
    fn predict(&self, features: &FeatureVector) -> Result<Classification> {
        if features.0.iter().any(|v| !v.is_finite()) {
            return Err(AgentError::Classifier(format!(
                "non-finite features: {:?}",
                features.0
            )));
        }
        let distances: Vec<(ActionType, f64)> = self
            .state
            .prototypes
            .iter()
            .map(|p| (p.label, scaled_distance(&p.centroid, &features.0)))
            .collect();

        let Some(&(label, best)) = distances
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            return Err(AgentError::Classifier("model has no prototypes".into()));
        };

        // Shift by the best distance so the winning term is exp(0) = 1.
        let total: f64 = distances
            .iter()
            .map(|(_, d)| (-(d - best) / SOFTMAX_TEMPERATURE).exp())
            .sum();
        let confidence = (1.0 / total).clamp(0.0, 1.0);
        Ok(Classification { label, confidence })
    }

    fn train_one(&mut self, features: &FeatureVector, label: ActionType) -> Result<()> {
        self.persist_update(|state| state.learn(features, label))
    }

    fn train_batch(&mut self, features: &[FeatureVector], labels: &[ActionType]) -> Result<()> {
        if features.len() != labels.len() {
            return Err(AgentError::Classifier(format!(
                "train_batch got {} feature vectors but {} labels",
                features.len(),
                labels.len()
            )));
        }
        self.persist_update(|state| {
            for (x, y) in features.iter().zip(labels) {
                state.learn(x, *y)?;
            }
            Ok(())
        })
    }

    fn is_stale(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.revision() {
            Ok(rev) => rev != self.revision,
            Err(e) => {
                tracing::warn!(error = %e, "could not check classifier revision");
                false
            }
        }
    }

    fn reload(&mut self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let (revision, state) = store.load()?;
        self.state = state;
        self.revision = revision;
        Ok(())
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            kind: "prototype".to_string(),
            examples_seen: self.state.examples_seen,
            updated_at: self.state.updated_at,
        }
    }
}
