// src/runners/tick.rs
//! One SENSE -> THINK -> ACT cycle.
//!
//! - SENSE: claim the oldest queued observation (storage errors read as "no work").
//! - THINK: classify, then let the decision engine explore / gate for review.
//! - ACT:   commit the action; a failed commit is data loss and is surfaced.
//!
//! Counters live on the runner instance; nothing here is global.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::domain::{ActionType, Observation, ObservationId, Prediction};
use crate::error::Result;
use crate::services::audit::AuditLog;
use crate::services::classifier::SharedClassifier;
use crate::services::queue::WorkQueue;
use crate::services::scoring::DecisionEngine;
use crate::services::settings::SettingsStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickResult {
    pub observation_id: ObservationId,
    pub action: ActionType,
    pub model_action: ActionType,
    pub confidence: f64,
    pub requires_review: bool,
    pub is_exploring: bool,
    pub elapsed_ms: f64,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Idle,
    Processed(TickResult),
}

impl TickOutcome {
    pub fn is_idle(&self) -> bool {
        matches!(self, TickOutcome::Idle)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerStats {
    pub processed: u64,
    pub skipped: u64,
    pub explored: u64,
    pub review_required: u64,
    pub avg_processing_time_ms: f64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    skipped: AtomicU64,
    explored: AtomicU64,
    review_required: AtomicU64,
    processing_micros: AtomicU64,
}

pub struct TickRunner {
    queue: Arc<WorkQueue>,
    settings: Arc<SettingsStore>,
    classifier: SharedClassifier,
    engine: DecisionEngine,
    audit: AuditLog,
    rng: Mutex<StdRng>,
    counters: Counters,
}

impl TickRunner {
    /// Build a runner. `rng_seed` fixes the exploration draws; `None` seeds from entropy.
    pub fn new(
        queue: Arc<WorkQueue>,
        settings: Arc<SettingsStore>,
        classifier: SharedClassifier,
        engine: DecisionEngine,
        audit: AuditLog,
        rng_seed: Option<u64>,
    ) -> Self {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            queue,
            settings,
            classifier,
            engine,
            audit,
            rng: Mutex::new(rng),
            counters: Counters::default(),
        }
    }

    /// Run one cycle.
    ///
    /// # Returns
    /// * `Ok(Idle)` - nothing to claim (or the claim itself failed).
    /// * `Ok(Processed(_))` - one observation went `processing -> processed`.
    /// * `Err(_)` - settings unreadable (nothing claimed), or THINK/ACT failed
    ///   after the claim; the observation stays `processing`.
    pub fn tick(&self) -> Result<TickOutcome> {
        let settings = self.settings.load()?;

        let started = Instant::now();
        let obs = match self.queue.claim_next() {
            Ok(Some(obs)) => obs,
            Ok(None) => return Ok(TickOutcome::Idle),
            Err(e) => {
                tracing::warn!(error = %e, "claim failed; treating as idle");
                return Ok(TickOutcome::Idle);
            }
        };

        let prediction = match self.think(&obs, settings.exploration_rate) {
            Ok(p) => p,
            Err(e) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    observation_id = %obs.id,
                    error = %e,
                    "decision failed; observation left in processing"
                );
                return Err(e);
            }
        };

        if let Err(e) = self
            .queue
            .commit(obs.id, prediction.action, prediction.confidence)
        {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                observation_id = %obs.id,
                action = %prediction.action,
                error = %e,
                "commit failed; computed result lost"
            );
            return Err(e);
        }

        let elapsed = started.elapsed();
        self.record(&prediction, elapsed.as_micros() as u64);

        let result = TickResult {
            observation_id: obs.id,
            action: prediction.action,
            model_action: prediction.model_action,
            confidence: prediction.confidence,
            requires_review: prediction.requires_review,
            is_exploring: prediction.is_exploring,
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            processed_at: Utc::now(),
        };

        tracing::info!(
            observation_id = %obs.id,
            action = %result.action,
            confidence = result.confidence,
            exploring = result.is_exploring,
            review = result.requires_review,
            "observation processed"
        );
        self.audit
            .record_event("observation_processed", &json!(result));
        if prediction.requires_review {
            self.audit.record_review(&obs, &prediction);
        }

        Ok(TickOutcome::Processed(result))
    }

    fn think(&self, obs: &Observation, exploration_rate: f64) -> Result<Prediction> {
        let classification = self.classifier.predict(&obs.features())?;
        let mut rng = self.rng.lock();
        self.engine
            .decide(obs, classification, exploration_rate, &mut *rng)
    }

    fn record(&self, prediction: &Prediction, micros: u64) {
        let c = &self.counters;
        c.processed.fetch_add(1, Ordering::Relaxed);
        c.processing_micros.fetch_add(micros, Ordering::Relaxed);
        if prediction.is_exploring {
            c.explored.fetch_add(1, Ordering::Relaxed);
        }
        if prediction.requires_review {
            c.review_required.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> RunnerStats {
        let c = &self.counters;
        let processed = c.processed.load(Ordering::Relaxed);
        let micros = c.processing_micros.load(Ordering::Relaxed);
        RunnerStats {
            processed,
            skipped: c.skipped.load(Ordering::Relaxed),
            explored: c.explored.load(Ordering::Relaxed),
            review_required: c.review_required.load(Ordering::Relaxed),
            avg_processing_time_ms: if processed == 0 {
                0.0
            } else {
                micros as f64 / processed as f64 / 1000.0
            },
        }
    }
}
