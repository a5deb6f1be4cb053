// src/commands/api.rs
use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::commands::init::ensure_initialized;
use crate::config::CoreConfig;
use crate::domain::{
    ActionType, NewObservation, Observation, ObservationId, ObservationStatus, SystemSettings,
};
use crate::error::{AgentError, Result};
use crate::runners::retrain::{RetrainResult, RetrainTrigger};
use crate::runners::tick::{RunnerStats, TickOutcome, TickRunner};
use crate::services::audit::AuditLog;
use crate::services::classifier::{Classifier, ModelInfo, PrototypeClassifier, SharedClassifier};
use crate::services::feedback::{FeedbackReceipt, FeedbackRequest, FeedbackService, FeedbackStore};
use crate::services::queue::{QueueStats, WorkQueue};
use crate::services::scoring::{DecisionEngine, ReviewPolicy};
use crate::services::settings::{SettingsStore, SettingsUpdate};
use crate::services::training::GoldTrainer;
use crate::utils::logbook::write_json_atomic;

const STATUS_FILE: &str = "status.json";

/// What a producer sees when polling an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationResult {
    pub observation_id: ObservationId,
    pub status: ObservationStatus,
    pub action: Option<ActionType>,
    pub confidence: Option<f64>,
    pub enqueued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<&Observation> for ObservationResult {
    fn from(obs: &Observation) -> Self {
        let done = obs.status == ObservationStatus::Processed;
        Self {
            observation_id: obs.id,
            status: obs.status,
            action: if done { obs.predicted_action } else { None },
            confidence: if done { obs.confidence } else { None },
            enqueued_at: obs.timestamp,
            processed_at: if done { obs.processed_at } else { None },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub is_running: bool,
    pub runner: RunnerStats,
    pub queue_size: u64,
    pub queue: QueueStats,
    pub settings: SystemSettings,
    pub model: ModelInfo,
    pub model_version: Option<String>,
}

/// Everything one agent root needs, wired together.
pub struct Agent {
    root: PathBuf,
    config: CoreConfig,
    audit: AuditLog,
    queue: Arc<WorkQueue>,
    settings: Arc<SettingsStore>,
    classifier: SharedClassifier,
    feedback: FeedbackService,
    trainer: Arc<GoldTrainer>,
    runner: Arc<TickRunner>,
    trigger: Arc<RetrainTrigger>,
}

impl Agent {
    /// Initialize `root` if needed, load its config and open every store.
    /// The classifier is the prototype model persisted in the agent database.
    pub fn open(root: &Path) -> AnyResult<Self> {
        ensure_initialized(root)?;
        let config = CoreConfig::load(root)?;
        let model = PrototypeClassifier::open(&config.storage.db_path, config.storage.busy_timeout())
            .with_context(|| {
                format!(
                    "opening classifier in {}",
                    config.storage.db_path.display()
                )
            })?;
        Self::assemble(root, config, Box::new(model))
    }

    /// Same as `open`, with a caller-supplied classifier.
    pub fn with_classifier(root: &Path, classifier: Box<dyn Classifier>) -> AnyResult<Self> {
        ensure_initialized(root)?;
        let config = CoreConfig::load(root)?;
        Self::assemble(root, config, classifier)
    }

    fn assemble(root: &Path, config: CoreConfig, model: Box<dyn Classifier>) -> AnyResult<Self> {
        let db_path = config.storage.db_path.clone();
        let timeout = config.storage.busy_timeout();
        let ctx = || format!("opening database {}", db_path.display());

        let audit = AuditLog::new(&config.logbook);
        let queue = Arc::new(WorkQueue::open(&db_path, timeout).with_context(ctx)?);
        let settings = Arc::new(SettingsStore::open(&db_path, timeout, &config).with_context(ctx)?);
        let feedback_store = Arc::new(FeedbackStore::open(&db_path, timeout).with_context(ctx)?);

        // Fail fast on a corrupted settings row.
        settings
            .load()
            .context("system_settings row is invalid")?;

        let classifier = SharedClassifier::new(model);
        let trainer = Arc::new(
            GoldTrainer::open(
                &db_path,
                timeout,
                Arc::clone(&feedback_store),
                classifier.clone(),
            )
            .with_context(ctx)?,
        );
        let feedback = FeedbackService::new(
            Arc::clone(&queue),
            feedback_store,
            Arc::clone(&settings),
            classifier.clone(),
            audit.clone(),
        );
        let runner = Arc::new(TickRunner::new(
            Arc::clone(&queue),
            Arc::clone(&settings),
            classifier.clone(),
            DecisionEngine::new(ReviewPolicy::from_config(&config.scoring)),
            audit.clone(),
            config.scoring.rng_seed,
        ));
        let trigger = Arc::new(
            RetrainTrigger::new(Arc::clone(&settings), trainer.clone(), audit.clone())
                .with_claim_timeout(config.retrain.claim_timeout()),
        );

        tracing::info!(
            system = %config.system.name,
            version = %config.system.version,
            root = %root.display(),
            db = %db_path.display(),
            run_id = %audit.run_id(),
            "agent opened"
        );
        audit.record_action(
            "agent",
            "opened",
            &json!({
                "system": config.system.name,
                "version": config.system.version,
                "root": root.to_string_lossy(),
                "model": classifier.info(),
            }),
            "low",
        );

        Ok(Self {
            root: root.to_path_buf(),
            config,
            audit,
            queue,
            settings,
            classifier,
            feedback,
            trainer,
            runner,
            trigger,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn runner(&self) -> Arc<TickRunner> {
        Arc::clone(&self.runner)
    }

    pub fn trigger(&self) -> Arc<RetrainTrigger> {
        Arc::clone(&self.trigger)
    }

    // ---------- producer / result ----------

    pub fn enqueue(&self, new: NewObservation) -> Result<Observation> {
        self.queue.enqueue(new)
    }

    pub fn result(&self, id: ObservationId) -> Result<Option<ObservationResult>> {
        Ok(self.queue.get(id)?.as_ref().map(ObservationResult::from))
    }

    pub fn details(&self, id: ObservationId) -> Result<Option<Observation>> {
        self.queue.get(id)
    }

    // ---------- feedback / training ----------

    pub fn feedback(&self, req: FeedbackRequest) -> Result<FeedbackReceipt> {
        self.feedback.submit(req)
    }

    /// Retrain now, regardless of the gold threshold.
    pub fn retrain_now(&self) -> Result<RetrainResult> {
        self.trigger.force()
    }

    pub fn maybe_retrain(&self) -> Result<Option<RetrainResult>> {
        self.trigger.maybe_retrain()
    }

    // ---------- settings ----------

    pub fn settings(&self) -> Result<SystemSettings> {
        self.settings.load()
    }

    pub fn update_settings(&self, update: SettingsUpdate) -> Result<SystemSettings> {
        if update.is_empty() {
            return self.settings.load();
        }
        let updated = self.settings.update(&update)?;
        self.audit.record_action(
            "settings",
            "settings_updated",
            &json!({ "update": update, "settings": updated }),
            "medium",
        );
        Ok(updated)
    }

    // ---------- loop ----------

    pub fn tick(&self) -> Result<TickOutcome> {
        self.runner.tick()
    }

    // ---------- status ----------

    /// Read-only snapshot of this process's view.
    pub fn status(&self) -> Result<AgentStatus> {
        let queue = self.queue.stats()?;
        Ok(AgentStatus {
            generated_at: Utc::now(),
            run_id: self.audit.run_id().to_string(),
            is_running: false,
            runner: self.runner.stats(),
            queue_size: queue.queued,
            queue,
            settings: self.settings.load()?,
            model: self.classifier.info(),
            model_version: self.trainer.latest_version()?.map(|v| v.version),
        })
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    /// Write `status()` to `status.json` (daemon side).
    pub fn write_status_snapshot(&self, is_running: bool) -> Result<AgentStatus> {
        let mut status = self.status()?;
        status.is_running = is_running;
        write_json_atomic(&self.status_path(), &status)
            .map_err(|e| AgentError::Io(std::io::Error::other(format!("{e:#}"))))?;
        Ok(status)
    }

    /// Live status, with runner counters taken from the daemon's snapshot when
    /// one exists. A snapshot older than three status intervals is not running.
    pub fn status_merged(&self) -> Result<AgentStatus> {
        let mut live = self.status()?;
        let Some(snapshot) = read_status_snapshot(&self.status_path()) else {
            return Ok(live);
        };
        let horizon = ChronoDuration::seconds((self.config.agent.status_interval_secs * 3) as i64);
        let fresh = Utc::now() - snapshot.generated_at <= horizon;
        live.runner = snapshot.runner;
        live.run_id = snapshot.run_id;
        live.is_running = snapshot.is_running && fresh;
        Ok(live)
    }
}

fn read_status_snapshot(path: &Path) -> Option<AgentStatus> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable status snapshot");
            None
        }
    }
}
