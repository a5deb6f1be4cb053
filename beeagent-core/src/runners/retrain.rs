// src/runners/retrain.rs
//! Gold-label retrain trigger.
//!
//! Fires when retraining is enabled and the gold counter has reached the
//! threshold. The check is a claim recorded on the settings row, so the
//! daemon's retrain loop and a `beeagent retrain` run from a shell never both
//! train. The counter is only reduced after the trainer succeeds, and only by
//! the amount claimed, so labels that arrive mid-training count toward the
//! next round.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::services::audit::AuditLog;
use crate::services::settings::{RetrainClaim, SettingsStore};
use crate::services::training::Trainer;

/// Default lifetime of a retrain claim before another caller may take it over.
const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrainResult {
    pub model_version: String,
    pub gold_consumed: i64,
    pub gold_remaining: i64,
    pub trained_at: DateTime<Utc>,
}

pub struct RetrainTrigger {
    settings: Arc<SettingsStore>,
    trainer: Arc<dyn Trainer>,
    audit: AuditLog,
    claim_timeout: Duration,
}

impl RetrainTrigger {
    pub fn new(settings: Arc<SettingsStore>, trainer: Arc<dyn Trainer>, audit: AuditLog) -> Self {
        Self {
            settings,
            trainer,
            audit,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    /// Retrain if the threshold is met; `Ok(None)` when not due or when another
    /// caller is already training, with no side effects.
    pub fn maybe_retrain(&self) -> Result<Option<RetrainResult>> {
        match self.settings.claim_retrain(false, self.claim_timeout)? {
            RetrainClaim::Claimed { token, gold } => self.train(&token, gold).map(Some),
            RetrainClaim::InProgress { since_ms } => {
                tracing::debug!(since_ms, "retrain already running elsewhere");
                Ok(None)
            }
            RetrainClaim::NotDue(settings) => {
                tracing::debug!(
                    gold = settings.new_gold_since_last_train,
                    threshold = settings.gold_threshold,
                    enabled = settings.enable_retraining,
                    "retrain not due"
                );
                Ok(None)
            }
        }
    }

    /// Retrain regardless of the threshold (admin path). Consumes whatever the
    /// counter held; fails if another caller is training.
    pub fn force(&self) -> Result<RetrainResult> {
        match self.settings.claim_retrain(true, self.claim_timeout)? {
            RetrainClaim::Claimed { token, gold } => self.train(&token, gold),
            RetrainClaim::InProgress { since_ms } => {
                Err(AgentError::RetrainInProgress { since_ms })
            }
            RetrainClaim::NotDue(_) => Err(AgentError::Training(
                "forced retrain was reported as not due".into(),
            )),
        }
    }

    fn train(&self, token: &str, claimed: i64) -> Result<RetrainResult> {
        tracing::info!(gold = claimed, "retraining model");
        let model_version = match self.trainer.train_model() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, gold = claimed, "retraining failed; gold counter kept");
                if let Err(release) = self.settings.release_retrain(token) {
                    tracing::warn!(error = %release, "could not release retrain claim");
                }
                self.audit.record_action(
                    "retrain",
                    "retrain_failed",
                    &json!({ "error": e.to_string(), "gold": claimed }),
                    "high",
                );
                return Err(e);
            }
        };

        let gold_remaining = self.settings.complete_retrain(token)?;
        let result = RetrainResult {
            model_version,
            gold_consumed: claimed,
            gold_remaining,
            trained_at: Utc::now(),
        };
        tracing::info!(
            version = %result.model_version,
            consumed = claimed,
            remaining = gold_remaining,
            "retrain complete"
        );
        self.audit.record_event("model_retrained", &json!(result));
        Ok(result)
    }
}
