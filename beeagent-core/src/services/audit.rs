//! services/audit.rs
//! JSONL audit logbook: processed ticks, component actions and review escalations.
//!
//! - `events.jsonl`  - tick results and retrain results.
//! - `actions.jsonl` - component actions with a severity.
//! - `reviews.jsonl` - observations flagged for a human.
//!
//! Writes are best effort: a failed append is logged and swallowed.

use chrono::Utc;
use serde_json::{Value, json};
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::LogbookConfig;
use crate::domain::{Observation, Prediction};
use crate::utils::logbook::append_jsonl;

#[derive(Debug, Clone)]
pub struct AuditLog {
    enabled: bool,
    dir: PathBuf,
    run_id: Uuid,
}

impl AuditLog {
    pub fn new(cfg: &LogbookConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            dir: cfg.path.clone(),
            run_id: Uuid::new_v4(),
        }
    }

    /// A logbook that writes nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::new(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Append a named event with its payload to `events.jsonl`.
    pub fn record_event(&self, event: &str, data: &Value) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "run_id": self.run_id.to_string(),
            "event": event,
            "data": data
        });
        self.append("events.jsonl", &entry);
    }

    /// Append a component action to `actions.jsonl`.
    ///
    /// # Arguments
    /// * `component` - who acted (e.g. `"feedback"`, `"retrain"`).
    /// * `action` - short verb-ish name.
    /// * `details` - free-form JSON.
    /// * `severity` - `"low" | "medium" | "high"`.
    pub fn record_action(&self, component: &str, action: &str, details: &Value, severity: &str) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "run_id": self.run_id.to_string(),
            "event": "action",
            "component": component,
            "action": action,
            "severity": severity,
            "details": details
        });
        self.append("actions.jsonl", &entry);
    }

    /// Escalate an observation whose prediction needs a human look.
    pub fn record_review(&self, obs: &Observation, prediction: &Prediction) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "run_id": self.run_id.to_string(),
            "event": "review_required",
            "observation_id": obs.id,
            "action": prediction.action,
            "model_action": prediction.model_action,
            "confidence": prediction.confidence,
            "is_exploring": prediction.is_exploring,
            "temperature": obs.temperature,
            "strength": obs.strength,
            "varroa": obs.varroa
        });
        self.append("reviews.jsonl", &entry);
    }

    fn append(&self, file: &str, entry: &Value) {
        if !self.enabled {
            return;
        }
        let path = self.dir.join(file);
        if let Err(e) = append_jsonl(&path, entry) {
            tracing::warn!(path = %path.display(), error = %e, "audit append failed");
        }
    }
}
