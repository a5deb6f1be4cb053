// src/services/scoring.rs
//! Decision engine: turns a raw classification into a final action.
//!
//! Pure apart from the injected RNG. Two concerns live here:
//! - exploration: with probability `r` swap the label for a different action;
//! - review gates: flag low-confidence or out-of-envelope hives for a human.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::config::ScoringConfig;
use crate::domain::{ActionType, Observation, Prediction};
use crate::error::{AgentError, Result};
use crate::services::classifier::Classification;

/// Thresholds for the human-review escalation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReviewPolicy {
    pub min_confidence: f64,
    pub temperature_min: f64,
    pub temperature_max: f64,
    pub min_strength: i64,
}

impl ReviewPolicy {
    pub fn from_config(cfg: &ScoringConfig) -> Self {
        Self {
            min_confidence: cfg.min_confidence,
            temperature_min: cfg.temperature_min,
            temperature_max: cfg.temperature_max,
            min_strength: cfg.min_strength,
        }
    }

    /// Each gate is independent; any one of them is enough.
    pub fn requires_review(&self, obs: &Observation, confidence: f64) -> bool {
        confidence < self.min_confidence
            || obs.temperature < self.temperature_min
            || obs.temperature > self.temperature_max
            || obs.strength < self.min_strength
    }
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self::from_config(&ScoringConfig::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    policy: ReviewPolicy,
}

impl DecisionEngine {
    pub fn new(policy: ReviewPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ReviewPolicy {
        &self.policy
    }

    /// Decide the final action for `obs`.
    ///
    /// # Arguments
    /// * `classification` - label and confidence from the classifier.
    /// * `exploration_rate` - probability of exploring; clamped into `[0, 1]`.
    /// * `rng` - randomness source (seeded in tests).
    ///
    /// # Returns
    /// * `Prediction` carrying the classifier's confidence even when exploring.
    /// * `Err(AgentError::Classifier)` if the confidence is not a probability.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        obs: &Observation,
        classification: Classification,
        exploration_rate: f64,
        rng: &mut R,
    ) -> Result<Prediction> {
        let Classification { label, confidence } = classification;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(AgentError::Classifier(format!(
                "confidence {confidence} for {label} is outside [0, 1]"
            )));
        }

        let rate = if exploration_rate.is_nan() {
            0.0
        } else {
            exploration_rate.clamp(0.0, 1.0)
        };

        let is_exploring = rng.gen_range(0.0..1.0) < rate;
        let action = if is_exploring {
            pick_alternative(label, rng)
        } else {
            label
        };

        Ok(Prediction {
            observation_id: obs.id,
            action,
            model_action: label,
            confidence,
            requires_review: self.policy.requires_review(obs, confidence),
            is_exploring,
        })
    }
}

/// Uniform over every action except `label`.
fn pick_alternative<R: Rng + ?Sized>(label: ActionType, rng: &mut R) -> ActionType {
    let others: Vec<ActionType> = ActionType::ALL
        .iter()
        .copied()
        .filter(|a| *a != label)
        .collect();
    others.choose(rng).copied().unwrap_or(label)
}
