// src/domain.rs
//! Domain types shared by the queue, the decision engine and the runners.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Storage-assigned identifier; never changes once the row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(pub i64);

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `Queued -> Processing -> Processed`. Nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationStatus {
    Queued,
    Processing,
    Processed,
}

impl ObservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationStatus::Queued => "queued",
            ObservationStatus::Processing => "processing",
            ObservationStatus::Processed => "processed",
        }
    }
}

impl fmt::Display for ObservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObservationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ObservationStatus::Queued),
            "processing" => Ok(ObservationStatus::Processing),
            "processed" => Ok(ObservationStatus::Processed),
            other => Err(format!("unknown observation status {other:?}")),
        }
    }
}

/// Every action the agent can recommend for a hive.
///
/// Labels are the stable wire/storage names; the classifier, the feedback path
/// and the CLI all speak them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "nista")]
    Nothing,
    #[serde(rename = "priorihrana")]
    EmergencyFeed,
    #[serde(rename = "provjera_varoe")]
    VarroaCheck,
    #[serde(rename = "preseljenje")]
    Relocation,
    #[serde(rename = "berba")]
    Harvest,
    #[serde(rename = "zalivanje")]
    Watering,
    #[serde(rename = "hranjivanje")]
    Feeding,
    #[serde(rename = "prskanje")]
    Spraying,
    #[serde(rename = "povecanje_ramova")]
    IncreaseFrames,
    #[serde(rename = "smanjenje_ramova")]
    DecreaseFrames,
    #[serde(rename = "kontrola_stetocina")]
    PestControl,
    #[serde(rename = "promjena_lokacije")]
    LocationChange,
    #[serde(rename = "provjera_zdravlja")]
    HealthCheck,
    #[serde(rename = "ciscenje_zajednice")]
    ColonyCleaning,
    #[serde(rename = "dodatna_inspekcija")]
    AdditionalInspection,
}

impl ActionType {
    pub const ALL: [ActionType; 15] = [
        ActionType::Nothing,
        ActionType::EmergencyFeed,
        ActionType::VarroaCheck,
        ActionType::Relocation,
        ActionType::Harvest,
        ActionType::Watering,
        ActionType::Feeding,
        ActionType::Spraying,
        ActionType::IncreaseFrames,
        ActionType::DecreaseFrames,
        ActionType::PestControl,
        ActionType::LocationChange,
        ActionType::HealthCheck,
        ActionType::ColonyCleaning,
        ActionType::AdditionalInspection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Nothing => "nista",
            ActionType::EmergencyFeed => "priorihrana",
            ActionType::VarroaCheck => "provjera_varoe",
            ActionType::Relocation => "preseljenje",
            ActionType::Harvest => "berba",
            ActionType::Watering => "zalivanje",
            ActionType::Feeding => "hranjivanje",
            ActionType::Spraying => "prskanje",
            ActionType::IncreaseFrames => "povecanje_ramova",
            ActionType::DecreaseFrames => "smanjenje_ramova",
            ActionType::PestControl => "kontrola_stetocina",
            ActionType::LocationChange => "promjena_lokacije",
            ActionType::HealthCheck => "provjera_zdravlja",
            ActionType::ColonyCleaning => "ciscenje_zajednice",
            ActionType::AdditionalInspection => "dodatna_inspekcija",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        let label = s.trim();
        ActionType::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == label)
            .ok_or_else(|| AgentError::UnknownAction(s.to_string()))
    }
}

// ---------- SQLite column mapping ----------

impl ToSql for ActionType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ActionType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e: AgentError| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for ObservationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ObservationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

// ---------- observations ----------

pub const FEATURE_LEN: usize = 5;

/// `[temperature, humidity, frames, strength, varroa]`, in that order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; FEATURE_LEN]);

/// Producer input, before an id or timestamp exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObservation {
    pub temperature: f64,
    pub humidity: f64,
    pub frames: i64,
    pub strength: i64,
    #[serde(default)]
    pub varroa: bool,
}

impl NewObservation {
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() {
            return Err(AgentError::InvalidObservation(
                "temperature must be a finite number".into(),
            ));
        }
        if !self.humidity.is_finite() {
            return Err(AgentError::InvalidObservation(
                "humidity must be a finite number".into(),
            ));
        }
        if self.frames < 0 {
            return Err(AgentError::InvalidObservation(format!(
                "frames must be >= 0, got {}",
                self.frames
            )));
        }
        if self.strength < 0 {
            return Err(AgentError::InvalidObservation(format!(
                "strength must be >= 0, got {}",
                self.strength
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ObservationId,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub frames: i64,
    pub strength: i64,
    pub varroa: bool,
    pub predicted_action: Option<ActionType>,
    pub confidence: Option<f64>,
    pub status: ObservationStatus,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Observation {
    pub fn features(&self) -> FeatureVector {
        FeatureVector([
            self.temperature,
            self.humidity,
            self.frames as f64,
            self.strength as f64,
            if self.varroa { 1.0 } else { 0.0 },
        ])
    }
}

/// Output of one THINK step. Not persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub observation_id: ObservationId,
    pub action: ActionType,
    /// What the classifier said, even when exploration overrode it.
    pub model_action: ActionType,
    pub confidence: f64,
    pub requires_review: bool,
    pub is_exploring: bool,
}

// ---------- settings ----------

/// The single process-wide settings row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    pub gold_threshold: i64,
    pub enable_retraining: bool,
    pub new_gold_since_last_train: i64,
    pub exploration_rate: f64,
}

impl SystemSettings {
    pub fn should_retrain(&self) -> bool {
        self.enable_retraining && self.new_gold_since_last_train >= self.gold_threshold
    }

    pub fn validate(&self) -> Result<()> {
        if self.gold_threshold < 1 {
            return Err(AgentError::Config(format!(
                "gold_threshold must be >= 1, got {}",
                self.gold_threshold
            )));
        }
        if self.new_gold_since_last_train < 0 {
            return Err(AgentError::Config(format!(
                "new_gold_since_last_train must be >= 0, got {}",
                self.new_gold_since_last_train
            )));
        }
        if !self.exploration_rate.is_finite() || !(0.0..=1.0).contains(&self.exploration_rate) {
            return Err(AgentError::Config(format!(
                "exploration_rate must be within [0, 1], got {}",
                self.exploration_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(temperature: f64, varroa: bool) -> Observation {
        Observation {
            id: ObservationId(1),
            timestamp: Utc::now(),
            temperature,
            humidity: 60.0,
            frames: 10,
            strength: 5,
            varroa,
            predicted_action: None,
            confidence: None,
            status: ObservationStatus::Queued,
            claimed_at: None,
            processed_at: None,
        }
    }

    #[test]
    fn action_labels_parse_back() {
        for a in ActionType::ALL {
            assert_eq!(a.as_str().parse::<ActionType>().unwrap(), a);
        }
        assert!(matches!(
            "dance".parse::<ActionType>(),
            Err(AgentError::UnknownAction(_))
        ));
    }

    #[test]
    fn action_serde_uses_labels() {
        let json = serde_json::to_string(&ActionType::VarroaCheck).unwrap();
        assert_eq!(json, "\"provjera_varoe\"");
    }

    #[test]
    fn features_follow_fixed_order() {
        assert_eq!(obs(20.0, true).features().0, [20.0, 60.0, 10.0, 5.0, 1.0]);
        assert_eq!(obs(20.0, false).features().0[4], 0.0);
    }

    #[test]
    fn new_observation_rejects_negative_counts() {
        let mut o = NewObservation {
            temperature: 20.0,
            humidity: 60.0,
            frames: -1,
            strength: 5,
            varroa: false,
        };
        assert!(o.validate().is_err());
        o.frames = 0;
        assert!(o.validate().is_ok());
        o.strength = -3;
        assert!(o.validate().is_err());
        o.strength = 0;
        o.temperature = f64::NAN;
        assert!(o.validate().is_err());
    }

    #[test]
    fn settings_retrain_condition() {
        let mut s = SystemSettings {
            gold_threshold: 10,
            enable_retraining: true,
            new_gold_since_last_train: 9,
            exploration_rate: 0.05,
        };
        assert!(!s.should_retrain());
        s.new_gold_since_last_train = 10;
        assert!(s.should_retrain());
        s.enable_retraining = false;
        assert!(!s.should_retrain());
    }

    #[test]
    fn settings_validation_rejects_bad_rate() {
        let s = SystemSettings {
            gold_threshold: 10,
            enable_retraining: true,
            new_gold_since_last_train: 0,
            exploration_rate: 1.5,
        };
        assert!(matches!(s.validate(), Err(AgentError::Config(_))));
    }
}
