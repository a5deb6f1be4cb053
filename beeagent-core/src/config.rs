use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AgentError;

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub retrain: RetrainConfig,
    #[serde(default)]
    pub logbook: LogbookConfig,
}

impl CoreConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<CoreConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using CoreConfig::default().",
                path.display()
            );
            CoreConfig::default()
        };
        cfg.resolve_paths(root);
        cfg.validate()
            .with_context(|| format!("validating config file {}", path.display()))?;
        Ok(cfg)
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.storage.db_path = absolutize(root, &self.storage.db_path);
        self.logbook.path = absolutize(root, &self.logbook.path);
    }

    /// Reject values the engine cannot run with. Called by `load`; bad config is fatal.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.agent.workers == 0 {
            return Err(AgentError::Config("agent.workers must be > 0".into()));
        }
        if self.agent.idle_pause_ms == 0 {
            return Err(AgentError::Config("agent.idle_pause_ms must be > 0".into()));
        }
        let s = &self.scoring;
        if !(0.0..=1.0).contains(&s.min_confidence) {
            return Err(AgentError::Config(format!(
                "scoring.min_confidence must be within [0, 1], got {}",
                s.min_confidence
            )));
        }
        if !(s.temperature_min < s.temperature_max) {
            return Err(AgentError::Config(format!(
                "scoring.temperature_min ({}) must be below temperature_max ({})",
                s.temperature_min, s.temperature_max
            )));
        }
        if !(0.0..=1.0).contains(&s.exploration_rate) {
            return Err(AgentError::Config(format!(
                "scoring.exploration_rate must be within [0, 1], got {}",
                s.exploration_rate
            )));
        }
        if self.retrain.gold_threshold < 1 {
            return Err(AgentError::Config(format!(
                "retrain.gold_threshold must be >= 1, got {}",
                self.retrain.gold_threshold
            )));
        }
        if self.retrain.check_interval_secs == 0 {
            return Err(AgentError::Config(
                "retrain.check_interval_secs must be > 0".into(),
            ));
        }
        if self.retrain.claim_timeout_secs == 0 {
            return Err(AgentError::Config(
                "retrain.claim_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            storage: StorageConfig::default(),
            agent: AgentConfig::default(),
            scoring: ScoringConfig::default(),
            retrain: RetrainConfig::default(),
            logbook: LogbookConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "SystemConfig::default_name")]
    pub name: String,
    #[serde(default = "SystemConfig::default_version")]
    pub version: String,
}

impl SystemConfig {
    fn default_name() -> String {
        "beeagent".to_string()
    }

    fn default_version() -> String {
        "0.1.0".to_string()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            version: Self::default_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_db_path")]
    pub db_path: PathBuf,
    /// Upper bound on how long any statement waits for the SQLite write lock.
    #[serde(default = "StorageConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl StorageConfig {
    fn default_db_path() -> PathBuf {
        PathBuf::from("beeagent.db")
    }

    fn default_busy_timeout_ms() -> u64 {
        5_000
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: Self::default_db_path(),
            busy_timeout_ms: Self::default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "AgentConfig::default_workers")]
    pub workers: usize,
    #[serde(default = "AgentConfig::default_idle_pause_ms")]
    pub idle_pause_ms: u64,
    #[serde(default = "AgentConfig::default_busy_pause_ms")]
    pub busy_pause_ms: u64,
    #[serde(default = "AgentConfig::default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    #[serde(default = "AgentConfig::default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl AgentConfig {
    fn default_workers() -> usize {
        1
    }

    fn default_idle_pause_ms() -> u64 {
        5_000
    }

    fn default_busy_pause_ms() -> u64 {
        100
    }

    fn default_error_backoff_ms() -> u64 {
        1_000
    }

    fn default_status_interval_secs() -> u64 {
        10
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            idle_pause_ms: Self::default_idle_pause_ms(),
            busy_pause_ms: Self::default_busy_pause_ms(),
            error_backoff_ms: Self::default_error_backoff_ms(),
            status_interval_secs: Self::default_status_interval_secs(),
        }
    }
}

// -------------------------------------------------------------------------
// Decision engine thresholds (used by services::scoring)
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "ScoringConfig::default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "ScoringConfig::default_temperature_min")]
    pub temperature_min: f64,
    #[serde(default = "ScoringConfig::default_temperature_max")]
    pub temperature_max: f64,
    #[serde(default = "ScoringConfig::default_min_strength")]
    pub min_strength: i64,
    /// Seeds the settings row the first time the database is created.
    #[serde(default = "ScoringConfig::default_exploration_rate")]
    pub exploration_rate: f64,
    /// Fixed seed for reproducible exploration; entropy when absent.
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

impl ScoringConfig {
    fn default_min_confidence() -> f64 {
        0.6
    }

    fn default_temperature_min() -> f64 {
        5.0
    }

    fn default_temperature_max() -> f64 {
        40.0
    }

    fn default_min_strength() -> i64 {
        3
    }

    fn default_exploration_rate() -> f64 {
        0.05
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_confidence: Self::default_min_confidence(),
            temperature_min: Self::default_temperature_min(),
            temperature_max: Self::default_temperature_max(),
            min_strength: Self::default_min_strength(),
            exploration_rate: Self::default_exploration_rate(),
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrainConfig {
    #[serde(default = "RetrainConfig::default_gold_threshold")]
    pub gold_threshold: i64,
    #[serde(default = "RetrainConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "RetrainConfig::default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// How long a retrain claim on the settings row stays valid. A claim older
    /// than this is treated as abandoned by a crashed process.
    #[serde(default = "RetrainConfig::default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
}

impl RetrainConfig {
    fn default_gold_threshold() -> i64 {
        10
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_check_interval_secs() -> u64 {
        60
    }

    fn default_claim_timeout_secs() -> u64 {
        1800
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            gold_threshold: Self::default_gold_threshold(),
            enabled: Self::default_enabled(),
            check_interval_secs: Self::default_check_interval_secs(),
            claim_timeout_secs: Self::default_claim_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogbookConfig {
    #[serde(default = "LogbookConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "LogbookConfig::default_path")]
    pub path: PathBuf,
}

impl LogbookConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_path() -> PathBuf {
        PathBuf::from("logbook")
    }
}

impl Default for LogbookConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            path: Self::default_path(),
        }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.scoring.min_confidence, 0.6);
        assert_eq!(cfg.scoring.temperature_min, 5.0);
        assert_eq!(cfg.scoring.temperature_max, 40.0);
        assert_eq!(cfg.scoring.min_strength, 3);
        assert_eq!(cfg.retrain.gold_threshold, 10);
        assert_eq!(cfg.retrain.claim_timeout_secs, 1800);
        assert_eq!(cfg.agent.idle_pause_ms, 5_000);
        assert_eq!(cfg.agent.busy_pause_ms, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults_and_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "[agent]\nworkers = 3\n\n[storage]\ndb_path = \"data/hive.db\"\n",
        )
        .unwrap();
        let cfg = CoreConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.agent.workers, 3);
        assert_eq!(cfg.agent.busy_pause_ms, 100);
        assert_eq!(cfg.storage.db_path, dir.path().join("data/hive.db"));
        assert_eq!(cfg.logbook.path, dir.path().join("logbook"));
    }

    #[test]
    fn invalid_values_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "[scoring]\nexploration_rate = 2.0\n",
        )
        .unwrap();
        assert!(CoreConfig::load(dir.path()).is_err());

        fs::write(dir.path().join("config.toml"), "[agent\nworkers = ").unwrap();
        assert!(CoreConfig::load(dir.path()).is_err());
    }
}
