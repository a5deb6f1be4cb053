// src/lib.rs
//! BeeAgent core: work queue, decision engine, tick runner and retrain trigger
//! for an autonomous beehive-monitoring agent.

pub mod commands;
pub mod config;
pub mod domain;
pub mod error;
pub mod runners;
pub mod services;
pub mod utils;

pub use commands::{Agent, AgentStatus, InitReport, ObservationResult, SettingsUpdate};
pub use config::CoreConfig;
pub use domain::{
    ActionType, FeatureVector, NewObservation, Observation, ObservationId, ObservationStatus,
    Prediction, SystemSettings,
};
pub use error::{AgentError, Result};
