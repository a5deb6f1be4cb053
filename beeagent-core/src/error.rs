// src/error.rs
//! Error taxonomy for the tick engine.
//!
//! - `Storage` is transient: the scheduler backs off and tries again.
//! - `Classifier` fails a single tick; the claimed row stays `processing`.
//! - `Commit` means a result was computed but not persisted (data loss).
//! - `Config` is fatal at startup.

use thiserror::Error;

use crate::domain::{ObservationId, ObservationStatus};

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Backend unavailable, busy past its timeout, or a statement failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The ACT step could not persist a computed result.
    #[error("commit failed for observation {id}: {source}")]
    Commit {
        id: ObservationId,
        #[source]
        source: rusqlite::Error,
    },

    /// A lifecycle write found the row in an unexpected state (or missing).
    #[error("observation {id} is not {expected}")]
    InvalidTransition {
        id: ObservationId,
        expected: ObservationStatus,
    },

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("training error: {0}")]
    Training(String),

    /// Another caller, possibly in another process, holds the retrain claim.
    #[error("a retrain is already in progress (claimed at {since_ms} ms)")]
    RetrainInProgress { since_ms: i64 },

    /// The retrain claim expired and was taken over before this caller finished.
    #[error("retrain claim was lost before the result could be recorded")]
    RetrainClaimLost,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    #[error("unknown action label: {0:?}")]
    UnknownAction(String),

    #[error("observation {0} not found")]
    NotFound(ObservationId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AgentError {
    /// True for failures the loop should absorb with a backoff pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Storage(_))
    }
}
