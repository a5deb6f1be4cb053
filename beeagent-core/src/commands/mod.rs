// src/commands/mod.rs
pub mod init;
mod api;

pub use api::{Agent, AgentStatus, ObservationResult};
pub use crate::services::feedback::{FeedbackReceipt, FeedbackRequest};
pub use crate::services::settings::SettingsUpdate;
pub use init::{InitReport, ensure_initialized};
