// src/services/mod.rs

pub mod audit;
pub mod classifier;   // capability trait + reference prototype model
pub mod db;
pub mod feedback;
pub mod queue;        // observations: claim / commit
pub mod scoring;      // decision engine (pure)
pub mod settings;     // system_settings singleton row
pub mod training;

// Public API
pub use audit::AuditLog;
pub use classifier::{Classification, Classifier, ModelInfo, PrototypeClassifier, SharedClassifier};
pub use feedback::{FeedbackReceipt, FeedbackRequest, FeedbackService, FeedbackStore, GoldExample};
pub use queue::{QueueStats, WorkQueue};
pub use scoring::{DecisionEngine, ReviewPolicy};
pub use settings::{RetrainClaim, SettingsStore, SettingsUpdate};
pub use training::{GoldTrainer, ModelVersion, Trainer};
