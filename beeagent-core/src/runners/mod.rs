// src/runners/mod.rs
pub mod retrain;
pub mod scheduler;
pub mod tick;

pub use retrain::{RetrainResult, RetrainTrigger};
pub use scheduler::{
    DrainSummary, LoopConfig, Shutdown, Tick, WorkerHandle, WorkerStats, await_workers, run_once,
    spawn_retrain_loop, spawn_workers,
};
pub use tick::{RunnerStats, TickOutcome, TickResult, TickRunner};
