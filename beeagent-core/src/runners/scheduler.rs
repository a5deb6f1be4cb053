// src/runners/scheduler.rs
//! Worker pool that keeps calling `tick()`.
//!
//! Each worker runs its tick on the blocking pool, then pauses: `busy_pause`
//! after work, `idle_pause` on an empty queue, `error_backoff` after a failure.
//! Every pause races the shutdown signal; a tick already running always finishes.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AgentConfig, RetrainConfig};
use crate::error::{AgentError, Result};
use crate::runners::retrain::RetrainTrigger;
use crate::runners::tick::{TickOutcome, TickRunner};

/// Anything the scheduler can drive one cycle at a time.
pub trait Tick: Send + Sync + 'static {
    fn tick(&self) -> Result<TickOutcome>;
}

impl Tick for TickRunner {
    fn tick(&self) -> Result<TickOutcome> {
        TickRunner::tick(self)
    }
}

/// Cooperative cancellation shared by every loop of one agent process.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub idle_pause: Duration,
    pub busy_pause: Duration,
    pub error_backoff: Duration,
}

impl LoopConfig {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            idle_pause: Duration::from_millis(cfg.idle_pause_ms),
            busy_pause: Duration::from_millis(cfg.busy_pause_ms),
            error_backoff: Duration::from_millis(cfg.error_backoff_ms),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub ticks: u64,
    pub processed: u64,
    pub idle: u64,
    pub failed: u64,
    pub panicked: u64,
}

pub struct WorkerHandle {
    pub worker_id: String,
    pub join_handle: JoinHandle<WorkerStats>,
}

/// Spawn `count` workers sharing one runner.
pub fn spawn_workers<T: Tick>(
    count: usize,
    runner: Arc<T>,
    cfg: LoopConfig,
    shutdown: &Shutdown,
) -> Vec<WorkerHandle> {
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let worker_id = format!("worker-{i}");
        let runner = Arc::clone(&runner);
        let shutdown_rx = shutdown.subscribe();
        let id = worker_id.clone();
        let join_handle =
            tokio::spawn(async move { worker_loop(id, runner, cfg, shutdown_rx).await });
        handles.push(WorkerHandle {
            worker_id,
            join_handle,
        });
    }
    handles
}

/// Tick, pause, repeat until shutdown. Never returns an error.
pub async fn worker_loop<T: Tick>(
    worker_id: String,
    runner: Arc<T>,
    cfg: LoopConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> WorkerStats {
    let mut stats = WorkerStats {
        worker_id: worker_id.clone(),
        ..Default::default()
    };
    tracing::info!(worker = %worker_id, "worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let r = Arc::clone(&runner);
        let joined = tokio::task::spawn_blocking(move || r.tick()).await;
        stats.ticks += 1;

        let pause = match joined {
            Ok(Ok(TickOutcome::Processed(result))) => {
                stats.processed += 1;
                tracing::debug!(
                    worker = %worker_id,
                    observation_id = %result.observation_id,
                    "tick processed"
                );
                cfg.busy_pause
            }
            Ok(Ok(TickOutcome::Idle)) => {
                stats.idle += 1;
                cfg.idle_pause
            }
            Ok(Err(e)) => {
                stats.failed += 1;
                if e.is_transient() {
                    tracing::warn!(worker = %worker_id, error = %e, "tick failed, backing off");
                } else {
                    tracing::error!(worker = %worker_id, error = %e, "tick failed");
                }
                cfg.error_backoff
            }
            Err(join_err) => {
                stats.panicked += 1;
                tracing::error!(worker = %worker_id, error = %join_err, "tick panicked");
                cfg.error_backoff
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // Sender gone: nobody can ever stop us again, so stop now.
                    break;
                }
            }
        }
    }

    tracing::info!(
        worker = %worker_id,
        ticks = stats.ticks,
        processed = stats.processed,
        failed = stats.failed,
        "worker stopped"
    );
    stats
}

/// Periodically call `maybe_retrain` until shutdown.
pub fn spawn_retrain_loop(
    trigger: Arc<RetrainTrigger>,
    interval: Duration,
    shutdown: &Shutdown,
) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown_rx.borrow() {
                break;
            }
            let t = Arc::clone(&trigger);
            match tokio::task::spawn_blocking(move || t.maybe_retrain()).await {
                Ok(Ok(Some(res))) => {
                    tracing::info!(version = %res.model_version, "periodic retrain done")
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "periodic retrain failed"),
                Err(join_err) => tracing::error!(error = %join_err, "retrain panicked"),
            }
        }
        tracing::info!("retrain loop stopped");
    })
}

pub fn retrain_interval(cfg: &RetrainConfig) -> Duration {
    Duration::from_secs(cfg.check_interval_secs)
}

/// Wait for every worker; a worker whose task died still yields (empty) stats.
pub async fn await_workers(handles: Vec<WorkerHandle>) -> Vec<WorkerStats> {
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        match h.join_handle.await {
            Ok(stats) => out.push(stats),
            Err(e) => {
                tracing::error!(worker = %h.worker_id, error = %e, "worker task failed");
                out.push(WorkerStats {
                    worker_id: h.worker_id,
                    ..Default::default()
                });
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub processed: u64,
    pub failed: u64,
}

/// Tick until the queue reports idle (`beeagent run --once`).
///
/// Per-observation failures are counted and draining continues with the next
/// row; anything else (settings, storage) stops the drain.
pub fn run_once<T: Tick + ?Sized>(runner: &T) -> Result<DrainSummary> {
    let mut summary = DrainSummary::default();
    loop {
        match runner.tick() {
            Ok(TickOutcome::Idle) => return Ok(summary),
            Ok(TickOutcome::Processed(_)) => summary.processed += 1,
            Err(
                e @ (AgentError::Classifier(_)
                | AgentError::Commit { .. }
                | AgentError::InvalidTransition { .. }),
            ) => {
                summary.failed += 1;
                tracing::warn!(error = %e, "observation failed during drain");
            }
            Err(e) => return Err(e),
        }
    }
}
