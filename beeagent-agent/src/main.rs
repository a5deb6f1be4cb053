use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{ArgGroup, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use beeagent_core::commands::{FeedbackRequest, ensure_initialized};
use beeagent_core::domain::{NewObservation, ObservationId};
use beeagent_core::runners::scheduler::retrain_interval;
use beeagent_core::runners::{
    LoopConfig, Shutdown, await_workers, run_once, spawn_retrain_loop, spawn_workers,
};
use beeagent_core::{Agent, SettingsUpdate};

#[derive(Parser, Debug)]
#[command(
    name = "beeagent",
    about = "Autonomous beehive agent: claims observations, decides actions, retrains on feedback"
)]
struct Cli {
    /// Agent root (config.toml, database, logbook)
    #[arg(long, global = true, default_value = ".beeagent")]
    root: PathBuf,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create the root layout and a default config.toml
    Init,
    /// Run the tick loop until Ctrl-C
    Run {
        /// Override [agent].workers
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, help = "Drain the queue once then exit")]
        once: bool,
    },
    /// Queue a new hive observation
    Enqueue {
        #[arg(long, allow_negative_numbers = true)]
        temperature: f64,
        #[arg(long)]
        humidity: f64,
        #[arg(long)]
        frames: i64,
        #[arg(long)]
        strength: i64,
        #[arg(long)]
        varroa: bool,
    },
    /// Show the outcome of an observation
    Result {
        id: i64,
        /// Print the full stored row
        #[arg(long)]
        details: bool,
    },
    /// Confirm or correct a prediction
    #[command(group(ArgGroup::new("verdict").required(true).args(["correct", "incorrect"])))]
    Feedback {
        id: i64,
        #[arg(long)]
        label: String,
        #[arg(long)]
        correct: bool,
        #[arg(long)]
        incorrect: bool,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Runner, queue, settings and model status
    Status,
    /// Retrain on accumulated gold labels
    Retrain {
        #[arg(long, help = "Only retrain if the gold threshold is met")]
        if_due: bool,
    },
    /// Show or change system settings
    Settings {
        #[arg(long)]
        gold_threshold: Option<i64>,
        #[arg(long)]
        enable_retraining: Option<bool>,
        #[arg(long)]
        exploration_rate: Option<f64>,
        #[arg(long, help = "Set the gold counter back to 0")]
        reset_gold: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}

fn print_json<T: Serialize>(val: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(val)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let root = cli.root.clone();

    match cli.cmd {
        Cmd::Init => {
            let report = ensure_initialized(&root)?;
            println!("root: {}", report.root.display());
            for c in &report.created {
                println!("  created {c}");
            }
            for e in &report.existed {
                println!("  exists  {e}");
            }
            Ok(())
        }
        Cmd::Run { workers, once } => run(&root, workers, once).await,
        Cmd::Enqueue {
            temperature,
            humidity,
            frames,
            strength,
            varroa,
        } => {
            let agent = Agent::open(&root)?;
            let obs = agent.enqueue(NewObservation {
                temperature,
                humidity,
                frames,
                strength,
                varroa,
            })?;
            print_json(&obs)
        }
        Cmd::Result { id, details } => {
            let agent = Agent::open(&root)?;
            let id = ObservationId(id);
            if details {
                let obs = agent
                    .details(id)?
                    .ok_or_else(|| anyhow!("observation {id} not found"))?;
                print_json(&obs)
            } else {
                let res = agent
                    .result(id)?
                    .ok_or_else(|| anyhow!("observation {id} not found"))?;
                print_json(&res)
            }
        }
        Cmd::Feedback {
            id,
            label,
            correct,
            incorrect,
            comment,
        } => {
            let agent = Agent::open(&root)?;
            let receipt = agent.feedback(FeedbackRequest {
                observation_id: ObservationId(id),
                user_label: label,
                correct: correct && !incorrect,
                comment,
            })?;
            print_json(&receipt)
        }
        Cmd::Status => {
            let agent = Agent::open(&root)?;
            print_json(&agent.status_merged()?)
        }
        Cmd::Retrain { if_due } => {
            let agent = Agent::open(&root)?;
            if if_due {
                match agent.maybe_retrain()? {
                    Some(res) => print_json(&res),
                    None => {
                        println!("retrain not due");
                        Ok(())
                    }
                }
            } else {
                print_json(&agent.retrain_now()?)
            }
        }
        Cmd::Settings {
            gold_threshold,
            enable_retraining,
            exploration_rate,
            reset_gold,
        } => {
            let agent = Agent::open(&root)?;
            let update = SettingsUpdate {
                gold_threshold,
                enable_retraining,
                exploration_rate,
                new_gold_since_last_train: reset_gold.then_some(0),
            };
            print_json(&agent.update_settings(update)?)
        }
    }
}

async fn run(root: &Path, workers: Option<usize>, once: bool) -> Result<()> {
    let agent = Arc::new(Agent::open(root)?);
    let cfg = agent.config().clone();

    if once {
        let runner = agent.runner();
        let summary = tokio::task::spawn_blocking(move || run_once(runner.as_ref()))
            .await
            .context("drain task")??;
        let a = Arc::clone(&agent);
        if let Some(res) = tokio::task::spawn_blocking(move || a.maybe_retrain())
            .await
            .context("retrain task")??
        {
            tracing::info!(version = %res.model_version, "retrained after drain");
        }
        agent.write_status_snapshot(false)?;
        return print_json(&summary);
    }

    let workers = workers.unwrap_or(cfg.agent.workers).max(1);
    let shutdown = Shutdown::new();
    tracing::info!(workers, root = %root.display(), "agent starting");

    let handles = spawn_workers(
        workers,
        agent.runner(),
        LoopConfig::from_config(&cfg.agent),
        &shutdown,
    );
    let retrain = spawn_retrain_loop(agent.trigger(), retrain_interval(&cfg.retrain), &shutdown);
    let status = spawn_status_loop(
        Arc::clone(&agent),
        Duration::from_secs(cfg.agent.status_interval_secs.max(1)),
        &shutdown,
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested; finishing in-flight ticks");
    shutdown.trigger();

    let stats = await_workers(handles).await;
    let _ = retrain.await;
    let _ = status.await;

    let final_status = agent.write_status_snapshot(false)?;
    tracing::info!(
        processed = final_status.runner.processed,
        skipped = final_status.runner.skipped,
        "agent stopped"
    );
    print_json(&stats)
}

/// Periodically write `status.json` so `beeagent status` can see live counters.
fn spawn_status_loop(
    agent: Arc<Agent>,
    every: Duration,
    shutdown: &Shutdown,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            let a = Arc::clone(&agent);
            match tokio::task::spawn_blocking(move || a.write_status_snapshot(true)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "status snapshot failed"),
                Err(e) => tracing::error!(error = %e, "status snapshot panicked"),
            }
            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
    })
}
