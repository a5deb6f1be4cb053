use std::fs;
use std::path::Path;

use beeagent_core::domain::{ActionType, FeatureVector, NewObservation, ObservationStatus};
use beeagent_core::error::{AgentError, Result};
use beeagent_core::runners::{TickOutcome, run_once};
use beeagent_core::services::{Classification, Classifier, FeedbackRequest, ModelInfo};
use beeagent_core::{Agent, SettingsUpdate};
use serde_json::Value;

// ----------------------- Test stubs -----------------------

struct FixedClassifier {
    label: ActionType,
    confidence: f64,
}

impl Classifier for FixedClassifier {
    fn predict(&self, _features: &FeatureVector) -> Result<Classification> {
        Ok(Classification {
            label: self.label,
            confidence: self.confidence,
        })
    }

    fn train_one(&mut self, _features: &FeatureVector, _label: ActionType) -> Result<()> {
        Ok(())
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            kind: "fixed".into(),
            examples_seen: 0,
            updated_at: None,
        }
    }
}

/// Fails on hot hives, answers otherwise.
struct PickyClassifier;

impl Classifier for PickyClassifier {
    fn predict(&self, features: &FeatureVector) -> Result<Classification> {
        if features.0[0] > 30.0 {
            return Err(AgentError::Classifier("sensor drift".into()));
        }
        Ok(Classification {
            label: ActionType::Nothing,
            confidence: 0.9,
        })
    }

    fn train_one(&mut self, _features: &FeatureVector, _label: ActionType) -> Result<()> {
        Ok(())
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            kind: "picky".into(),
            examples_seen: 0,
            updated_at: None,
        }
    }
}

fn write_config(root: &Path) {
    fs::create_dir_all(root).expect("mkdir root");
    fs::write(
        root.join("config.toml"),
        "[scoring]\nrng_seed = 42\n\n[logbook]\nenabled = true\npath = \"logbook\"\n",
    )
    .expect("write config");
}

fn agent_with(root: &Path, model: Box<dyn Classifier>) -> Agent {
    write_config(root);
    let agent = Agent::with_classifier(root, model).expect("open agent");
    agent
        .update_settings(SettingsUpdate {
            exploration_rate: Some(0.0),
            ..Default::default()
        })
        .expect("disable exploration");
    agent
}

fn hive(temperature: f64, strength: i64) -> NewObservation {
    NewObservation {
        temperature,
        humidity: 60.0,
        frames: 10,
        strength,
        varroa: false,
    }
}

fn read_jsonl(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect()
}

// ----------------------- Tests -----------------------

#[test]
fn confident_classification_is_committed_without_review() {
    let dir = tempfile::tempdir().expect("tmp");
    let agent = agent_with(
        dir.path(),
        Box::new(FixedClassifier {
            label: ActionType::Nothing,
            confidence: 0.95,
        }),
    );

    let obs = agent.enqueue(hive(20.0, 5)).expect("enqueue");
    let result = match agent.tick().expect("tick") {
        TickOutcome::Processed(r) => r,
        other => panic!("expected a processed tick, got {other:?}"),
    };
    assert_eq!(result.observation_id, obs.id);
    assert_eq!(result.action, ActionType::Nothing);
    assert_eq!(result.confidence, 0.95);
    assert!(!result.requires_review);
    assert!(!result.is_exploring);
    // Timed from before the claim, so the queue round trip is included.
    assert!(result.elapsed_ms > 0.0);

    let view = agent.result(obs.id).expect("result").expect("exists");
    assert_eq!(view.status, ObservationStatus::Processed);
    assert_eq!(view.action, Some(ActionType::Nothing));
    assert_eq!(view.confidence, Some(0.95));
    assert!(view.processed_at.is_some());

    let events = read_jsonl(&dir.path().join("logbook").join("events.jsonl"));
    assert!(
        events
            .iter()
            .any(|e| e["event"] == "observation_processed"
                && e["data"]["observation_id"] == obs.id.0)
    );

    let stats = agent.status().expect("status").runner;
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.review_required, 0);
    assert!(stats.avg_processing_time_ms > 0.0);
}

#[test]
fn hot_hive_is_escalated_for_review() {
    let dir = tempfile::tempdir().expect("tmp");
    let agent = agent_with(
        dir.path(),
        Box::new(FixedClassifier {
            label: ActionType::Watering,
            confidence: 0.95,
        }),
    );

    let obs = agent.enqueue(hive(45.0, 5)).expect("enqueue");
    let TickOutcome::Processed(result) = agent.tick().expect("tick") else {
        panic!("expected a processed tick");
    };
    assert!(result.requires_review);

    let reviews = read_jsonl(&dir.path().join("logbook").join("reviews.jsonl"));
    let flagged: Vec<_> = reviews
        .iter()
        .filter(|r| r["event"] == "review_required")
        .collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0]["observation_id"], obs.id.0);
    assert_eq!(agent.status().expect("status").runner.review_required, 1);
}

#[test]
fn empty_queue_is_idle() {
    let dir = tempfile::tempdir().expect("tmp");
    let agent = agent_with(
        dir.path(),
        Box::new(FixedClassifier {
            label: ActionType::Nothing,
            confidence: 0.9,
        }),
    );
    assert!(agent.tick().expect("tick").is_idle());
    assert_eq!(agent.status().expect("status").runner.processed, 0);
    assert_eq!(agent.status().expect("status").runner.avg_processing_time_ms, 0.0);
}

#[test]
fn classifier_failure_strands_the_observation() {
    let dir = tempfile::tempdir().expect("tmp");
    let agent = agent_with(dir.path(), Box::new(PickyClassifier));

    let hot = agent.enqueue(hive(35.0, 5)).expect("enqueue");
    let err = agent.tick().unwrap_err();
    assert!(matches!(err, AgentError::Classifier(_)));

    let row = agent.details(hot.id).expect("details").expect("row");
    assert_eq!(row.status, ObservationStatus::Processing);
    assert!(row.predicted_action.is_none());

    let status = agent.status().expect("status");
    assert_eq!(status.runner.skipped, 1);
    assert_eq!(status.queue.processing, 1);

    // The stranded row is not retried; the next tick sees an empty queue.
    assert!(agent.tick().expect("tick").is_idle());
}

#[test]
fn out_of_range_confidence_fails_the_tick() {
    let dir = tempfile::tempdir().expect("tmp");
    let agent = agent_with(
        dir.path(),
        Box::new(FixedClassifier {
            label: ActionType::Nothing,
            confidence: 1.5,
        }),
    );
    agent.enqueue(hive(20.0, 5)).expect("enqueue");
    assert!(matches!(agent.tick(), Err(AgentError::Classifier(_))));
    assert_eq!(agent.status().expect("status").runner.skipped, 1);
}

#[test]
fn drain_mode_processes_everything_and_skips_failures() {
    let dir = tempfile::tempdir().expect("tmp");
    let agent = agent_with(dir.path(), Box::new(PickyClassifier));
    for t in [20.0, 35.0, 21.0, 36.0, 22.0] {
        agent.enqueue(hive(t, 5)).expect("enqueue");
    }
    let summary = run_once(agent.runner().as_ref()).expect("drain");
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.failed, 2);

    let q = agent.status().expect("status").queue;
    assert_eq!(q.processed, 3);
    assert_eq!(q.processing, 2);
    assert_eq!(q.queued, 0);
}

#[test]
fn full_exploration_changes_the_action_but_keeps_confidence() {
    let dir = tempfile::tempdir().expect("tmp");
    let agent = agent_with(
        dir.path(),
        Box::new(FixedClassifier {
            label: ActionType::Nothing,
            confidence: 0.95,
        }),
    );
    agent
        .update_settings(SettingsUpdate {
            exploration_rate: Some(1.0),
            ..Default::default()
        })
        .expect("explore always");

    let obs = agent.enqueue(hive(20.0, 5)).expect("enqueue");
    let TickOutcome::Processed(result) = agent.tick().expect("tick") else {
        panic!("expected a processed tick");
    };
    assert!(result.is_exploring);
    assert_ne!(result.action, ActionType::Nothing);
    assert_eq!(result.model_action, ActionType::Nothing);

    let row = agent.details(obs.id).expect("details").expect("row");
    assert_eq!(row.predicted_action, Some(result.action));
    assert_eq!(row.confidence, Some(0.95));
    assert_eq!(agent.status().expect("status").runner.explored, 1);
}

#[test]
fn settings_survive_reopen() {
    let dir = tempfile::tempdir().expect("tmp");
    {
        let agent = agent_with(
            dir.path(),
            Box::new(FixedClassifier {
                label: ActionType::Nothing,
                confidence: 0.9,
            }),
        );
        agent
            .update_settings(SettingsUpdate {
                gold_threshold: Some(3),
                ..Default::default()
            })
            .expect("update");
    }
    let agent = Agent::open(dir.path()).expect("reopen");
    let s = agent.settings().expect("settings");
    assert_eq!(s.gold_threshold, 3);
    assert_eq!(s.exploration_rate, 0.0);
    assert_eq!(agent.status().expect("status").model.kind, "prototype");
}

#[test]
fn status_snapshot_is_merged_into_status() {
    let dir = tempfile::tempdir().expect("tmp");
    let daemon = agent_with(
        dir.path(),
        Box::new(FixedClassifier {
            label: ActionType::Nothing,
            confidence: 0.9,
        }),
    );
    daemon.enqueue(hive(20.0, 5)).expect("enqueue");
    daemon.tick().expect("tick");
    daemon.write_status_snapshot(true).expect("snapshot");

    // A second handle on the same root sees the daemon's counters.
    let cli = Agent::open(dir.path()).expect("open");
    assert_eq!(cli.status().expect("status").runner.processed, 0);
    let merged = cli.status_merged().expect("merged");
    assert!(merged.is_running);
    assert_eq!(merged.runner.processed, 1);
    assert_eq!(merged.queue.processed, 1);
}

#[test]
fn corrections_from_a_second_handle_reach_the_running_model() {
    let dir = tempfile::tempdir().expect("tmp");
    write_config(dir.path());
    let daemon = Agent::open(dir.path()).expect("daemon");
    let first = daemon.enqueue(hive(20.0, 5)).expect("enqueue");
    daemon.tick().expect("tick");

    // A shell command opens its own handle on the same root.
    let shell = Agent::open(dir.path()).expect("shell");
    let receipt = shell
        .feedback(FeedbackRequest {
            observation_id: first.id,
            user_label: "berba".into(),
            correct: false,
            comment: None,
        })
        .expect("feedback");
    assert!(receipt.trained);
    assert_eq!(daemon.status().expect("status").model.examples_seen, 1);

    let second = daemon.enqueue(hive(21.0, 5)).expect("enqueue");
    daemon.tick().expect("tick");
    daemon
        .feedback(FeedbackRequest {
            observation_id: second.id,
            user_label: "zalivanje".into(),
            correct: false,
            comment: None,
        })
        .expect("feedback");

    let reopened = Agent::open(dir.path()).expect("reopen");
    assert_eq!(reopened.status().expect("status").model.examples_seen, 2);
}
