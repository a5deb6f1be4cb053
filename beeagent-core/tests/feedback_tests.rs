use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use beeagent_core::domain::{ActionType, FeatureVector, NewObservation, ObservationId};
use beeagent_core::error::{AgentError, Result};
use beeagent_core::services::{Classification, Classifier, FeedbackRequest, ModelInfo};
use beeagent_core::{Agent, SettingsUpdate};

// ----------------------- Test stubs -----------------------

#[derive(Default)]
struct Calls {
    train_one: AtomicUsize,
    batch_examples: AtomicUsize,
}

/// Always says `nista`; counts training calls. Optionally refuses online updates.
struct RecordingClassifier {
    calls: Arc<Calls>,
    refuse_online: bool,
}

impl Classifier for RecordingClassifier {
    fn predict(&self, _features: &FeatureVector) -> Result<Classification> {
        Ok(Classification {
            label: ActionType::Nothing,
            confidence: 0.9,
        })
    }

    fn train_one(&mut self, _features: &FeatureVector, _label: ActionType) -> Result<()> {
        if self.refuse_online {
            return Err(AgentError::Classifier("read-only model".into()));
        }
        self.calls.train_one.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn train_batch(&mut self, features: &[FeatureVector], labels: &[ActionType]) -> Result<()> {
        assert_eq!(features.len(), labels.len());
        self.calls
            .batch_examples
            .fetch_add(features.len(), Ordering::SeqCst);
        Ok(())
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            kind: "recording".into(),
            examples_seen: 0,
            updated_at: None,
        }
    }
}

fn open_agent(root: &Path, refuse_online: bool) -> (Agent, Arc<Calls>) {
    fs::create_dir_all(root).expect("mkdir");
    fs::write(
        root.join("config.toml"),
        "[scoring]\nrng_seed = 1\n\n[retrain]\ngold_threshold = 3\n",
    )
    .expect("config");
    let calls = Arc::new(Calls::default());
    let agent = Agent::with_classifier(
        root,
        Box::new(RecordingClassifier {
            calls: Arc::clone(&calls),
            refuse_online,
        }),
    )
    .expect("open agent");
    agent
        .update_settings(SettingsUpdate {
            exploration_rate: Some(0.0),
            ..Default::default()
        })
        .expect("no exploration");
    (agent, calls)
}

fn processed_observation(agent: &Agent) -> ObservationId {
    let obs = agent
        .enqueue(NewObservation {
            temperature: 22.0,
            humidity: 70.0,
            frames: 12,
            strength: 6,
            varroa: true,
        })
        .expect("enqueue");
    agent.tick().expect("tick");
    obs.id
}

fn correction(id: ObservationId, label: &str) -> FeedbackRequest {
    FeedbackRequest {
        observation_id: id,
        user_label: label.to_string(),
        correct: false,
        comment: Some("mites on the bottom board".into()),
    }
}

// ----------------------- Tests -----------------------

#[test]
fn correction_trains_once_and_counts_one_gold_label() {
    let dir = tempfile::tempdir().expect("tmp");
    let (agent, calls) = open_agent(dir.path(), false);
    let id = processed_observation(&agent);

    let receipt = agent
        .feedback(correction(id, "provjera_varoe"))
        .expect("feedback");
    assert!(receipt.trained);
    assert_eq!(receipt.new_gold_since_last_train, 1);
    assert_eq!(calls.train_one.load(Ordering::SeqCst), 1);
    assert_eq!(agent.settings().expect("settings").new_gold_since_last_train, 1);
}

#[test]
fn confirmation_neither_trains_nor_counts() {
    let dir = tempfile::tempdir().expect("tmp");
    let (agent, calls) = open_agent(dir.path(), false);
    let id = processed_observation(&agent);

    let receipt = agent
        .feedback(FeedbackRequest {
            observation_id: id,
            user_label: "nista".into(),
            correct: true,
            comment: None,
        })
        .expect("feedback");
    assert!(!receipt.trained);
    assert_eq!(receipt.new_gold_since_last_train, 0);
    assert_eq!(calls.train_one.load(Ordering::SeqCst), 0);
}

#[test]
fn unknown_label_and_missing_observation_are_rejected() {
    let dir = tempfile::tempdir().expect("tmp");
    let (agent, calls) = open_agent(dir.path(), false);
    let id = processed_observation(&agent);

    let err = agent.feedback(correction(id, "waggle_dance")).unwrap_err();
    assert!(matches!(err, AgentError::UnknownAction(_)));

    let err = agent
        .feedback(correction(ObservationId(404), "nista"))
        .unwrap_err();
    assert!(matches!(err, AgentError::NotFound(ObservationId(404))));

    assert_eq!(calls.train_one.load(Ordering::SeqCst), 0);
    assert_eq!(agent.settings().expect("settings").new_gold_since_last_train, 0);
}

#[test]
fn failed_online_update_still_counts_the_gold_label() {
    let dir = tempfile::tempdir().expect("tmp");
    let (agent, _calls) = open_agent(dir.path(), true);
    let id = processed_observation(&agent);

    let receipt = agent.feedback(correction(id, "berba")).expect("feedback");
    assert!(!receipt.trained);
    assert_eq!(receipt.new_gold_since_last_train, 1);
}

#[test]
fn enough_corrections_trigger_a_batch_retrain() {
    let dir = tempfile::tempdir().expect("tmp");
    let (agent, calls) = open_agent(dir.path(), false);

    for label in ["berba", "zalivanje"] {
        let id = processed_observation(&agent);
        agent.feedback(correction(id, label)).expect("feedback");
    }
    assert!(agent.maybe_retrain().expect("check").is_none(), "2 < threshold 3");

    let id = processed_observation(&agent);
    agent.feedback(correction(id, "prskanje")).expect("feedback");

    let res = agent.maybe_retrain().expect("retrain").expect("fired");
    assert_eq!(res.model_version, "v1");
    assert_eq!(res.gold_consumed, 3);
    assert_eq!(calls.batch_examples.load(Ordering::SeqCst), 3);
    assert_eq!(agent.settings().expect("settings").new_gold_since_last_train, 0);

    // The next version only sees corrections newer than v1.
    let id = processed_observation(&agent);
    agent.feedback(correction(id, "berba")).expect("feedback");
    let res = agent.retrain_now().expect("forced");
    assert_eq!(res.model_version, "v2");
    assert_eq!(calls.batch_examples.load(Ordering::SeqCst), 4);
    assert_eq!(
        agent.status().expect("status").model_version.as_deref(),
        Some("v2")
    );
}

#[test]
fn feedback_is_written_to_the_action_log() {
    let dir = tempfile::tempdir().expect("tmp");
    let (agent, _calls) = open_agent(dir.path(), false);
    let id = processed_observation(&agent);
    agent.feedback(correction(id, "berba")).expect("feedback");

    let text = fs::read_to_string(dir.path().join("logbook").join("actions.jsonl")).expect("log");
    assert!(text.lines().any(|l| l.contains("\"feedback_recorded\"")));
}
