use beeagent_core::domain::{ActionType, Observation, ObservationId, ObservationStatus};
use beeagent_core::error::AgentError;
use beeagent_core::services::{Classification, DecisionEngine, ReviewPolicy};
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;

fn hive(temperature: f64, strength: i64) -> Observation {
    Observation {
        id: ObservationId(1),
        timestamp: Utc::now(),
        temperature,
        humidity: 60.0,
        frames: 10,
        strength,
        varroa: false,
        predicted_action: None,
        confidence: None,
        status: ObservationStatus::Processing,
        claimed_at: None,
        processed_at: None,
    }
}

fn says(label: ActionType, confidence: f64) -> Classification {
    Classification { label, confidence }
}

#[test]
fn zero_rate_never_explores() {
    let engine = DecisionEngine::default();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..1_000 {
        let p = engine
            .decide(&hive(20.0, 5), says(ActionType::Nothing, 0.95), 0.0, &mut rng)
            .expect("decide");
        assert!(!p.is_exploring);
        assert_eq!(p.action, ActionType::Nothing);
        assert_eq!(p.model_action, ActionType::Nothing);
    }
}

#[test]
fn full_rate_always_explores_to_a_different_action() {
    let engine = DecisionEngine::default();
    let mut rng = StdRng::seed_from_u64(11);
    let mut seen = std::collections::HashSet::new();
    for _ in 0..1_000 {
        let p = engine
            .decide(&hive(20.0, 5), says(ActionType::Watering, 0.9), 1.0, &mut rng)
            .expect("decide");
        assert!(p.is_exploring);
        assert_ne!(p.action, ActionType::Watering);
        assert_eq!(p.model_action, ActionType::Watering);
        assert_eq!(p.confidence, 0.9, "confidence stays the classifier's");
        seen.insert(p.action);
    }
    // Uniform over the other 14 actions; 1000 draws should hit all of them.
    assert_eq!(seen.len(), ActionType::ALL.len() - 1);
}

#[test]
fn exploration_frequency_tracks_the_rate() {
    let engine = DecisionEngine::default();
    let mut rng = StdRng::seed_from_u64(2024);
    let n = 20_000;
    let explored = (0..n)
        .filter(|_| {
            engine
                .decide(&hive(20.0, 5), says(ActionType::Nothing, 0.95), 0.25, &mut rng)
                .expect("decide")
                .is_exploring
        })
        .count();
    let freq = explored as f64 / n as f64;
    assert!((freq - 0.25).abs() < 0.02, "frequency {freq}");
}

#[test]
fn out_of_range_rates_are_clamped() {
    let engine = DecisionEngine::default();
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..200 {
        let low = engine
            .decide(&hive(20.0, 5), says(ActionType::Nothing, 0.9), -0.5, &mut rng)
            .expect("decide");
        assert!(!low.is_exploring);
        let high = engine
            .decide(&hive(20.0, 5), says(ActionType::Nothing, 0.9), 3.0, &mut rng)
            .expect("decide");
        assert!(high.is_exploring);
    }
}

#[test]
fn review_gates_fire_independently() {
    let engine = DecisionEngine::default();
    let mut rng = StdRng::seed_from_u64(5);
    let mut review = |temperature: f64, strength: i64, confidence: f64| {
        engine
            .decide(
                &hive(temperature, strength),
                says(ActionType::Nothing, confidence),
                0.0,
                &mut rng,
            )
            .expect("decide")
            .requires_review
    };

    assert!(!review(20.0, 5, 0.9), "healthy hive, confident model");
    assert!(review(20.0, 5, 0.59), "confidence just under the bar");
    assert!(!review(20.0, 5, 0.6), "confidence exactly at the bar");
    assert!(review(4.9, 5, 0.9), "too cold");
    assert!(review(45.0, 5, 0.9), "too hot");
    assert!(!review(40.0, 5, 0.9), "upper bound is inclusive");
    assert!(!review(5.0, 5, 0.9), "lower bound is inclusive");
    assert!(review(20.0, 2, 0.9), "weak colony");
    assert!(!review(20.0, 3, 0.9), "strength at the bar");
}

#[test]
fn review_gate_ignores_the_explored_action() {
    let engine = DecisionEngine::default();
    let mut rng = StdRng::seed_from_u64(8);
    let p = engine
        .decide(&hive(45.0, 5), says(ActionType::Nothing, 0.95), 1.0, &mut rng)
        .expect("decide");
    assert!(p.is_exploring);
    assert!(p.requires_review);
}

#[test]
fn custom_policy_moves_the_gates() {
    let engine = DecisionEngine::new(ReviewPolicy {
        min_confidence: 0.8,
        temperature_min: 10.0,
        temperature_max: 30.0,
        min_strength: 1,
    });
    let mut rng = StdRng::seed_from_u64(1);
    let p = engine
        .decide(&hive(32.0, 2), says(ActionType::Nothing, 0.7), 0.0, &mut rng)
        .expect("decide");
    assert!(p.requires_review);
    let p = engine
        .decide(&hive(20.0, 2), says(ActionType::Nothing, 0.85), 0.0, &mut rng)
        .expect("decide");
    assert!(!p.requires_review);
}

#[test]
fn confidence_outside_unit_interval_is_rejected() {
    let engine = DecisionEngine::default();
    let mut rng = StdRng::seed_from_u64(4);
    for bad in [1.2, -0.1, f64::INFINITY] {
        let out = engine.decide(&hive(20.0, 5), says(ActionType::Nothing, bad), 0.0, &mut rng);
        assert!(matches!(out, Err(AgentError::Classifier(_))), "{bad}");
    }
}
