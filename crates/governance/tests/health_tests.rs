use std::time::Duration;

use chrono::{TimeZone, Utc};
use governance::{BackendKind, CircuitBreakerConfig, HealthStore, InMemoryHealthStore, ManualClock};

fn store(threshold: u32) -> (InMemoryHealthStore, std::sync::Arc<ManualClock>) {
    store_closing_after(threshold, 1)
}

fn store_closing_after(
    threshold: u32,
    successes_to_close: u32,
) -> (InMemoryHealthStore, std::sync::Arc<ManualClock>) {
    let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    let config = CircuitBreakerConfig {
        failure_threshold: threshold,
        cooldown: Duration::from_secs(30),
        half_open_success_threshold: successes_to_close,
    };
    (InMemoryHealthStore::new(config, clock.clone()), clock)
}

#[test]
fn circuit_opens_at_threshold() {
    let (health, _clock) = store(2);
    assert!(!health.record_failure(BackendKind::Claude));
    assert!(health.is_available(BackendKind::Claude));
    assert!(health.record_failure(BackendKind::Claude));
    assert!(!health.is_available(BackendKind::Claude));

    let snapshot = health.snapshot(BackendKind::Claude);
    assert_eq!(snapshot.consecutive_failures, 2);
    assert!(snapshot.circuit_open_until.is_some());
}

#[test]
fn success_resets_failures() {
    let (health, _clock) = store(3);
    health.record_failure(BackendKind::Gemini);
    health.record_failure(BackendKind::Gemini);
    health.record_success(BackendKind::Gemini);
    let snapshot = health.snapshot(BackendKind::Gemini);
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(snapshot.total_failures, 2);
    assert_eq!(snapshot.total_successes, 1);
}

#[test]
fn cooldown_leads_to_half_open_then_closed() {
    let (health, clock) = store(1);
    health.record_failure(BackendKind::Groq);
    assert!(!health.is_available(BackendKind::Groq));

    clock.advance(Duration::from_secs(31));
    assert!(health.is_available(BackendKind::Groq));
    assert!(health.snapshot(BackendKind::Groq).half_open);

    health.record_success(BackendKind::Groq);
    let snapshot = health.snapshot(BackendKind::Groq);
    assert!(!snapshot.half_open);
    assert_eq!(snapshot.consecutive_failures, 0);
}

#[test]
fn half_open_success_resets_failures_before_closing() {
    let (health, clock) = store_closing_after(2, 2);
    health.record_failure(BackendKind::DeepSeek);
    health.record_failure(BackendKind::DeepSeek);
    clock.advance(Duration::from_secs(31));
    assert!(health.is_available(BackendKind::DeepSeek));

    health.record_success(BackendKind::DeepSeek);
    let snapshot = health.snapshot(BackendKind::DeepSeek);
    assert!(snapshot.half_open);
    assert_eq!(snapshot.consecutive_failures, 0);

    health.record_success(BackendKind::DeepSeek);
    assert!(!health.snapshot(BackendKind::DeepSeek).half_open);
}

#[test]
fn failure_while_half_open_reopens() {
    let (health, clock) = store(3);
    for _ in 0..3 {
        health.record_failure(BackendKind::Ollama);
    }
    clock.advance(Duration::from_secs(31));
    assert!(health.is_available(BackendKind::Ollama));
    assert!(health.record_failure(BackendKind::Ollama));
    assert!(!health.is_available(BackendKind::Ollama));
}

#[test]
fn unknown_backends_are_healthy() {
    let (health, _clock) = store(3);
    assert!(health.is_available(BackendKind::Windsurf));
    assert_eq!(health.snapshot(BackendKind::Windsurf).consecutive_failures, 0);
}
