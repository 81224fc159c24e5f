use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use governance::{
    AuditCategory, AuditLog, InMemoryStorage, ManualClock, RateGovernor, RateLimitConfig,
    RateLimitError,
};
use proptest::prelude::*;

fn governor(requests: u32, window_secs: u64, cost_limit: f64) -> (RateGovernor, Arc<ManualClock>, Arc<AuditLog>) {
    let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    let audit = AuditLog::shared(InMemoryStorage::shared(), clock.clone());
    let config = RateLimitConfig {
        requests,
        window_secs,
        cost_limit,
        ..RateLimitConfig::default()
    };
    (RateGovernor::new(&config, audit.clone(), clock.clone()), clock, audit)
}

#[test]
fn one_request_per_minute_scenario() {
    let (governor, clock, audit) = governor(1, 60, 1.00);

    let first = governor.admit("42", 0.10).expect("first admitted");
    governor.settle(&first, 0.10).expect("settle");

    clock.advance(Duration::from_secs(1));
    let err = governor.admit("42", 0.10).expect_err("second denied");
    assert!(matches!(err, RateLimitError::RequestLimit { .. }));

    clock.advance(Duration::from_secs(60));
    governor.admit("42", 0.10).expect("third admitted");

    let denials: Vec<_> = audit
        .recent(10)
        .into_iter()
        .filter(|event| event.category == AuditCategory::Rate)
        .collect();
    assert_eq!(denials.len(), 1);
}

#[test]
fn cost_limit_blocks_admission() {
    let (governor, _clock, _audit) = governor(100, 60, 1.00);
    let permit = governor.admit("7", 0.90).expect("admitted");
    governor.settle(&permit, 0.95).expect("settle");
    let err = governor.admit("7", 0.10).expect_err("over budget");
    assert!(matches!(err, RateLimitError::CostLimit { .. }));
}

#[test]
fn denied_cost_check_does_not_consume_request_slot() {
    let (governor, _clock, _audit) = governor(1, 60, 0.05);
    assert!(governor.admit("7", 0.10).is_err());
    assert_eq!(governor.budget("7").request_count_remaining, 1);
}

#[test]
fn settle_replaces_estimate_and_applies_overage() {
    let (governor, _clock, _audit) = governor(10, 60, 1.00);
    let permit = governor.admit("9", 0.20).expect("admitted");
    assert!((governor.budget("9").cost_spent - 0.20).abs() < 1e-9);

    let spent = governor.settle(&permit, 1.50).expect("settle");
    assert!((spent - 1.50).abs() < 1e-9);
    assert!(governor.budget("9").cost_spent > 1.00);
}

#[test]
fn second_settle_is_rejected_and_leaves_spend_unchanged() {
    let (governor, _clock, _audit) = governor(10, 60, 5.00);
    let permit = governor.admit("9", 0.20).expect("admitted");
    governor.settle(&permit, 0.30).expect("first settle");
    let before = governor.budget("9").cost_spent;

    let err = governor.settle(&permit, 0.30).expect_err("second settle");
    assert_eq!(err, RateLimitError::AlreadySettled(permit.id()));
    assert_eq!(governor.budget("9").cost_spent, before);
}

#[test]
fn dropping_unsettled_permit_refunds_estimate() {
    let (governor, _clock, _audit) = governor(10, 60, 1.00);
    {
        let _permit = governor.admit("3", 0.40).expect("admitted");
        assert!((governor.budget("3").cost_spent - 0.40).abs() < 1e-9);
    }
    assert_eq!(governor.budget("3").cost_spent, 0.0);
    // The request slot stays consumed.
    assert_eq!(governor.budget("3").request_count_remaining, 9);
}

#[test]
fn identities_are_independent() {
    let (governor, _clock, _audit) = governor(1, 60, 1.00);
    governor.admit("a", 0.1).expect("a");
    governor.admit("b", 0.1).expect("b");
    assert!(governor.admit("a", 0.1).is_err());
}

#[test]
fn cost_period_resets() {
    let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    let audit = AuditLog::shared(InMemoryStorage::shared(), clock.clone());
    let config = RateLimitConfig {
        requests: 100,
        window_secs: 60,
        cost_limit: 1.0,
        cost_window_secs: 3600,
        ..RateLimitConfig::default()
    };
    let governor = RateGovernor::new(&config, audit, clock.clone());
    let permit = governor.admit("p", 1.0).expect("admitted");
    governor.settle(&permit, 1.0).expect("settle");
    assert!(governor.admit("p", 0.1).is_err());

    clock.advance(Duration::from_secs(3600));
    governor.admit("p", 0.1).expect("new period");
}

#[test]
fn invalid_estimates_are_rejected() {
    let (governor, _clock, _audit) = governor(10, 60, 1.00);
    assert!(matches!(
        governor.admit("x", -1.0),
        Err(RateLimitError::InvalidCost(_))
    ));
    assert!(matches!(
        governor.admit("x", f64::NAN),
        Err(RateLimitError::InvalidCost(_))
    ));
}

#[test]
fn sweep_forgets_idle_identities() {
    let (governor, clock, _audit) = governor(5, 60, 1.00);
    let permit = governor.admit("idle", 0.0).expect("admitted");
    governor.settle(&permit, 0.0).expect("settle");
    drop(permit);
    assert_eq!(governor.tracked_identities(), 1);

    assert_eq!(governor.sweep(), 0);
    clock.advance(Duration::from_secs(61));
    assert_eq!(governor.sweep(), 1);
    assert_eq!(governor.tracked_identities(), 0);
}

#[test]
fn sweep_keeps_identities_with_outstanding_permits() {
    let (governor, clock, _audit) = governor(5, 60, 1.00);
    let _permit = governor.admit("busy", 0.0).expect("admitted");
    clock.advance(Duration::from_secs(120));
    assert_eq!(governor.sweep(), 0);
    assert_eq!(governor.tracked_identities(), 1);
}

#[test]
fn concurrent_admissions_respect_limit() {
    let (governor, _clock, _audit) = governor(5, 60, 100.0);
    let governor = Arc::new(governor);
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let governor = governor.clone();
            std::thread::spawn(move || governor.admit("shared", 0.01).map(|permit| {
                governor.settle(&permit, 0.01).expect("settle");
            }))
        })
        .collect();
    let admitted = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .filter(Result::is_ok)
        .count();
    assert_eq!(admitted, 5);
}

proptest! {
    #[test]
    fn rolling_window_never_exceeds_limit(
        requests in 1u32..5,
        window_secs in 1u64..30,
        gaps in prop::collection::vec(0u64..20_000, 1..60),
    ) {
        let (governor, clock, _audit) = governor(requests, window_secs, 1_000.0);
        let window_ms = window_secs as i64 * 1000;
        let mut admitted_at: Vec<i64> = Vec::new();
        let mut elapsed_ms = 0i64;
        for gap in gaps {
            clock.advance(Duration::from_millis(gap));
            elapsed_ms += gap as i64;
            if let Ok(permit) = governor.admit("p", 0.0) {
                governor.settle(&permit, 0.0).expect("settle");
                admitted_at.push(elapsed_ms);
            }
        }
        for (i, start) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[i..]
                .iter()
                .take_while(|at| **at - start < window_ms)
                .count();
            prop_assert!(in_window <= requests as usize);
        }
    }
}
