//! Cooldown guard tests.
//!
//! Tests cover: T2 rejection inside the 60s window, admission after it,
//! T1 zero cooldown, (actor, tier) scoping, rejected draws leaving no
//! trace, previews and pruning.

use closer_draw_core::{
    clock::ManualClock,
    cooldown::{CooldownDecision, CooldownEntry, CooldownGuard},
    error::Audience,
    DrawError, DrawService, DrawSettings, ProbabilityConfig, SqliteStore,
};
use std::sync::Arc;
use std::time::Duration;

fn build(seed: u64) -> (DrawService, Arc<ManualClock>) {
    let store = SqliteStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let service = DrawService::with_clock(store, DrawSettings::seeded(seed), clock.clone());
    service
        .apply_config(ProbabilityConfig::default_test())
        .expect("apply config");
    (service, clock)
}

#[test]
fn second_t2_draw_within_window_is_rejected() {
    let (service, clock) = build(1);
    service.draw("T2", "agent-1").unwrap();

    clock.advance_secs(10);
    let err = service.draw("T2", "agent-1").unwrap_err();

    match &err {
        DrawError::CooldownActive { remaining_seconds, actor_id, tier } => {
            assert_eq!(*remaining_seconds, 50);
            assert_eq!(actor_id, "agent-1");
            assert_eq!(tier, "T2");
        }
        other => panic!("expected CooldownActive, got {other:?}"),
    }
    assert_eq!(err.retry_after(), Some(Duration::from_secs(50)));
    assert!(err.is_retryable());
    assert_eq!(err.audience(), Audience::EndUser);
}

#[test]
fn t2_draw_after_window_succeeds() {
    let (service, clock) = build(2);
    service.draw("T2", "agent-1").unwrap();

    clock.advance_secs(59);
    let err = service.draw("T2", "agent-1").unwrap_err();
    assert!(matches!(err, DrawError::CooldownActive { remaining_seconds: 1, .. }));

    clock.advance_secs(2); // 61s after the first draw
    let result = service.draw("T2", "agent-1").unwrap();
    assert_eq!(result.sequence_id, 2);
}

#[test]
fn t1_has_no_cooldown() {
    let (service, _clock) = build(3);
    for _ in 0..5 {
        service.draw("T1", "agent-1").unwrap();
    }
    assert_eq!(service.recent_history(10).unwrap().len(), 5);
}

#[test]
fn unknown_tier_uses_default_cooldown() {
    let (service, clock) = build(4);
    service.draw("T9", "agent-1").unwrap();
    service.draw("T9", "agent-1").unwrap();

    let config = ProbabilityConfig {
        default_cooldown_secs: 30,
        ..ProbabilityConfig::default_test()
    };
    service.apply_config(config).unwrap();
    service.draw("T9", "agent-1").unwrap();
    clock.advance_secs(5);
    let err = service.draw("T9", "agent-1").unwrap_err();
    assert!(matches!(err, DrawError::CooldownActive { remaining_seconds: 25, .. }));
}

#[test]
fn cooldown_is_scoped_to_actor_and_tier() {
    let (service, _clock) = build(5);
    service.draw("T2", "agent-1").unwrap();

    // Same tier, other actor.
    assert!(service.draw("T2", "agent-2").is_ok());
    // Same actor, other tier.
    assert!(service.draw("T1", "agent-1").is_ok());
    // Same pair is still blocked.
    assert!(matches!(
        service.draw("T2", "agent-1"),
        Err(DrawError::CooldownActive { .. })
    ));
}

#[test]
fn rejected_draw_leaves_no_trace() {
    let (service, clock) = build(6);
    service.draw("T2", "agent-1").unwrap();
    let view_before = service.composition().unwrap();
    let stats_before = service.all_time_distribution().unwrap();

    clock.advance_secs(1);
    assert!(service.draw("T2", "agent-1").is_err());

    assert_eq!(service.composition().unwrap(), view_before);
    assert_eq!(service.all_time_distribution().unwrap(), stats_before);
    assert_eq!(service.recent_history(10).unwrap().len(), 1);
}

#[test]
fn preview_reports_without_reserving() {
    let (service, clock) = build(7);

    assert_eq!(service.cooldown_status("T2", "agent-1").unwrap(), CooldownDecision::Allow);
    assert_eq!(service.cooldown_status("T2", "agent-1").unwrap(), CooldownDecision::Allow);

    service.draw("T2", "agent-1").unwrap();
    clock.advance_secs(15);
    match service.cooldown_status("T2", "agent-1").unwrap() {
        CooldownDecision::Reject { remaining_seconds, .. } => assert_eq!(remaining_seconds, 45),
        other => panic!("expected Reject, got {other:?}"),
    }
}

#[test]
fn expired_entries_are_pruned() {
    let (service, clock) = build(8);
    service.draw("T2", "agent-1").unwrap();
    service.draw("T2", "agent-2").unwrap();
    assert_eq!(service.backend().cooldown_count("default").unwrap(), 2);

    // Still inside both windows.
    assert_eq!(service.prune_expired_cooldowns("default").unwrap(), 0);

    clock.advance_secs(61);
    assert_eq!(service.prune_expired_cooldowns("default").unwrap(), 2);
    assert_eq!(service.backend().cooldown_count("default").unwrap(), 0);

    // Pruning never unblocks a live window.
    service.draw("T2", "agent-1").unwrap();
    assert_eq!(service.prune_expired_cooldowns("default").unwrap(), 0);
    assert!(service.draw("T2", "agent-1").is_err());
}

#[test]
fn tiers_without_a_window_store_no_entry() {
    let (service, _clock) = build(9);
    for i in 0..10 {
        service.draw("T1", &format!("agent-{i}")).unwrap();
    }
    assert_eq!(service.backend().cooldown_count("default").unwrap(), 0);

    service.draw("T2", "agent-1").unwrap();
    assert_eq!(service.backend().cooldown_count("default").unwrap(), 1);
}

#[test]
fn remaining_seconds_round_up() {
    let config = ProbabilityConfig::default_test();
    let start = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
    let entry: CooldownEntry = CooldownGuard::reserve("default", "T2", "agent-1", &config, start);
    assert_eq!(entry.expires_at - entry.last_draw_at, chrono::Duration::seconds(60));

    let now = start + chrono::Duration::milliseconds(10_500);
    match CooldownGuard::check(Some(&entry), now) {
        CooldownDecision::Reject { remaining_seconds, .. } => assert_eq!(remaining_seconds, 50),
        other => panic!("expected Reject, got {other:?}"),
    }
    assert_eq!(
        CooldownGuard::check(Some(&entry), start + chrono::Duration::seconds(60)),
        CooldownDecision::Allow
    );
    assert_eq!(CooldownGuard::check(None, start), CooldownDecision::Allow);
}
