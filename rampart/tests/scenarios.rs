//! End-to-end login, reputation, rate limit and admin flows against a manual clock.

use std::sync::Arc;

use chrono::Duration;
use rampart::{
    AdminAction, AuditQuery, BruteForceConfig, LoginDenied, ManualClock, Rampart,
    RampartBuilder, SecurityEventType, Severity,
};

fn setup() -> (Rampart, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let rampart = RampartBuilder::new()
        .with_clock(clock.clone())
        .build()
        .expect("Failed to build Rampart");
    (rampart, clock)
}

fn events_of(rampart: &Rampart, event_type: SecurityEventType) -> Vec<rampart::AuditEvent> {
    rampart
        .get_audit_logs(&AuditQuery::new().event_type(event_type))
        .unwrap()
}

#[test]
fn test_lockout_after_threshold_failures() {
    let (rampart, _clock) = setup();

    for _ in 0..5 {
        assert!(rampart.check_login("a@x.com", None).is_ok());
        rampart.record_login("a@x.com", None, false).unwrap();
    }

    let (locked, remaining_ms) = rampart.brute_force().is_locked("a@x.com");
    assert!(locked);
    assert_eq!(remaining_ms, 15 * 60 * 1000);

    let denied = rampart.check_login("a@x.com", Some("10.0.0.1"));
    assert_eq!(
        denied,
        Err(LoginDenied::Locked {
            retry_after_ms: 15 * 60 * 1000
        })
    );
    assert_eq!(denied.unwrap_err().retry_after_seconds(), Some(900));

    let attempts = events_of(&rampart, SecurityEventType::LoginAttemptWhileLocked);
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].subject_identifier.as_deref(), Some("a@x.com"));
    assert_eq!(attempts[0].ip.as_deref(), Some("10.0.0.1"));
    assert_eq!(events_of(&rampart, SecurityEventType::AccountLocked).len(), 1);
}

#[test]
fn test_lockout_expires_with_time() {
    let (rampart, clock) = setup();

    for _ in 0..5 {
        rampart.record_login("a@x.com", None, false).unwrap();
    }
    clock.advance(Duration::minutes(10));
    assert!(rampart.check_login("a@x.com", None).is_err());

    clock.advance(Duration::minutes(5));
    assert!(rampart.check_login("a@x.com", None).is_ok());
}

#[test]
fn test_block_then_unblock_ip() {
    let (rampart, _clock) = setup();

    rampart
        .ip_reputation()
        .block_ip("1.2.3.4", "abuse", None, None)
        .unwrap();
    assert!(!rampart.ip_reputation().is_allowed("1.2.3.4"));
    assert!(!rampart.check_ip("1.2.3.4", None));
    assert_eq!(
        rampart.check_login("a@x.com", Some("1.2.3.4")),
        Err(LoginDenied::IpBlocked)
    );
    assert_eq!(
        events_of(&rampart, SecurityEventType::IpBlockedAccessAttempt).len(),
        2
    );

    assert!(
        rampart
            .ip_reputation()
            .unblock_ip("1.2.3.4", "resolved", None)
            .unwrap()
    );
    assert!(rampart.ip_reputation().is_allowed("1.2.3.4"));
    assert!(rampart.check_login("a@x.com", Some("1.2.3.4")).is_ok());
}

#[test]
fn test_blocked_access_is_audited_with_canonical_ip() {
    let (rampart, _clock) = setup();

    rampart
        .ip_reputation()
        .block_ip("1.2.3.4", "abuse", None, None)
        .unwrap();
    assert!(!rampart.check_ip("::ffff:1.2.3.4", None));
    assert!(!rampart.check_ip(" 1.2.3.4", None));

    let attempts = events_of(&rampart, SecurityEventType::IpBlockedAccessAttempt);
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|e| e.ip.as_deref() == Some("1.2.3.4")));
}

#[test]
fn test_unbounded_durations_do_not_overflow() {
    let clock = Arc::new(ManualClock::default());
    let rampart = RampartBuilder::new()
        .with_clock(clock.clone())
        .with_route_class("slow", 1, u64::MAX)
        .with_brute_force_protection(BruteForceConfig {
            failure_threshold: 1,
            lockout_base_duration_ms: u64::MAX / 2,
            lockout_max_duration_ms: u64::MAX,
            ..Default::default()
        })
        .build()
        .expect("Failed to build Rampart");

    assert!(rampart.check_rate_limit("slow", "ip:1.2.3.4").unwrap().allowed);
    let denied = rampart.check_rate_limit("slow", "ip:1.2.3.4").unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after_ms > 0);

    let status = rampart.record_login("a@x.com", None, false).unwrap();
    assert!(status.is_locked);
    assert!(rampart.check_login("a@x.com", None).is_err());

    clock.advance(Duration::days(365));
    rampart.sweep();
    assert!(rampart.brute_force().is_locked("a@x.com").0);
}

#[test]
fn test_rate_limit_denies_call_past_limit() {
    let (rampart, _clock) = setup();
    let limiter = rampart.rate_limiter();

    for call in 1..=10 {
        let decision = limiter
            .check_and_consume("ip:1.2.3.4", 10, Duration::milliseconds(60_000))
            .unwrap();
        assert!(decision.allowed, "call {call} should be allowed");
        assert_eq!(decision.remaining, 10 - call);
    }

    let denied = limiter
        .check_and_consume("ip:1.2.3.4", 10, Duration::milliseconds(60_000))
        .unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after_ms > 0);
    assert!(denied.retry_after_ms <= 60_000);

    let limited = events_of(&rampart, SecurityEventType::RateLimited);
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].ip.as_deref(), Some("1.2.3.4"));
}

#[test]
fn test_rate_limit_route_class() {
    let (rampart, clock) = setup();

    for _ in 0..10 {
        assert!(rampart.check_rate_limit("auth", "ip:5.6.7.8").unwrap().allowed);
    }
    assert!(!rampart.check_rate_limit("auth", "ip:5.6.7.8").unwrap().allowed);

    // Keys are independent
    assert!(rampart.check_rate_limit("auth", "ip:5.6.7.9").unwrap().allowed);

    clock.advance(Duration::minutes(1));
    assert!(rampart.check_rate_limit("auth", "ip:5.6.7.8").unwrap().allowed);
}

#[test]
fn test_rate_limit_rejects_malformed_key() {
    let (rampart, _clock) = setup();

    let err = rampart.check_rate_limit("auth", "").unwrap_err();
    assert!(err.is_validation_error());
}

#[test]
fn test_admin_unlock_records_actor() {
    let (rampart, _clock) = setup();

    for _ in 0..5 {
        rampart.record_login("a@x.com", None, false).unwrap();
    }
    assert!(rampart.brute_force().is_locked("a@x.com").0);

    let outcome = rampart
        .perform_admin_action(
            "admin1",
            AdminAction::Unlock {
                identifier: "a@x.com".to_string(),
            },
        )
        .unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.action, "unlock");
    assert_eq!(outcome.actor_id, "admin1");

    assert!(!rampart.brute_force().is_locked("a@x.com").0);

    let unlocked = events_of(&rampart, SecurityEventType::AccountUnlocked);
    assert_eq!(unlocked.len(), 1);
    assert_eq!(unlocked[0].actor_id.as_deref(), Some("admin1"));
    assert_eq!(unlocked[0].subject_identifier.as_deref(), Some("a@x.com"));
}

#[test]
fn test_unlock_then_single_failure_does_not_relock() {
    let (rampart, _clock) = setup();

    for _ in 0..7 {
        rampart.record_login("a@x.com", None, false).unwrap();
    }
    rampart
        .perform_admin_action(
            "admin1",
            AdminAction::Unlock {
                identifier: "a@x.com".to_string(),
            },
        )
        .unwrap();

    let status = rampart.record_login("a@x.com", None, false).unwrap();
    assert!(!status.is_locked);
    assert_eq!(status.failed_attempts, 1);
}

#[test]
fn test_whitelist_overrides_block() {
    let (rampart, _clock) = setup();

    rampart
        .perform_admin_action(
            "admin1",
            AdminAction::WhitelistIp {
                ip: "9.9.9.9".to_string(),
            },
        )
        .unwrap();

    let err = rampart
        .perform_admin_action(
            "admin1",
            AdminAction::BlockIp {
                ip: "9.9.9.9".to_string(),
                reason: Some("test".to_string()),
                ttl_ms: None,
            },
        )
        .unwrap_err();
    assert!(err.is_whitelist_override());
    assert!(rampart.ip_reputation().is_allowed("9.9.9.9"));

    let rejected = events_of(&rampart, SecurityEventType::IpBlockOverrideRejected);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].severity, Severity::Medium);
    assert_eq!(rejected[0].actor_id.as_deref(), Some("admin1"));
    assert!(events_of(&rampart, SecurityEventType::IpBlocked).is_empty());
}

#[test]
fn test_admin_block_with_ttl() {
    let (rampart, clock) = setup();

    let outcome = rampart
        .perform_admin_action(
            "admin1",
            AdminAction::BlockIp {
                ip: "7.7.7.7".to_string(),
                reason: None,
                ttl_ms: Some(60_000),
            },
        )
        .unwrap();
    let entry = outcome.ip_entry.expect("block returns the entry");
    assert_eq!(entry.reason, "blocked by administrator");
    assert!(!rampart.check_ip("7.7.7.7", None));

    clock.advance(Duration::minutes(1));
    assert!(rampart.check_ip("7.7.7.7", None));
}

#[test]
fn test_admin_actions_on_unknown_targets_are_noops() {
    let (rampart, _clock) = setup();

    let unlock = rampart
        .perform_admin_action(
            "admin1",
            AdminAction::Unlock {
                identifier: "nobody@x.com".to_string(),
            },
        )
        .unwrap();
    assert!(!unlock.changed);

    let unblock = rampart
        .perform_admin_action(
            "admin1",
            AdminAction::UnblockIp {
                ip: "4.4.4.4".to_string(),
                reason: None,
            },
        )
        .unwrap();
    assert!(!unblock.changed);

    assert!(rampart.audit().is_empty());
}

#[test]
fn test_admin_action_validation() {
    let (rampart, _clock) = setup();

    let err = rampart
        .perform_admin_action(
            "  ",
            AdminAction::Unlock {
                identifier: "a@x.com".to_string(),
            },
        )
        .unwrap_err();
    assert!(err.is_validation_error());

    let err = rampart
        .perform_admin_action(
            "admin1",
            AdminAction::BlockIp {
                ip: "not-an-ip".to_string(),
                reason: None,
                ttl_ms: None,
            },
        )
        .unwrap_err();
    assert!(err.is_validation_error());

    let err = rampart
        .perform_admin_action(
            "admin1",
            AdminAction::BlockIp {
                ip: "1.1.1.1".to_string(),
                reason: None,
                ttl_ms: Some(0),
            },
        )
        .unwrap_err();
    assert!(err.is_validation_error());
}

#[test]
fn test_cross_account_lockouts_block_ip() {
    let clock = Arc::new(ManualClock::default());
    let rampart = RampartBuilder::new()
        .with_clock(clock)
        .with_brute_force_protection(BruteForceConfig {
            failure_threshold: 2,
            auto_block_threshold: 3,
            ..Default::default()
        })
        .build()
        .unwrap();

    for user in ["a@x.com", "b@x.com", "c@x.com"] {
        for _ in 0..2 {
            rampart.record_login(user, Some("6.6.6.6"), false).unwrap();
        }
    }

    assert!(!rampart.check_ip("6.6.6.6", None));
    assert_eq!(events_of(&rampart, SecurityEventType::IpAutoBlocked).len(), 1);
}

#[test]
fn test_audit_logs_newest_first_by_type() {
    let (rampart, clock) = setup();

    for user in ["a@x.com", "b@x.com", "c@x.com"] {
        rampart.record_login(user, None, false).unwrap();
        rampart.record_login(user, None, true).unwrap();
        clock.advance(Duration::seconds(1));
    }

    let failures = events_of(&rampart, SecurityEventType::LoginFailure);
    assert_eq!(failures.len(), 3);
    assert!(
        failures
            .iter()
            .all(|event| event.event_type == SecurityEventType::LoginFailure)
    );
    assert!(failures.windows(2).all(|w| w[0].sequence > w[1].sequence));
    assert_eq!(failures[0].subject_identifier.as_deref(), Some("c@x.com"));

    let for_user = rampart
        .get_audit_logs(&AuditQuery::new().user_id("b@x.com"))
        .unwrap();
    assert_eq!(for_user.len(), 2);
}

#[test]
fn test_security_overview_reflects_activity() {
    let (rampart, _clock) = setup();

    for _ in 0..5 {
        rampart.record_login("a@x.com", None, false).unwrap();
    }
    rampart
        .ip_reputation()
        .block_ip("1.2.3.4", "abuse", None, None)
        .unwrap();

    let stats = rampart.get_brute_force_stats().unwrap();
    assert_eq!(stats.total_locked_accounts, 1);
    assert_eq!(stats.recent_lockouts, 1);

    let overview = rampart.get_security_overview();
    assert_eq!(
        overview.active_ip_blocks.data().map(|blocks| blocks.len()),
        Some(1)
    );
    assert!(overview.top_offenders.is_available());
    assert_eq!(overview.rate_limiter_degraded, 0);
}

#[test]
fn test_concurrent_failures_are_not_lost() {
    let clock = Arc::new(ManualClock::default());
    let rampart = RampartBuilder::new()
        .with_clock(clock)
        .with_brute_force_protection(BruteForceConfig {
            failure_threshold: 1_000,
            ..Default::default()
        })
        .build()
        .unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..25 {
                    rampart.record_login("a@x.com", None, false).unwrap();
                }
            });
        }
    });

    let status = rampart.brute_force().lockout_status("a@x.com");
    assert_eq!(status.failed_attempts, 200);
    assert!(!status.is_locked);
}

#[test]
fn test_sweep_evicts_expired_state() {
    let (rampart, clock) = setup();

    rampart.record_login("a@x.com", None, false).unwrap();
    rampart.check_rate_limit("auth", "ip:1.2.3.4").unwrap();

    clock.advance(Duration::days(2));
    rampart.sweep();

    let stats = rampart.get_brute_force_stats().unwrap();
    assert_eq!(stats.total_tracked_identifiers, 0);
    assert!(rampart.rate_limiter().top_offenders(10).unwrap().is_empty());
}
