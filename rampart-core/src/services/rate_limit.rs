//! Fixed-window request throttling.
//!
//! Each key owns one counter for the current window. When a request arrives
//! after the window has ended the counter restarts at that request; nothing
//! carries over. This allows a burst of up to twice the limit around a window
//! boundary in exchange for O(1) state per key.
//!
//! Denied requests never count against the window. They count as violations
//! instead, and a key that keeps getting denied inside the escalation window
//! is reported as abusive and, when it names an IP, blocked.
//!
//! If the window state cannot be read or written the request is allowed and
//! the degradation is audited.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{Clock, saturating_add, saturating_sub},
    config::RateLimitConfig,
    error::{StoreError, ValidationError},
    events::{EventDetails, Outcome, SecurityEventType},
    repositories::RateWindowRepository,
    services::{audit::AuditLog, ip_reputation::IpReputationStore},
    storage::{RateDecision, RateWindow, duration_ms},
    validation::{ip_from_rate_key, validate_rate_key},
};

/// A key that was denied recently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateViolation {
    pub key: String,
    pub violations: u32,
    pub limit: u32,
    pub window_size_ms: u64,
    pub last_violation_at: DateTime<Utc>,
}

pub struct RateLimiter {
    repository: Arc<dyn RateWindowRepository>,
    config: RateLimitConfig,
    audit: Arc<AuditLog>,
    reputation: Option<Arc<IpReputationStore>>,
    clock: Arc<dyn Clock>,
    degraded: AtomicU64,
}

struct Consumed {
    allowed: bool,
    escalated: bool,
    violations: u32,
}

impl RateLimiter {
    pub fn new(
        repository: Arc<dyn RateWindowRepository>,
        config: RateLimitConfig,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            config,
            audit,
            reputation: None,
            clock,
            degraded: AtomicU64::new(0),
        }
    }

    /// Enable auto-blocking of IP keys that abuse the limit.
    pub fn with_reputation(mut self, reputation: Arc<IpReputationStore>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decisions made without the key's own window: allowed because state was
    /// unavailable, or counted against a fallback key.
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Limit a request against a configured route class.
    pub fn check_route_class(&self, class: &str, key: &str) -> Result<RateDecision, ValidationError> {
        let route = self.config.route_class(class);
        self.check_and_consume(key, route.limit, route.window())
    }

    /// Like [`check_route_class`](Self::check_route_class), but a key that
    /// fails validation is audited as a degradation and the request is
    /// counted against `fallback` instead.
    pub fn check_route_class_or(
        &self,
        class: &str,
        key: &str,
        fallback: Option<&str>,
    ) -> Result<RateDecision, ValidationError> {
        let error = match self.check_route_class(class, key) {
            Err(error) => error,
            decision => return decision,
        };

        let degraded = self.degraded.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            key,
            fallback,
            error = %error,
            degraded,
            "Unusable rate limit key, falling back"
        );
        let mut details = EventDetails::new()
            .maybe_ip(fallback.and_then(ip_from_rate_key).as_deref())
            .outcome(Outcome::Info)
            .detail("key", key)
            .detail("error", error.to_string());
        if let Some(fallback) = fallback {
            details = details.detail("fallback", fallback);
        }
        self.audit
            .log_security_event(SecurityEventType::RateLimiterDegraded, details);

        match fallback {
            Some(fallback) => self.check_route_class(class, fallback),
            None => Err(error),
        }
    }

    /// Count one request for `key` against `limit` requests per `window`.
    ///
    /// Calls `1..=limit` inside one window are allowed; the next is denied
    /// with a positive `retry_after_ms` pointing at the end of the window.
    pub fn check_and_consume(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, ValidationError> {
        validate_rate_key(key)?;
        if window <= Duration::zero() {
            return Err(ValidationError::InvalidConfig(
                "rate limit window must be positive".to_string(),
            ));
        }

        let now = self.clock.now();
        let window_ms = duration_ms(window);
        let escalation_window = self.config.escalation_window();
        let escalation_threshold = self.config.escalation_threshold;
        let mut consumed = Consumed {
            allowed: false,
            escalated: false,
            violations: 0,
        };

        let result = self.repository.update(
            key,
            &mut || RateWindow::new(key, limit, window_ms, now),
            &mut |state| {
                if now - state.window_start >= window {
                    state.window_start = now;
                    state.count = 0;
                }
                state.limit = limit;
                state.window_size_ms = window_ms;

                if state.count < limit {
                    state.count += 1;
                    consumed.allowed = true;
                    return;
                }

                consumed.allowed = false;
                if state
                    .violations_since
                    .is_none_or(|since| now - since >= escalation_window)
                {
                    state.violations = 0;
                    state.violations_since = Some(now);
                }
                state.violations = state.violations.saturating_add(1);
                state.last_violation_at = Some(now);
                consumed.violations = state.violations;
                consumed.escalated = state.violations == escalation_threshold;
            },
        );

        let state = match result {
            Ok(state) => state,
            Err(e) => return Ok(self.fail_open(key, limit, window, now, &e)),
        };

        let reset_at = state.window_end();
        if consumed.allowed {
            return Ok(RateDecision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(state.count),
                retry_after_ms: 0,
                reset_at,
            });
        }

        let retry_after_ms = duration_ms(reset_at - now).max(1);
        let ip = ip_from_rate_key(key);

        tracing::debug!(key, limit, retry_after_ms, "Rate limited request");
        self.audit.log_security_event(
            SecurityEventType::RateLimited,
            EventDetails::new()
                .maybe_ip(ip.as_deref())
                .outcome(Outcome::Denied)
                .detail("key", key)
                .detail("limit", limit)
                .detail("window_ms", window_ms)
                .detail("retry_after_ms", retry_after_ms),
        );

        if consumed.escalated {
            self.escalate(key, ip.as_deref(), consumed.violations);
        }

        Ok(RateDecision {
            allowed: false,
            limit,
            remaining: 0,
            retry_after_ms,
            reset_at,
        })
    }

    fn escalate(&self, key: &str, ip: Option<&str>, violations: u32) {
        tracing::warn!(key, violations, "Rate limit abuse detected");
        self.audit.log_security_event(
            SecurityEventType::RateLimitAbuse,
            EventDetails::new()
                .maybe_ip(ip)
                .outcome(Outcome::Denied)
                .detail("key", key)
                .detail("violations", violations)
                .detail("escalation_window_ms", self.config.escalation_window_ms),
        );

        if !self.config.auto_block_on_abuse {
            return;
        }
        let (Some(ip), Some(reputation)) = (ip, &self.reputation) else {
            return;
        };

        let evidence = EventDetails::new()
            .detail("key", key)
            .detail("violations", violations);
        match reputation.auto_block(ip, "rate limit abuse", evidence) {
            Ok(entry) => tracing::warn!(ip = %entry.ip, key, "Auto-blocked IP for rate limit abuse"),
            Err(e) if e.is_whitelist_override() => {
                tracing::info!(ip, key, "Rate limit abuse from whitelisted IP");
            }
            Err(e) => tracing::error!(ip, error = %e, "Failed to auto-block IP"),
        }
    }

    fn fail_open(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
        error: &StoreError,
    ) -> RateDecision {
        let degraded = self.degraded.fetch_add(1, Ordering::Relaxed) + 1;

        tracing::warn!(key, error = %error, degraded, "Rate limiter state unavailable, allowing request");
        self.audit.log_security_event(
            SecurityEventType::RateLimiterDegraded,
            EventDetails::new()
                .maybe_ip(ip_from_rate_key(key).as_deref())
                .outcome(Outcome::Info)
                .detail("key", key)
                .detail("error", error.to_string()),
        );

        RateDecision {
            allowed: true,
            limit,
            remaining: limit,
            retry_after_ms: 0,
            reset_at: saturating_add(now, window),
        }
    }

    /// Keys denied at or after `since`, most violations first.
    pub fn recent_violations(&self, since: DateTime<Utc>) -> Result<Vec<RateViolation>, StoreError> {
        let mut violations: Vec<RateViolation> = self
            .repository
            .snapshot()?
            .into_iter()
            .filter_map(|state| {
                let last_violation_at = state.last_violation_at.filter(|at| *at >= since)?;
                Some(RateViolation {
                    key: state.key,
                    violations: state.violations,
                    limit: state.limit,
                    window_size_ms: state.window_size_ms,
                    last_violation_at,
                })
            })
            .collect();

        violations.sort_by(|a, b| {
            b.violations
                .cmp(&a.violations)
                .then_with(|| b.last_violation_at.cmp(&a.last_violation_at))
        });
        Ok(violations)
    }

    /// Keys with the most denials inside the escalation window.
    pub fn top_offenders(&self, n: usize) -> Result<Vec<(String, u32)>, StoreError> {
        let since = saturating_sub(self.clock.now(), self.config.escalation_window());
        let mut offenders: Vec<(String, u32)> = self
            .recent_violations(since)?
            .into_iter()
            .map(|violation| (violation.key, violation.violations))
            .collect();

        offenders.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        offenders.truncate(n);
        Ok(offenders)
    }

    /// Discard windows that have ended and carry no live escalation state.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let escalation_window = self.config.escalation_window();

        let removed = self.repository.retain(&mut |state| {
            state.window_end() > now
                || state
                    .last_violation_at
                    .is_some_and(|at| now - at < escalation_window)
        })?;

        if removed > 0 {
            tracing::debug!(count = removed, "Discarded expired rate limit windows");
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AuditConfig, IpReputationConfig, RouteClassLimit};
    use crate::events::Severity;
    use crate::repositories::{InMemoryRepository, KeyedRepository, testing::UnavailableRepository};
    use crate::services::audit::AuditQuery;
    use crate::storage::IpEntry;

    struct Fixture {
        clock: Arc<ManualClock>,
        audit: Arc<AuditLog>,
        reputation: Arc<IpReputationStore>,
        repository: Arc<InMemoryRepository<RateWindow>>,
        limiter: RateLimiter,
    }

    fn fixture(config: RateLimitConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(AuditLog::new(AuditConfig::default(), clock.clone()));
        let reputation = Arc::new(IpReputationStore::new(
            Arc::new(InMemoryRepository::<IpEntry>::new()),
            IpReputationConfig::default(),
            audit.clone(),
            clock.clone(),
        ));
        let repository = Arc::new(InMemoryRepository::<RateWindow>::new());
        let limiter = RateLimiter::new(repository.clone(), config, audit.clone(), clock.clone())
            .with_reputation(reputation.clone());

        Fixture {
            clock,
            audit,
            reputation,
            repository,
            limiter,
        }
    }

    fn count(audit: &AuditLog, event_type: SecurityEventType) -> usize {
        audit
            .get_audit_logs(&AuditQuery::new().event_type(event_type))
            .unwrap()
            .len()
    }


    #[test]
    fn test_limit_allows_then_denies() {
        let f = fixture(RateLimitConfig::default());

        for i in 1..=10 {
            let decision = f.limiter.check_and_consume("ip:1.2.3.4", 10, Duration::minutes(1)).unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 10 - i);
        }

        let denied = f.limiter.check_and_consume("ip:1.2.3.4", 10, Duration::minutes(1)).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_ms > 0);
        assert!(denied.retry_after_ms <= 60_000);

        let events = f
            .audit
            .get_audit_logs(&AuditQuery::new().event_type(SecurityEventType::RateLimited))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Low);
        assert_eq!(events[0].ip.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_denials_do_not_consume() {
        let f = fixture(RateLimitConfig::default());

        for _ in 0..5 {
            f.limiter.check_and_consume("k", 2, Duration::minutes(1)).unwrap();
        }

        let state = f.repository.get("k").unwrap().unwrap();
        assert_eq!(state.count, 2);
        assert_eq!(state.violations, 3);
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let f = fixture(RateLimitConfig::default());

        for _ in 0..3 {
            f.limiter.check_and_consume("k", 3, Duration::minutes(1)).unwrap();
        }
        f.clock.advance(Duration::seconds(45));
        let denied = f.limiter.check_and_consume("k", 3, Duration::minutes(1)).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 15_000);

        f.clock.advance(Duration::seconds(15));
        let decision = f.limiter.check_and_consume("k", 3, Duration::minutes(1)).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_at, f.clock.now() + Duration::minutes(1));
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let f = fixture(RateLimitConfig::default());

        assert!(!f.limiter.check_and_consume("k", 0, Duration::minutes(1)).unwrap().allowed);
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let f = fixture(RateLimitConfig::default());

        assert!(f.limiter.check_and_consume("", 10, Duration::minutes(1)).is_err());
        assert!(f.limiter.check_and_consume("bad key", 10, Duration::minutes(1)).is_err());
        assert!(f.limiter.check_and_consume("k", 10, Duration::zero()).is_err());
    }

    #[test]
    fn test_route_class_limits() {
        let mut config = RateLimitConfig::default();
        config
            .route_classes
            .insert("auth".to_string(), RouteClassLimit::new(2, 60_000));
        let f = fixture(config);

        assert!(f.limiter.check_route_class("auth", "ip:1.1.1.1").unwrap().allowed);
        assert!(f.limiter.check_route_class("auth", "ip:1.1.1.1").unwrap().allowed);
        assert!(!f.limiter.check_route_class("auth", "ip:1.1.1.1").unwrap().allowed);

        let decision = f.limiter.check_route_class("unknown", "ip:2.2.2.2").unwrap();
        assert_eq!(decision.limit, 100);
    }

    #[test]
    fn test_abuse_escalates_once_and_blocks_ip() {
        let f = fixture(RateLimitConfig {
            escalation_threshold: 3,
            ..Default::default()
        });

        f.limiter.check_and_consume("ip:6.6.6.6", 1, Duration::minutes(1)).unwrap();
        for _ in 0..5 {
            f.limiter.check_and_consume("ip:6.6.6.6", 1, Duration::minutes(1)).unwrap();
        }

        assert_eq!(count(&f.audit, SecurityEventType::RateLimitAbuse), 1);
        assert_eq!(count(&f.audit, SecurityEventType::IpAutoBlocked), 1);
        assert!(!f.reputation.is_allowed("6.6.6.6"));
    }

    #[test]
    fn test_abuse_by_non_ip_key_is_not_blocked() {
        let f = fixture(RateLimitConfig {
            escalation_threshold: 2,
            ..Default::default()
        });

        for _ in 0..4 {
            f.limiter.check_and_consume("actor:usr_1", 1, Duration::minutes(1)).unwrap();
        }

        assert_eq!(count(&f.audit, SecurityEventType::RateLimitAbuse), 1);
        assert_eq!(count(&f.audit, SecurityEventType::IpAutoBlocked), 0);
    }

    #[test]
    fn test_abuse_auto_block_can_be_disabled() {
        let f = fixture(RateLimitConfig {
            escalation_threshold: 1,
            auto_block_on_abuse: false,
            ..Default::default()
        });

        f.limiter.check_and_consume("1.2.3.4", 0, Duration::minutes(1)).unwrap();

        assert_eq!(count(&f.audit, SecurityEventType::RateLimitAbuse), 1);
        assert!(f.reputation.is_allowed("1.2.3.4"));
    }

    #[test]
    fn test_fails_open_when_state_unavailable() {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(AuditLog::new(AuditConfig::default(), clock.clone()));
        let limiter = RateLimiter::new(
            Arc::new(UnavailableRepository),
            RateLimitConfig::default(),
            audit.clone(),
            clock,
        );

        for _ in 0..3 {
            let decision = limiter.check_and_consume("ip:1.2.3.4", 1, Duration::minutes(1)).unwrap();
            assert!(decision.allowed);
        }

        assert_eq!(limiter.degraded_count(), 3);
        assert_eq!(count(&audit, SecurityEventType::RateLimiterDegraded), 3);
    }

    #[test]
    fn test_concurrent_consumers_never_exceed_limit() {
        let f = fixture(RateLimitConfig {
            escalation_threshold: u32::MAX,
            ..Default::default()
        });
        let allowed = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        if f.limiter.check_and_consume("shared", 500, Duration::minutes(1)).unwrap().allowed {
                            allowed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(allowed.load(Ordering::Relaxed), 500);
        assert_eq!(f.repository.get("shared").unwrap().unwrap().count, 500);
    }

    #[test]
    fn test_recent_violations_and_top_offenders() {
        let f = fixture(RateLimitConfig::default());

        for _ in 0..4 {
            f.limiter.check_and_consume("ip:1.1.1.1", 1, Duration::minutes(1)).unwrap();
        }
        for _ in 0..2 {
            f.limiter.check_and_consume("ip:2.2.2.2", 1, Duration::minutes(1)).unwrap();
        }
        f.limiter.check_and_consume("ip:3.3.3.3", 1, Duration::minutes(1)).unwrap();

        let recent = f.limiter.recent_violations(f.clock.now()).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].key, "ip:1.1.1.1");
        assert_eq!(recent[0].violations, 3);

        let top = f.limiter.top_offenders(1).unwrap();
        assert_eq!(top, vec![("ip:1.1.1.1".to_string(), 3)]);

        f.clock.advance(Duration::seconds(1));
        assert!(f.limiter.recent_violations(f.clock.now()).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_discards_finished_windows() {
        let f = fixture(RateLimitConfig::default());

        f.limiter.check_and_consume("quiet", 5, Duration::minutes(1)).unwrap();
        f.limiter.check_and_consume("noisy", 0, Duration::minutes(1)).unwrap();
        f.clock.advance(Duration::minutes(2));

        assert_eq!(f.limiter.sweep().unwrap(), 1);
        assert!(f.repository.get("quiet").unwrap().is_none());

        f.clock.advance(f.limiter.config().escalation_window());
        assert_eq!(f.limiter.sweep().unwrap(), 1);
        assert_eq!(f.repository.len().unwrap(), 0);
    }

    #[test]
    fn test_unbounded_window_saturates_instead_of_overflowing() {
        let f = fixture(RateLimitConfig {
            escalation_window_ms: u64::MAX,
            ..Default::default()
        });
        let window = crate::config::millis(u64::MAX);

        let decision = f.limiter.check_and_consume("ip:1.2.3.4", 1, window).unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.reset_at, DateTime::<Utc>::MAX_UTC);

        let denied = f.limiter.check_and_consume("ip:1.2.3.4", 1, window).unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);

        assert_eq!(f.limiter.top_offenders(5).unwrap().len(), 1);
        assert_eq!(f.limiter.sweep().unwrap(), 0);
    }

    #[test]
    fn test_unusable_key_falls_back_and_is_audited() {
        let mut config = RateLimitConfig::default();
        config
            .route_classes
            .insert("tight".to_string(), RouteClassLimit::new(1, 60_000));
        let f = fixture(config);
        let oversized = format!("actor:{}", "a".repeat(300));

        let decision = f
            .limiter
            .check_route_class_or("tight", &oversized, Some("ip:10.0.0.1"))
            .unwrap();
        assert!(decision.allowed);
        let denied = f
            .limiter
            .check_route_class_or("tight", &oversized, Some("ip:10.0.0.1"))
            .unwrap();
        assert!(!denied.allowed);

        assert_eq!(f.repository.get("ip:10.0.0.1").unwrap().unwrap().count, 1);
        assert_eq!(f.limiter.degraded_count(), 2);
        let degraded = f
            .audit
            .get_audit_logs(&AuditQuery::new().event_type(SecurityEventType::RateLimiterDegraded))
            .unwrap();
        assert_eq!(degraded.len(), 2);
        assert_eq!(degraded[0].ip.as_deref(), Some("10.0.0.1"));

        let err = f
            .limiter
            .check_route_class_or("tight", &oversized, None)
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidKey(_)));
        assert_eq!(count(&f.audit, SecurityEventType::RateLimiterDegraded), 3);
    }
}
