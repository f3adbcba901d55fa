//! Append-only security audit log.
//!
//! Appending is synchronous and never fails: the event is stamped, stored in
//! a bounded in-memory log that serves queries, and handed to the delivery
//! task of an attached [`AuditSink`]. Sink writes are retried with capped
//! exponential backoff; a sink that keeps failing only shows up in
//! [`AuditHealth`], never in the decision that produced the event.
//!
//! # Example
//!
//! ```rust,ignore
//! use rampart_core::events::{EventDetails, SecurityEventType};
//!
//! let id = audit.log_security_event(
//!     SecurityEventType::LoginFailure,
//!     EventDetails::new().subject("a@x.com").ip("1.2.3.4"),
//! );
//!
//! let failures = audit.get_audit_logs(&AuditQuery::new().event_type(SecurityEventType::LoginFailure))?;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::{
    clock::Clock,
    config::AuditConfig,
    error::ValidationError,
    events::{AuditEvent, AuditSink, EventDetails, Outcome, SecurityEventType, Severity},
    id::EventId,
    validation::normalize_identifier,
};

/// Filters for [`AuditLog::get_audit_logs`]. All set filters must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    pub event_type: Option<SecurityEventType>,
    /// Matches the actor or the subject of an event
    pub user_id: Option<String>,
    pub risk_level: Option<Severity>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: SecurityEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn risk_level(mut self, severity: Severity) -> Self {
        self.risk_level = Some(severity);
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.limit == Some(0) {
            return Err(ValidationError::InvalidFilter(
                "limit must be greater than zero".to_string(),
            ));
        }

        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(ValidationError::InvalidFilter(
                    "start_date is after end_date".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn matches(&self, event: &AuditEvent, user: Option<&UserFilter<'_>>) -> bool {
        self.event_type.is_none_or(|t| event.event_type == t)
            && self.risk_level.is_none_or(|s| event.severity == s)
            && user.is_none_or(|user| event.involves(user.actor_id, user.subject.as_deref()))
            && self.start_date.is_none_or(|start| event.timestamp >= start)
            && self.end_date.is_none_or(|end| event.timestamp <= end)
    }
}

/// The `user_id` filter resolved once per query. Actor ids are stored as
/// given; subjects are stored normalized.
struct UserFilter<'a> {
    actor_id: &'a str,
    subject: Option<String>,
}

impl<'a> UserFilter<'a> {
    fn new(user_id: &'a str) -> Self {
        let actor_id = user_id.trim();
        Self {
            actor_id,
            subject: normalize_identifier(actor_id).ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl SeverityCounts {
    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Low => self.low += 1,
            Severity::Medium => self.medium += 1,
            Severity::High => self.high += 1,
            Severity::Critical => self.critical += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.low + self.medium + self.high + self.critical
    }
}

/// Delivery health of the audit pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditHealth {
    pub sink_attached: bool,
    pub sink_available: bool,
    pub delivered: u64,
    pub failed_writes: u64,
    pub dropped: u64,
    pub pending: u64,
}

impl AuditHealth {
    /// Events are being lost or the sink is currently failing.
    pub fn is_degraded(&self) -> bool {
        self.sink_attached && (!self.sink_available || self.dropped > 0)
    }
}

#[derive(Debug, Default)]
struct DeliveryCounters {
    sink_attached: AtomicBool,
    sink_available: AtomicBool,
    delivered: AtomicU64,
    failed_writes: AtomicU64,
    dropped: AtomicU64,
    pending: AtomicU64,
}

#[derive(Debug, Default)]
struct LogState {
    events: VecDeque<AuditEvent>,
    next_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

pub struct AuditLog {
    config: AuditConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LogState>,
    outbox: RwLock<Option<mpsc::UnboundedSender<AuditEvent>>>,
    counters: Arc<DeliveryCounters>,
}

impl AuditLog {
    pub fn new(config: AuditConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(LogState::default()),
            outbox: RwLock::new(None),
            counters: Arc::new(DeliveryCounters::default()),
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Append an event and return its id.
    ///
    /// The severity is derived from `event_type`. The timestamp never goes
    /// backwards relative to earlier appends, even if the clock does.
    pub fn log_security_event(
        &self,
        event_type: SecurityEventType,
        details: EventDetails,
    ) -> EventId {
        let now = self.clock.now();

        let event = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

            let timestamp = state.last_timestamp.map_or(now, |last| last.max(now));
            state.last_timestamp = Some(timestamp);

            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let event = AuditEvent {
                id: EventId::new_random(),
                sequence,
                timestamp,
                event_type,
                severity: event_type.severity(),
                actor_id: details.actor_id,
                subject_identifier: details.subject_identifier,
                ip: details.ip,
                details: details.details,
                outcome: details.outcome.unwrap_or(Outcome::Info),
            };

            state.events.push_back(event.clone());
            while state.events.len() > self.config.memory_capacity {
                state.events.pop_front();
            }

            event
        };

        tracing::debug!(
            event_type = %event.event_type,
            severity = %event.severity,
            sequence = event.sequence,
            "Appended security event"
        );

        let id = event.id.clone();
        self.forward(event);
        id
    }

    fn forward(&self, event: AuditEvent) {
        let outbox = self.outbox.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = outbox.as_ref() else {
            return;
        };

        let pending = self.counters.pending.load(Ordering::Relaxed);
        if pending >= self.config.memory_capacity as u64 {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(pending, "Audit delivery backlog full, dropping event");
            return;
        }

        self.counters.pending.fetch_add(1, Ordering::Relaxed);
        if sender.send(event).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::Relaxed);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Audit delivery task has stopped, dropping event");
        }
    }

    /// Matching events, newest first.
    ///
    /// `limit` defaults to the configured default and is clamped to the
    /// configured maximum.
    pub fn get_audit_logs(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, ValidationError> {
        query.validate()?;

        let limit = query
            .limit
            .unwrap_or(self.config.default_query_limit)
            .min(self.config.max_query_limit);

        let user = query.user_id.as_deref().map(UserFilter::new);

        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|event| query.matches(event, user.as_ref()))
            .take(limit)
            .cloned()
            .collect())
    }

    pub fn counts_by_severity(&self, since: Option<DateTime<Utc>>) -> SeverityCounts {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut counts = SeverityCounts::default();

        for event in state.events.iter().rev() {
            if since.is_some_and(|since| event.timestamp < since) {
                break;
            }
            counts.add(event.severity);
        }

        counts
    }

    pub fn count_events(&self, event_type: SecurityEventType, since: DateTime<Utc>) -> u64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .events
            .iter()
            .rev()
            .take_while(|event| event.timestamp >= since)
            .filter(|event| event.event_type == event_type)
            .count() as u64
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn health(&self) -> AuditHealth {
        let counters = &self.counters;
        AuditHealth {
            sink_attached: counters.sink_attached.load(Ordering::Relaxed),
            sink_available: counters.sink_available.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed_writes: counters.failed_writes.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            pending: counters.pending.load(Ordering::Relaxed),
        }
    }

    /// Attach a sink and start the task that delivers events to it.
    ///
    /// Only events appended after this call are delivered. On shutdown the
    /// task drains what is already queued, one attempt per event, and exits.
    pub fn start_delivery_task(
        &self,
        sink: Arc<dyn AuditSink>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        *self.outbox.write().unwrap_or_else(PoisonError::into_inner) = Some(sender);

        let counters = Arc::clone(&self.counters);
        counters.sink_attached.store(true, Ordering::Relaxed);
        counters.sink_available.store(true, Ordering::Relaxed);
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = receiver.recv() => match event {
                        Some(event) => {
                            deliver(sink.as_ref(), &event, &counters, &config, config.max_delivery_attempts).await;
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        while let Ok(event) = receiver.try_recv() {
                            deliver(sink.as_ref(), &event, &counters, &config, 1).await;
                        }
                        tracing::info!("Shutting down audit delivery task");
                        break;
                    }
                }
            }
        })
    }
}

async fn deliver(
    sink: &dyn AuditSink,
    event: &AuditEvent,
    counters: &DeliveryCounters,
    config: &AuditConfig,
    max_attempts: u32,
) {
    for attempt in 1..=max_attempts {
        match sink.write(event).await {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                counters.sink_available.store(true, Ordering::Relaxed);
                counters.pending.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                counters.sink_available.store(false, Ordering::Relaxed);
                tracing::warn!(
                    error = %e,
                    attempt,
                    sequence = event.sequence,
                    "Failed to write audit event"
                );

                if attempt < max_attempts {
                    tokio::time::sleep(config.retry_delay(attempt)).await;
                }
            }
        }
    }

    counters.dropped.fetch_add(1, Ordering::Relaxed);
    counters.pending.fetch_sub(1, Ordering::Relaxed);
    tracing::error!(
        sequence = event.sequence,
        event_type = %event.event_type,
        "Giving up on audit event after repeated sink failures"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::SinkError;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::AtomicUsize;

    fn audit_log(clock: Arc<ManualClock>) -> AuditLog {
        AuditLog::new(
            AuditConfig {
                retry_base_delay_ms: 1,
                retry_max_delay_ms: 2,
                ..Default::default()
            },
            clock,
        )
    }

    struct RecordingSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl AuditSink for RecordingSink {
        async fn write(&self, event: &AuditEvent) -> Result<(), SinkError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    /// Fails the first `failures` writes, then succeeds.
    struct FlakySink {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AuditSink for FlakySink {
        async fn write(&self, _event: &AuditEvent) -> Result<(), SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(SinkError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn wait_for_idle(log: &AuditLog) {
        for _ in 0..200 {
            if log.health().pending == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("audit delivery did not settle");
    }

    #[test]
    fn test_severity_is_derived_from_type() {
        let log = audit_log(Arc::new(ManualClock::default()));

        log.log_security_event(SecurityEventType::AccountLocked, EventDetails::new());
        let events = log.get_audit_logs(&AuditQuery::new()).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(events[0].outcome, Outcome::Info);
        assert!(events[0].id.as_str().starts_with("evt_"));
    }

    #[test]
    fn test_query_returns_newest_first_filtered_by_type() {
        let clock = Arc::new(ManualClock::default());
        let log = audit_log(clock.clone());

        for event_type in [
            SecurityEventType::LoginFailure,
            SecurityEventType::LoginSuccess,
            SecurityEventType::LoginFailure,
            SecurityEventType::RateLimited,
            SecurityEventType::LoginFailure,
        ] {
            log.log_security_event(event_type, EventDetails::new());
            clock.advance(Duration::seconds(1));
        }

        let events = log
            .get_audit_logs(&AuditQuery::new().event_type(SecurityEventType::LoginFailure))
            .unwrap();

        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.event_type == SecurityEventType::LoginFailure));
        assert!(events.windows(2).all(|w| w[0].sequence > w[1].sequence));
        assert!(events.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[test]
    fn test_query_by_user_matches_actor_or_subject() {
        let log = audit_log(Arc::new(ManualClock::default()));

        log.log_security_event(
            SecurityEventType::AccountUnlocked,
            EventDetails::new().actor("admin1").subject("a@x.com"),
        );
        log.log_security_event(
            SecurityEventType::LoginFailure,
            EventDetails::new().subject("a@x.com"),
        );
        log.log_security_event(
            SecurityEventType::LoginFailure,
            EventDetails::new().subject("b@x.com"),
        );

        let by_admin = log.get_audit_logs(&AuditQuery::new().user_id("admin1")).unwrap();
        assert_eq!(by_admin.len(), 1);

        let about_a = log.get_audit_logs(&AuditQuery::new().user_id("a@x.com")).unwrap();
        assert_eq!(about_a.len(), 2);
    }

    #[test]
    fn test_query_by_user_normalizes_subject() {
        let log = audit_log(Arc::new(ManualClock::default()));

        log.log_security_event(
            SecurityEventType::AccountUnlocked,
            EventDetails::new().actor("Admin1").subject("a@x.com"),
        );

        let about_a = log
            .get_audit_logs(&AuditQuery::new().user_id(" A@X.com "))
            .unwrap();
        assert_eq!(about_a.len(), 1);

        // Actor ids are matched as recorded
        assert_eq!(
            log.get_audit_logs(&AuditQuery::new().user_id("Admin1"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_query_by_date_range_and_risk_level() {
        let clock = Arc::new(ManualClock::default());
        let log = audit_log(clock.clone());
        let start = clock.now();

        log.log_security_event(SecurityEventType::IpBlocked, EventDetails::new());
        clock.advance(Duration::minutes(10));
        log.log_security_event(SecurityEventType::IpBlocked, EventDetails::new());
        log.log_security_event(SecurityEventType::RateLimited, EventDetails::new());

        let recent_high = log
            .get_audit_logs(
                &AuditQuery::new()
                    .risk_level(Severity::High)
                    .between(start + Duration::minutes(5), clock.now()),
            )
            .unwrap();
        assert_eq!(recent_high.len(), 1);
        assert_eq!(recent_high[0].sequence, 1);
    }

    #[test]
    fn test_limit_defaults_and_is_clamped() {
        let log = AuditLog::new(
            AuditConfig {
                default_query_limit: 2,
                max_query_limit: 3,
                ..Default::default()
            },
            Arc::new(ManualClock::default()),
        );
        for _ in 0..5 {
            log.log_security_event(SecurityEventType::RateLimited, EventDetails::new());
        }

        assert_eq!(log.get_audit_logs(&AuditQuery::new()).unwrap().len(), 2);
        assert_eq!(log.get_audit_logs(&AuditQuery::new().limit(100)).unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_filters_are_rejected() {
        let clock = Arc::new(ManualClock::default());
        let log = audit_log(clock.clone());
        let now = clock.now();

        assert!(matches!(
            log.get_audit_logs(&AuditQuery::new().limit(0)),
            Err(ValidationError::InvalidFilter(_))
        ));
        assert!(matches!(
            log.get_audit_logs(&AuditQuery::new().between(now, now - Duration::seconds(1))),
            Err(ValidationError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_timestamps_are_monotonic_when_clock_goes_back() {
        let clock = Arc::new(ManualClock::default());
        let log = audit_log(clock.clone());

        log.log_security_event(SecurityEventType::LoginSuccess, EventDetails::new());
        clock.advance(Duration::seconds(-30));
        log.log_security_event(SecurityEventType::LoginSuccess, EventDetails::new());

        let events = log.get_audit_logs(&AuditQuery::new()).unwrap();
        assert!(events[0].timestamp >= events[1].timestamp);
    }

    #[test]
    fn test_memory_capacity_drops_oldest() {
        let log = AuditLog::new(
            AuditConfig {
                memory_capacity: 3,
                default_query_limit: 3,
                max_query_limit: 3,
                ..Default::default()
            },
            Arc::new(ManualClock::default()),
        );
        for _ in 0..5 {
            log.log_security_event(SecurityEventType::LoginFailure, EventDetails::new());
        }

        let events = log.get_audit_logs(&AuditQuery::new()).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(events.last().unwrap().sequence, 2);
    }

    #[test]
    fn test_counts_by_severity() {
        let log = audit_log(Arc::new(ManualClock::default()));
        log.log_security_event(SecurityEventType::RateLimited, EventDetails::new());
        log.log_security_event(SecurityEventType::RateLimited, EventDetails::new());
        log.log_security_event(SecurityEventType::IpAutoBlocked, EventDetails::new());

        let counts = log.counts_by_severity(None);
        assert_eq!(counts.low, 2);
        assert_eq!(counts.critical, 1);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn test_events_are_delivered_to_sink() {
        let log = audit_log(Arc::new(ManualClock::default()));
        let sink = Arc::new(RecordingSink {
            events: Mutex::new(Vec::new()),
        });
        let (_tx, rx) = watch::channel(false);
        let _handle = log.start_delivery_task(sink.clone(), rx);

        log.log_security_event(SecurityEventType::LoginSuccess, EventDetails::new());
        log.log_security_event(SecurityEventType::LoginFailure, EventDetails::new());
        wait_for_idle(&log).await;

        let delivered = sink.events.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].sequence, 0);
        assert_eq!(log.health().delivered, 2);
        assert!(!log.health().is_degraded());
    }

    #[tokio::test]
    async fn test_sink_failures_are_retried() {
        let log = audit_log(Arc::new(ManualClock::default()));
        let sink = Arc::new(FlakySink {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let (_tx, rx) = watch::channel(false);
        let _handle = log.start_delivery_task(sink.clone(), rx);

        log.log_security_event(SecurityEventType::LoginFailure, EventDetails::new());
        wait_for_idle(&log).await;

        let health = log.health();
        assert_eq!(health.delivered, 1);
        assert_eq!(health.failed_writes, 2);
        assert_eq!(health.dropped, 0);
        assert!(health.sink_available);
    }

    #[tokio::test]
    async fn test_unavailable_sink_degrades_health_without_blocking() {
        let log = audit_log(Arc::new(ManualClock::default()));
        let sink = Arc::new(FlakySink {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let (_tx, rx) = watch::channel(false);
        let _handle = log.start_delivery_task(sink, rx);

        let id = log.log_security_event(SecurityEventType::AccountLocked, EventDetails::new());
        assert!(id.as_str().starts_with("evt_"));
        assert_eq!(log.len(), 1);

        wait_for_idle(&log).await;

        let health = log.health();
        assert_eq!(health.dropped, 1);
        assert_eq!(health.failed_writes, u64::from(log.config().max_delivery_attempts));
        assert!(health.is_degraded());
    }
}
