//! Brute force protection for login identifiers.
//!
//! This module tracks failed attempts per normalized identifier and locks the
//! identifier once too many failures accumulate inside the attempt window.
//!
//! # Features
//!
//! - Per-identifier failure counting, atomic per key
//! - Lockout with escalation: every consecutive lockout doubles the duration,
//!   capped at the configured maximum
//! - Lazy expiry: a lapsed lock reads as unlocked without a write
//! - Admin unlock that never reveals whether an identifier was tracked
//! - Cross-account detection: an IP that gets several distinct identifiers
//!   locked is handed to the IP reputation store for an automatic block
//! - Fail closed: if attempt state cannot be read the identifier is treated
//!   as locked
//!
//! # Example
//!
//! ```rust,ignore
//! use rampart_core::services::BruteForceGuard;
//!
//! // Check before verifying credentials
//! let (locked, remaining_ms) = guard.is_locked("user@example.com");
//! if locked {
//!     // Deny with Retry-After derived from remaining_ms
//! }
//!
//! // Report the outcome afterwards
//! let status = guard.record_attempt("user@example.com", Some("192.168.1.1"), false)?;
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    clock::{Clock, saturating_add, saturating_sub},
    config::BruteForceConfig,
    error::StoreError,
    events::{EventDetails, Outcome, SecurityEventType},
    repositories::AttemptRepository,
    services::{audit::AuditLog, ip_reputation::IpReputationStore},
    storage::{AttemptRecord, LockoutStatus, duration_ms},
    validation::{lookup_ip, normalize_identifier},
};

/// Snapshot of brute force state for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BruteForceStats {
    pub total_locked_accounts: usize,
    pub total_tracked_identifiers: usize,
    /// Lockouts that engaged inside `recent_window_ms`
    pub recent_lockouts: u64,
    pub recent_window_ms: u64,
}

/// Service guarding login identifiers against password guessing.
///
/// # Thread Safety
///
/// The guard is shared across request tasks. Every mutation of an identifier
/// is a single atomic update in the repository, so concurrent failures are
/// never lost or double-escalated.
pub struct BruteForceGuard {
    repository: Arc<dyn AttemptRepository>,
    config: BruteForceConfig,
    audit: Arc<AuditLog>,
    reputation: Option<Arc<IpReputationStore>>,
    clock: Arc<dyn Clock>,
    /// Identifiers locked per source IP, with the time of their lockout
    ip_lockouts: DashMap<String, Vec<(String, DateTime<Utc>)>>,
}

impl BruteForceGuard {
    pub fn new(
        repository: Arc<dyn AttemptRepository>,
        config: BruteForceConfig,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            config,
            audit,
            reputation: None,
            clock,
            ip_lockouts: DashMap::new(),
        }
    }

    /// Enable the cross-account auto-block hook.
    pub fn with_reputation(mut self, reputation: Arc<IpReputationStore>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    /// Get the current configuration.
    pub fn config(&self) -> &BruteForceConfig {
        &self.config
    }

    /// Check if brute force protection is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get the lockout status of an identifier.
    ///
    /// Pure read: an expired lock or an elapsed attempt window reads as clean.
    /// If the attempt state cannot be read the identifier is reported locked
    /// for the base lockout duration.
    pub fn lockout_status(&self, identifier: &str) -> LockoutStatus {
        // Identifiers that cannot be normalized were never recorded
        let Ok(identifier) = normalize_identifier(identifier) else {
            return LockoutStatus::clean(identifier.trim());
        };

        if !self.config.enabled {
            return LockoutStatus::clean(&identifier);
        }

        let now = self.clock.now();
        match self.repository.get(&identifier) {
            Ok(Some(record)) => self.status_of(&record, now),
            Ok(None) => LockoutStatus::clean(&identifier),
            Err(e) => {
                tracing::error!(
                    identifier = %identifier,
                    error = %e,
                    "Attempt state unavailable, treating identifier as locked"
                );
                self.fail_closed(&identifier, now)
            }
        }
    }

    /// Whether an identifier is locked, and for how many more milliseconds.
    pub fn is_locked(&self, identifier: &str) -> (bool, u64) {
        let status = self.lockout_status(identifier);
        (status.is_locked, status.remaining_ms)
    }

    /// Record the outcome of a credential check.
    ///
    /// A success clears the failure count, any lock and the escalation level.
    /// A failure increments the count; the failure that brings the count to
    /// the threshold locks the identifier and is the only one that emits
    /// `ACCOUNT_LOCKED`.
    ///
    /// If protection is disabled, this is a no-op that returns an unlocked status.
    pub fn record_attempt(
        &self,
        identifier: &str,
        ip_address: Option<&str>,
        success: bool,
    ) -> Result<LockoutStatus, Error> {
        let identifier = normalize_identifier(identifier)?;

        if !self.config.enabled {
            return Ok(LockoutStatus::clean(&identifier));
        }

        let ip = ip_address.map(lookup_ip);
        if success {
            Ok(self.record_success(&identifier, ip.as_deref()))
        } else {
            Ok(self.record_failure(&identifier, ip.as_deref()))
        }
    }

    fn record_success(&self, identifier: &str, ip: Option<&str>) -> LockoutStatus {
        let now = self.clock.now();

        self.audit.log_security_event(
            SecurityEventType::LoginSuccess,
            EventDetails::new()
                .subject(identifier)
                .maybe_ip(ip)
                .outcome(Outcome::Success),
        );

        let result = self.repository.update_existing(identifier, &mut |record| {
            record.clear_failures();
            record.consecutive_lockouts = 0;
            record.last_seen_at = now;
            if let Some(ip) = ip {
                record.last_ip = Some(ip.to_string());
            }
        });

        match result {
            Ok(_) => LockoutStatus::clean(identifier),
            Err(e) => {
                tracing::error!(
                    identifier = %identifier,
                    error = %e,
                    "Failed to reset attempt state after successful login"
                );
                self.fail_closed(identifier, now)
            }
        }
    }

    fn record_failure(&self, identifier: &str, ip: Option<&str>) -> LockoutStatus {
        let now = self.clock.now();
        let window = self.config.attempt_window();
        let threshold = self.config.failure_threshold;
        let mut lockout = None;

        let result = self.repository.update(
            identifier,
            &mut || AttemptRecord::new(identifier, now),
            &mut |record| {
                lockout = None;

                let lock_expired = record.locked_until.is_some_and(|until| until <= now);
                let window_elapsed = !record.is_locked_at(now)
                    && record.first_failure_at.is_some_and(|first| now - first >= window);
                if lock_expired || window_elapsed {
                    record.clear_failures();
                }

                record.failure_count = record.failure_count.saturating_add(1);
                record.first_failure_at.get_or_insert(now);
                record.last_failure_at = Some(now);
                record.last_seen_at = now;
                if let Some(ip) = ip {
                    record.last_ip = Some(ip.to_string());
                }

                if !record.is_locked_at(now) && record.failure_count >= threshold {
                    record.consecutive_lockouts = record.consecutive_lockouts.saturating_add(1);
                    let duration = self.config.lockout_duration(record.consecutive_lockouts);
                    record.locked_at = Some(now);
                    record.locked_until = Some(saturating_add(now, duration));
                    lockout = Some((record.consecutive_lockouts, duration));
                }
            },
        );

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    identifier = %identifier,
                    error = %e,
                    "Failed to record failed attempt, treating identifier as locked"
                );
                self.audit.log_security_event(
                    SecurityEventType::LoginFailure,
                    EventDetails::new()
                        .subject(identifier)
                        .maybe_ip(ip)
                        .outcome(Outcome::Failure)
                        .detail("state_unavailable", true),
                );
                return self.fail_closed(identifier, now);
            }
        };

        let status = LockoutStatus::from_record(&record, now);

        self.audit.log_security_event(
            SecurityEventType::LoginFailure,
            EventDetails::new()
                .subject(identifier)
                .maybe_ip(ip)
                .outcome(Outcome::Failure)
                .detail("failed_attempts", record.failure_count),
        );

        if let Some((consecutive_lockouts, duration)) = lockout {
            tracing::warn!(
                identifier = %identifier,
                failed_attempts = record.failure_count,
                consecutive_lockouts,
                lockout_ms = duration_ms(duration),
                "Locked identifier after repeated failures"
            );

            self.audit.log_security_event(
                SecurityEventType::AccountLocked,
                EventDetails::new()
                    .subject(identifier)
                    .maybe_ip(ip)
                    .outcome(Outcome::Denied)
                    .detail("failed_attempts", record.failure_count)
                    .detail("consecutive_lockouts", consecutive_lockouts)
                    .detail("lockout_ms", duration_ms(duration))
                    .detail(
                        "locked_until",
                        record.locked_until.map(|until| until.to_rfc3339()),
                    ),
            );

            if let Some(ip) = ip {
                self.track_ip_lockout(ip, identifier, now);
            }
        }

        status
    }

    /// Count a lockout against its source IP and auto-block the IP once
    /// enough distinct identifiers were locked from it inside the window.
    fn track_ip_lockout(&self, ip: &str, identifier: &str, now: DateTime<Utc>) {
        let Some(reputation) = &self.reputation else {
            return;
        };
        let threshold = self.config.auto_block_threshold as usize;
        if threshold == 0 {
            return;
        }

        let cutoff = saturating_sub(now, self.config.auto_block_window());
        let identifiers: Vec<String> = {
            let mut locked = self.ip_lockouts.entry(ip.to_string()).or_default();
            locked.retain(|(id, at)| *at > cutoff && id != identifier);
            locked.push((identifier.to_string(), now));

            if locked.len() < threshold {
                return;
            }
            let identifiers = locked.drain(..).map(|(id, _)| id).collect();
            identifiers
        };
        self.ip_lockouts.remove_if(ip, |_, locked| locked.is_empty());

        let evidence = EventDetails::new()
            .detail("identifiers", identifiers.clone())
            .detail("window_ms", self.config.auto_block_window_ms);

        match reputation.auto_block(ip, "cross-account lockouts", evidence) {
            Ok(entry) => {
                tracing::warn!(
                    ip = %entry.ip,
                    identifiers = identifiers.len(),
                    "Auto-blocked IP after cross-account lockouts"
                );
            }
            Err(e) if e.is_whitelist_override() => {
                tracing::info!(ip = %ip, "Cross-account threshold reached by whitelisted IP");
            }
            Err(e) => {
                tracing::error!(ip = %ip, error = %e, "Failed to auto-block IP");
            }
        }
    }

    /// Admin override: clear failures, lock and escalation level.
    ///
    /// Returns whether the identifier was tracked. Unlocking an untracked
    /// identifier is a silent success and appends nothing.
    pub fn unlock(&self, identifier: &str, actor_id: &str) -> Result<bool, Error> {
        let identifier = normalize_identifier(identifier)?;
        let now = self.clock.now();
        let mut was_locked = false;

        let record = self.repository.update_existing(&identifier, &mut |record| {
            was_locked = record.is_locked_at(now);
            record.clear_failures();
            record.consecutive_lockouts = 0;
            record.last_seen_at = now;
        })?;

        if record.is_none() {
            return Ok(false);
        }

        tracing::info!(identifier = %identifier, actor_id, was_locked, "Unlocked identifier");
        self.audit.log_security_event(
            SecurityEventType::AccountUnlocked,
            EventDetails::new()
                .subject(&identifier)
                .actor(actor_id)
                .outcome(Outcome::Success)
                .detail("was_locked", was_locked),
        );

        Ok(true)
    }

    pub fn stats(&self, recent_window: Duration) -> Result<BruteForceStats, StoreError> {
        let now = self.clock.now();
        let records = self.repository.snapshot()?;

        Ok(BruteForceStats {
            total_locked_accounts: records.iter().filter(|r| r.is_locked_at(now)).count(),
            total_tracked_identifiers: records.len(),
            recent_lockouts: self
                .audit
                .count_events(
                    SecurityEventType::AccountLocked,
                    saturating_sub(now, recent_window),
                ),
            recent_window_ms: duration_ms(recent_window),
        })
    }

    /// Identifiers with the most failures in their current window.
    pub fn top_failures(&self, n: usize) -> Result<Vec<(String, u32)>, StoreError> {
        let now = self.clock.now();
        let mut failures: Vec<(String, u32)> = self
            .repository
            .snapshot()?
            .into_iter()
            .map(|record| {
                let failed = self.status_of(&record, now).failed_attempts;
                (record.identifier, failed)
            })
            .filter(|(_, failed)| *failed > 0)
            .collect();

        failures.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        failures.truncate(n);
        Ok(failures)
    }

    /// Evict unlocked records idle longer than the idle TTL and stale
    /// cross-account trackers. Returns the number of records evicted.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let idle_cutoff = saturating_sub(now, self.config.idle_ttl());

        let evicted = self
            .repository
            .retain(&mut |record| record.is_locked_at(now) || record.last_seen_at > idle_cutoff)?;

        let tracker_cutoff = saturating_sub(now, self.config.auto_block_window());
        self.ip_lockouts.retain(|_, locked| {
            locked.retain(|(_, at)| *at > tracker_cutoff);
            !locked.is_empty()
        });

        if evicted > 0 {
            tracing::info!(count = evicted, "Evicted idle attempt records");
        }

        Ok(evicted)
    }

    fn status_of(&self, record: &AttemptRecord, now: DateTime<Utc>) -> LockoutStatus {
        let mut status = LockoutStatus::from_record(record, now);
        let window_elapsed = record
            .first_failure_at
            .is_some_and(|first| now - first >= self.config.attempt_window());
        if !status.is_locked && window_elapsed {
            status.failed_attempts = 0;
        }
        status
    }

    fn fail_closed(&self, identifier: &str, now: DateTime<Utc>) -> LockoutStatus {
        let duration = self.config.lockout_base_duration();
        LockoutStatus {
            identifier: identifier.to_string(),
            failed_attempts: 0,
            is_locked: true,
            locked_until: Some(saturating_add(now, duration)),
            remaining_ms: duration_ms(duration),
        }
    }
}
