//! State records kept by the stores and the values their reads return.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Failed-attempt tracking for one normalized identifier.
///
/// Created on the first failure and evicted by the background sweep once
/// idle; request-path code never deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub identifier: String,
    pub failure_count: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    /// Lockouts since the last success or admin unlock; drives escalation
    pub consecutive_lockouts: u32,
    pub last_ip: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(identifier: &str, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.to_string(),
            failure_count: 0,
            first_failure_at: None,
            last_failure_at: None,
            locked_at: None,
            locked_until: None,
            consecutive_lockouts: 0,
            last_ip: None,
            last_seen_at: now,
        }
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    pub fn remaining_lockout(&self, now: DateTime<Utc>) -> Duration {
        match self.locked_until {
            Some(until) if until > now => until - now,
            _ => Duration::zero(),
        }
    }

    /// Back to CLEAN, keeping the escalation level.
    pub fn clear_failures(&mut self) {
        self.failure_count = 0;
        self.first_failure_at = None;
        self.last_failure_at = None;
        self.locked_at = None;
        self.locked_until = None;
    }
}

/// Lockout state of an identifier as seen by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutStatus {
    pub identifier: String,
    pub failed_attempts: u32,
    pub is_locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub remaining_ms: u64,
}

impl LockoutStatus {
    pub fn clean(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            failed_attempts: 0,
            is_locked: false,
            locked_until: None,
            remaining_ms: 0,
        }
    }

    pub(crate) fn from_record(record: &AttemptRecord, now: DateTime<Utc>) -> Self {
        let is_locked = record.is_locked_at(now);

        // An expired lock or an elapsed window reads as CLEAN without a write
        let failed_attempts = if record.locked_until.is_some() && !is_locked {
            0
        } else {
            record.failure_count
        };

        Self {
            identifier: record.identifier.clone(),
            failed_attempts,
            is_locked,
            locked_until: if is_locked { record.locked_until } else { None },
            remaining_ms: duration_ms(record.remaining_lockout(now)),
        }
    }

    /// Seconds to put in a `Retry-After` header, rounded up.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.is_locked.then(|| self.remaining_ms.div_ceil(1000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpState {
    Normal,
    Blocked,
    Whitelisted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpStateChange {
    pub state: IpState,
    pub reason: String,
    pub actor_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Reputation of one IP. Mutated, never removed, on unblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpEntry {
    pub ip: String,
    pub state: IpState,
    pub reason: String,
    pub set_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub history: Vec<IpStateChange>,
}

impl IpEntry {
    pub fn new(ip: &str, now: DateTime<Utc>) -> Self {
        Self {
            ip: ip.to_string(),
            state: IpState::Normal,
            reason: String::new(),
            set_at: now,
            expires_at: None,
            history: Vec::new(),
        }
    }

    /// State after applying lazy expiry: an expired block reads as NORMAL.
    pub fn effective_state(&self, now: DateTime<Utc>) -> IpState {
        match self.state {
            IpState::Blocked if self.expires_at.is_some_and(|at| at <= now) => IpState::Normal,
            state => state,
        }
    }

    pub(crate) fn transition(
        &mut self,
        state: IpState,
        reason: &str,
        actor_id: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        history_limit: usize,
    ) {
        self.state = state;
        self.reason = reason.to_string();
        self.set_at = now;
        self.expires_at = expires_at;
        self.history.push(IpStateChange {
            state,
            reason: reason.to_string(),
            actor_id: actor_id.map(str::to_string),
            at: now,
        });

        if self.history.len() > history_limit {
            let excess = self.history.len() - history_limit;
            self.history.drain(..excess);
        }
    }
}

/// Fixed-window counter for one rate limit key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub key: String,
    pub window_start: DateTime<Utc>,
    pub count: u32,
    pub limit: u32,
    pub window_size_ms: u64,
    /// Denials since `violations_since`, used for escalation
    pub violations: u32,
    pub violations_since: Option<DateTime<Utc>>,
    pub last_violation_at: Option<DateTime<Utc>>,
}

impl RateWindow {
    pub fn new(key: &str, limit: u32, window_size_ms: u64, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            window_start: now,
            count: 0,
            limit,
            window_size_ms,
            violations: 0,
            violations_since: None,
            last_violation_at: None,
        }
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        crate::clock::saturating_add(self.window_start, crate::config::millis(self.window_size_ms))
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_ms: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateDecision {
    pub fn retry_after_seconds(&self) -> u64 {
        self.retry_after_ms.div_ceil(1000)
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.num_milliseconds()).unwrap_or(0)
}
