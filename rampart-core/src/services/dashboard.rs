//! Read-only aggregation for operator tooling.
//!
//! The overview composes snapshots from every store. A store that cannot be
//! read marks its own section unavailable; the rest of the overview is still
//! returned.

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    clock::{Clock, saturating_sub},
    services::{
        audit::{AuditHealth, AuditLog, SeverityCounts},
        brute_force::{BruteForceGuard, BruteForceStats},
        ip_reputation::IpReputationStore,
        rate_limit::{RateLimiter, RateViolation},
    },
    storage::IpEntry,
};

const TOP_OFFENDERS: usize = 10;

/// One part of the overview, present only when its store could be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Section<T> {
    Available { data: T },
    Unavailable { reason: String },
}

impl<T> Section<T> {
    fn from_result<E: Display>(section: &str, result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Section::Available { data },
            Err(e) => {
                tracing::warn!(section, error = %e, "Overview section unavailable");
                Section::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Section::Available { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Section::Available { data } => Some(data),
            Section::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffenderKind {
    /// Login identifier, counted by failures in its current window
    Identifier,
    /// Rate limit key, counted by recent denials
    RateKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offender {
    pub key: String,
    pub kind: OffenderKind,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityOverview {
    pub active_ip_blocks: Section<Vec<IpEntry>>,
    pub rate_limit_violations_recent: Section<Vec<RateViolation>>,
    pub audit_counts_by_severity: Section<SeverityCounts>,
    pub top_offenders: Section<Vec<Offender>>,
    pub brute_force: Section<BruteForceStats>,
    pub audit_health: AuditHealth,
    pub rate_limiter_degraded: u64,
    pub generated_at: DateTime<Utc>,
}

pub struct SecurityDashboard {
    guard: Arc<BruteForceGuard>,
    reputation: Arc<IpReputationStore>,
    limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    recent_window: Duration,
}

impl SecurityDashboard {
    pub fn new(
        guard: Arc<BruteForceGuard>,
        reputation: Arc<IpReputationStore>,
        limiter: Arc<RateLimiter>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            guard,
            reputation,
            limiter,
            audit,
            clock,
            recent_window: Duration::hours(1),
        }
    }

    /// How far back "recent" lockouts and violations reach.
    pub fn with_recent_window(mut self, recent_window: Duration) -> Self {
        self.recent_window = recent_window;
        self
    }

    pub fn get_brute_force_stats(&self) -> Result<BruteForceStats, Error> {
        Ok(self.guard.stats(self.recent_window)?)
    }

    pub fn get_security_overview(&self) -> SecurityOverview {
        let now = self.clock.now();
        let since = saturating_sub(now, self.recent_window);

        SecurityOverview {
            active_ip_blocks: Section::from_result(
                "active_ip_blocks",
                self.reputation.active_blocks(),
            ),
            rate_limit_violations_recent: Section::from_result(
                "rate_limit_violations_recent",
                self.limiter.recent_violations(since),
            ),
            audit_counts_by_severity: Section::Available {
                data: self.audit.counts_by_severity(None),
            },
            top_offenders: Section::from_result("top_offenders", self.top_offenders()),
            brute_force: Section::from_result("brute_force", self.guard.stats(self.recent_window)),
            audit_health: self.audit.health(),
            rate_limiter_degraded: self.limiter.degraded_count(),
            generated_at: now,
        }
    }

    fn top_offenders(&self) -> Result<Vec<Offender>, Error> {
        let identifiers = self.guard.top_failures(TOP_OFFENDERS)?;
        let rate_keys = self.limiter.top_offenders(TOP_OFFENDERS)?;

        let mut offenders: Vec<Offender> = identifiers
            .into_iter()
            .map(|(key, count)| Offender {
                key,
                kind: OffenderKind::Identifier,
                count,
            })
            .chain(rate_keys.into_iter().map(|(key, count)| Offender {
                key,
                kind: OffenderKind::RateKey,
                count,
            }))
            .collect();

        offenders.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        offenders.truncate(TOP_OFFENDERS);
        Ok(offenders)
    }
}
