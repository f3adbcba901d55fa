//! # Rampart
//!
//! Rampart is an access-protection engine for Rust services. It sits in front of
//! authentication and API traffic and decides whether a request may proceed:
//! - Brute force lockout per login identifier, with escalating lockouts
//! - IP reputation with block, unblock and whitelist
//! - Fixed-window rate limiting per route class
//! - An append-only security audit log with a pluggable sink
//!
//! Decisions are computed from in-memory state. Audit delivery happens on a
//! background task so a slow or failing sink never stalls a decision.
//!
//! ## Failure policy
//!
//! Lockout and IP decisions fail closed: when their state cannot be read the
//! request is denied. Rate limit decisions fail open: the request is allowed
//! and the degradation is audited.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rampart::{LoginDenied, RampartBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rampart = RampartBuilder::new().build()?;
//!
//!     match rampart.check_login("user@example.com", Some("203.0.113.7")) {
//!         Ok(()) => {
//!             // Verify credentials, then report the outcome
//!             let verified = false;
//!             rampart.record_login("user@example.com", Some("203.0.113.7"), verified)?;
//!         }
//!         Err(LoginDenied::Locked { retry_after_ms }) => println!("retry in {retry_after_ms}ms"),
//!         Err(LoginDenied::IpBlocked) => println!("forbidden"),
//!     }
//!
//!     Ok(())
//! }
//! ```
use std::sync::Arc;

use rampart_core::{
    clock::Clock,
    config::millis,
    services::{AuditLog, BruteForceGuard, IpReputationStore, RateLimiter, SecurityDashboard},
    validation::{lookup_ip, validate_actor_id},
};
use tokio::{sync::watch, task::JoinHandle};

pub mod builder;

pub use builder::{RampartBuilder, RampartBuilderError};

/// Re-export core types from rampart_core
///
/// These types are commonly used when working with the Rampart API.
pub use rampart_core::{
    AuditEvent, AuditSink, Error, EventDetails, IpState, LockoutStatus, ManualClock,
    RateDecision, SecurityConfig, SecurityEventType, Severity, SystemClock,
    config::{AuditConfig, BruteForceConfig, IpReputationConfig, RateLimitConfig, RouteClassLimit},
    events::{Outcome, TracingSink},
    services::{AdminAction, AdminOutcome, AuditQuery, BruteForceStats, SecurityOverview},
};

/// Re-export the storage seam so hosts can plug in a shared store.
pub use rampart_core::repositories::{
    AttemptRepository, InMemoryRepository, IpRepository, KeyedRepository, RateWindowRepository,
};
pub use rampart_core::storage::{AttemptRecord, IpEntry, RateWindow};

/// Why a login attempt was refused before credentials were checked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginDenied {
    /// The source IP is blocked
    #[error("Access from this IP address is blocked")]
    IpBlocked,
    /// The identifier is locked
    #[error("Account is temporarily locked")]
    Locked { retry_after_ms: u64 },
}

impl LoginDenied {
    /// Seconds to put in a `Retry-After` header, rounded up.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            LoginDenied::IpBlocked => None,
            LoginDenied::Locked { retry_after_ms } => Some(retry_after_ms.div_ceil(1000)),
        }
    }
}

/// The access-protection coordinator.
///
/// `Rampart` wires the stores together once at startup and is shared by
/// reference (usually in an `Arc`) across request handlers. Use
/// [`RampartBuilder`] to construct one.
pub struct Rampart {
    config: SecurityConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    reputation: Arc<IpReputationStore>,
    guard: Arc<BruteForceGuard>,
    limiter: Arc<RateLimiter>,
    dashboard: SecurityDashboard,
    sink: Option<Arc<dyn AuditSink>>,
}

impl Rampart {
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn brute_force(&self) -> &BruteForceGuard {
        &self.guard
    }

    pub fn ip_reputation(&self) -> &IpReputationStore {
        &self.reputation
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn dashboard(&self) -> &SecurityDashboard {
        &self.dashboard
    }

    /// Check whether traffic from `ip` may proceed.
    ///
    /// A denial is audited as `IP_BLOCKED_ACCESS_ATTEMPT`.
    pub fn check_ip(&self, ip: &str, subject: Option<&str>) -> bool {
        if self.reputation.is_allowed(ip) {
            return true;
        }

        let ip = lookup_ip(ip);
        tracing::info!(ip = %ip, "Denied request from blocked IP");
        let mut details = EventDetails::new().ip(ip).outcome(Outcome::Denied);
        if let Some(subject) = subject {
            details = details.subject(subject);
        }
        self.audit
            .log_security_event(SecurityEventType::IpBlockedAccessAttempt, details);

        false
    }

    /// Gate a login attempt before credentials are verified.
    ///
    /// Consults the IP reputation first, then the lockout state of the
    /// identifier. Every denial is audited.
    pub fn check_login(&self, identifier: &str, ip: Option<&str>) -> Result<(), LoginDenied> {
        if let Some(ip) = ip {
            if !self.check_ip(ip, Some(identifier)) {
                return Err(LoginDenied::IpBlocked);
            }
        }

        let status = self.guard.lockout_status(identifier);
        if !status.is_locked {
            return Ok(());
        }

        tracing::info!(
            identifier = %status.identifier,
            remaining_ms = status.remaining_ms,
            "Denied login attempt for locked identifier"
        );
        self.audit.log_security_event(
            SecurityEventType::LoginAttemptWhileLocked,
            EventDetails::new()
                .subject(&status.identifier)
                .maybe_ip(ip)
                .outcome(Outcome::Denied)
                .detail("remaining_ms", status.remaining_ms),
        );

        Err(LoginDenied::Locked {
            retry_after_ms: status.remaining_ms,
        })
    }

    /// Report the outcome of a credential check.
    pub fn record_login(
        &self,
        identifier: &str,
        ip: Option<&str>,
        success: bool,
    ) -> Result<LockoutStatus, Error> {
        self.guard.record_attempt(identifier, ip, success)
    }

    /// Count a request against a route class for `key`.
    pub fn check_rate_limit(&self, route_class: &str, key: &str) -> Result<RateDecision, Error> {
        Ok(self.limiter.check_route_class(route_class, key)?)
    }

    /// Count a request for `key`, or for `fallback` when `key` is unusable.
    ///
    /// Falling back is audited as `RATE_LIMITER_DEGRADED`.
    pub fn check_rate_limit_or(
        &self,
        route_class: &str,
        key: &str,
        fallback: Option<&str>,
    ) -> Result<RateDecision, Error> {
        Ok(self.limiter.check_route_class_or(route_class, key, fallback)?)
    }

    /// Apply an administrative override on behalf of `actor_id`.
    ///
    /// The actor is recorded on the resulting audit event. Targets that were
    /// never tracked are a no-op success with `changed = false`.
    pub fn perform_admin_action(
        &self,
        actor_id: &str,
        action: AdminAction,
    ) -> Result<AdminOutcome, Error> {
        validate_actor_id(actor_id)?;
        action.validate()?;
        let actor_id = actor_id.trim();

        let (changed, ip_entry) = match &action {
            AdminAction::Unlock { identifier } => (self.guard.unlock(identifier, actor_id)?, None),
            AdminAction::BlockIp { ip, reason, ttl_ms } => {
                let reason = reason.as_deref().unwrap_or("blocked by administrator");
                let entry =
                    self.reputation
                        .block_ip(ip, reason, ttl_ms.map(millis), Some(actor_id))?;
                (true, Some(entry))
            }
            AdminAction::UnblockIp { ip, reason } => {
                let reason = reason.as_deref().unwrap_or("unblocked by administrator");
                let lifted = self.reputation.unblock_ip(ip, reason, Some(actor_id))?;
                (lifted, self.reputation.entry(ip)?)
            }
            AdminAction::WhitelistIp { ip } => {
                let entry = self.reputation.whitelist_ip(ip, Some(actor_id))?;
                (true, Some(entry))
            }
            AdminAction::RemoveFromWhitelist { ip } => {
                let removed = self.reputation.remove_from_whitelist(ip, Some(actor_id))?;
                (removed, self.reputation.entry(ip)?)
            }
        };

        tracing::info!(
            actor_id,
            action = action.name(),
            target = action.target(),
            changed,
            "Performed admin action"
        );

        Ok(AdminOutcome {
            action: action.name().to_string(),
            target: action.target().to_string(),
            actor_id: actor_id.to_string(),
            changed,
            ip_entry,
        })
    }

    /// Query the audit log, newest first.
    pub fn get_audit_logs(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, Error> {
        Ok(self.audit.get_audit_logs(query)?)
    }

    pub fn get_brute_force_stats(&self) -> Result<BruteForceStats, Error> {
        self.dashboard.get_brute_force_stats()
    }

    pub fn get_security_overview(&self) -> SecurityOverview {
        self.dashboard.get_security_overview()
    }

    /// Evict expired state from every store once.
    pub fn sweep(&self) {
        sweep_stores(&self.guard, &self.reputation, &self.limiter);
    }

    /// Start the background tasks.
    ///
    /// This spawns the periodic sweep and, when an audit sink is configured,
    /// the audit delivery worker. Both stop when `shutdown` changes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_background_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        if let Some(sink) = &self.sink {
            handles.push(
                self.audit
                    .start_delivery_task(Arc::clone(sink), shutdown.clone()),
            );
        }

        handles.push(self.start_sweep_task(shutdown));
        handles
    }

    fn start_sweep_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let guard = Arc::clone(&self.guard);
        let reputation = Arc::clone(&self.reputation);
        let limiter = Arc::clone(&self.limiter);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {
                        sweep_stores(&guard, &reputation, &limiter);
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Shutting down rampart sweep task");
                        break;
                    }
                }
            }
        })
    }

    pub(crate) fn from_parts(
        config: SecurityConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        reputation: Arc<IpReputationStore>,
        guard: Arc<BruteForceGuard>,
        limiter: Arc<RateLimiter>,
        sink: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        let dashboard = SecurityDashboard::new(
            guard.clone(),
            reputation.clone(),
            limiter.clone(),
            audit.clone(),
            clock.clone(),
        );

        Self {
            config,
            clock,
            audit,
            reputation,
            guard,
            limiter,
            dashboard,
            sink,
        }
    }

    /// Current time as seen by the engine.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

fn sweep_stores(guard: &BruteForceGuard, reputation: &IpReputationStore, limiter: &RateLimiter) {
    match guard.sweep() {
        Ok(count) if count > 0 => tracing::info!(count, "Swept attempt records"),
        Err(e) => tracing::warn!(error = %e, "Failed to sweep attempt records"),
        _ => {}
    }
    match reputation.sweep() {
        Ok(count) if count > 0 => tracing::info!(count, "Swept IP reputation entries"),
        Err(e) => tracing::warn!(error = %e, "Failed to sweep IP reputation entries"),
        _ => {}
    }
    match limiter.sweep() {
        Ok(count) if count > 0 => tracing::debug!(count, "Swept rate limit windows"),
        Err(e) => tracing::warn!(error = %e, "Failed to sweep rate limit windows"),
        _ => {}
    }
}
