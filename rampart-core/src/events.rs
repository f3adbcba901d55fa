//! Security events and the sinks that persist them.
//!
//! Every security-relevant transition in the engine produces an [`AuditEvent`].
//! Events are immutable once appended to the audit log and are forwarded to
//! an [`AuditSink`] off the decision path.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{SinkError, ValidationError},
    id::EventId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            // WARNING is the level operators know override attempts by
            "MEDIUM" | "WARNING" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(ValidationError::InvalidFilter(format!(
                "unknown risk level: {other}"
            ))),
        }
    }
}

/// Kinds of security events.
///
/// The severity of an event is a fixed function of its type, see
/// [`SecurityEventType::severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    LoginSuccess,
    LoginFailure,
    AccountLocked,
    AccountUnlocked,
    LoginAttemptWhileLocked,
    IpBlocked,
    IpUnblocked,
    IpWhitelisted,
    IpWhitelistRemoved,
    IpBlockOverrideRejected,
    IpBlockedAccessAttempt,
    IpAutoBlocked,
    RateLimited,
    RateLimitAbuse,
    RateLimiterDegraded,
}

impl SecurityEventType {
    pub const ALL: [SecurityEventType; 15] = [
        SecurityEventType::LoginSuccess,
        SecurityEventType::LoginFailure,
        SecurityEventType::AccountLocked,
        SecurityEventType::AccountUnlocked,
        SecurityEventType::LoginAttemptWhileLocked,
        SecurityEventType::IpBlocked,
        SecurityEventType::IpUnblocked,
        SecurityEventType::IpWhitelisted,
        SecurityEventType::IpWhitelistRemoved,
        SecurityEventType::IpBlockOverrideRejected,
        SecurityEventType::IpBlockedAccessAttempt,
        SecurityEventType::IpAutoBlocked,
        SecurityEventType::RateLimited,
        SecurityEventType::RateLimitAbuse,
        SecurityEventType::RateLimiterDegraded,
    ];

    pub fn severity(&self) -> Severity {
        use SecurityEventType::*;

        match self {
            LoginSuccess | LoginFailure | RateLimited => Severity::Low,
            AccountUnlocked
            | LoginAttemptWhileLocked
            | IpUnblocked
            | IpWhitelisted
            | IpWhitelistRemoved
            | IpBlockOverrideRejected
            | IpBlockedAccessAttempt
            | RateLimiterDegraded => Severity::Medium,
            AccountLocked | IpBlocked | RateLimitAbuse => Severity::High,
            IpAutoBlocked => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use SecurityEventType::*;

        match self {
            LoginSuccess => "LOGIN_SUCCESS",
            LoginFailure => "LOGIN_FAILURE",
            AccountLocked => "ACCOUNT_LOCKED",
            AccountUnlocked => "ACCOUNT_UNLOCKED",
            LoginAttemptWhileLocked => "LOGIN_ATTEMPT_WHILE_LOCKED",
            IpBlocked => "IP_BLOCKED",
            IpUnblocked => "IP_UNBLOCKED",
            IpWhitelisted => "IP_WHITELISTED",
            IpWhitelistRemoved => "IP_WHITELIST_REMOVED",
            IpBlockOverrideRejected => "IP_BLOCK_OVERRIDE_REJECTED",
            IpBlockedAccessAttempt => "IP_BLOCKED_ACCESS_ATTEMPT",
            IpAutoBlocked => "IP_AUTO_BLOCKED",
            RateLimited => "RATE_LIMITED",
            RateLimitAbuse => "RATE_LIMIT_ABUSE",
            RateLimiterDegraded => "RATE_LIMITER_DEGRADED",
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityEventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == wanted)
            .ok_or_else(|| ValidationError::InvalidFilter(format!("unknown event type: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
    Denied,
    Info,
}

/// An appended security event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: EventId,
    /// Position in the append order of this process
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    /// Set for administrator-triggered events
    pub actor_id: Option<String>,
    pub subject_identifier: Option<String>,
    pub ip: Option<String>,
    pub details: Map<String, Value>,
    pub outcome: Outcome,
}

impl AuditEvent {
    /// Whether `actor_id` acted in this event or `subject`, in its normalized
    /// form, was acted upon.
    pub fn involves(&self, actor_id: &str, subject: Option<&str>) -> bool {
        self.actor_id.as_deref() == Some(actor_id)
            || subject.is_some_and(|subject| self.subject_identifier.as_deref() == Some(subject))
    }
}

/// The caller-supplied part of an event.
///
/// # Example
///
/// ```rust
/// use rampart_core::events::{EventDetails, Outcome};
///
/// let details = EventDetails::new()
///     .subject("a@x.com")
///     .ip("1.2.3.4")
///     .outcome(Outcome::Failure)
///     .detail("failed_attempts", 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventDetails {
    pub actor_id: Option<String>,
    pub subject_identifier: Option<String>,
    pub ip: Option<String>,
    pub outcome: Option<Outcome>,
    pub details: Map<String, Value>,
}

impl EventDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn maybe_actor(mut self, actor_id: Option<&str>) -> Self {
        self.actor_id = actor_id.map(str::to_string);
        self
    }

    pub fn subject(mut self, identifier: impl Into<String>) -> Self {
        self.subject_identifier = Some(identifier.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn maybe_ip(mut self, ip: Option<&str>) -> Self {
        self.ip = ip.map(str::to_string);
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Durable destination for audit events.
///
/// Writes happen on a background task. A failing sink is retried with
/// backoff and never affects the decision that produced the event.
///
/// # Examples
///
/// ```
/// # use rampart_core::events::{AuditEvent, AuditSink};
/// # use rampart_core::error::SinkError;
/// # use async_trait::async_trait;
/// struct StdoutSink;
///
/// #[async_trait]
/// impl AuditSink for StdoutSink {
///     async fn write(&self, event: &AuditEvent) -> Result<(), SinkError> {
///         println!("{} {}", event.sequence, event.event_type);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn write(&self, event: &AuditEvent) -> Result<(), SinkError>;
}

/// Sink that emits every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn write(&self, event: &AuditEvent) -> Result<(), SinkError> {
        let details = serde_json::to_string(&event.details)
            .map_err(|e| SinkError::Rejected(e.to_string()))?;

        tracing::info!(
            target: "rampart::audit",
            id = %event.id,
            sequence = event.sequence,
            event_type = %event.event_type,
            severity = %event.severity,
            actor_id = event.actor_id.as_deref().unwrap_or("-"),
            subject = event.subject_identifier.as_deref().unwrap_or("-"),
            ip = event.ip.as_deref().unwrap_or("-"),
            details = %details,
            "security event"
        );

        Ok(())
    }
}
