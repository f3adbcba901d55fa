//! Engine configuration
//!
//! All settings deserialize from JSON with every field optional; omitted
//! fields take the defaults below. Durations are expressed in milliseconds.
//!
//! ```rust
//! use rampart_core::config::SecurityConfig;
//!
//! let config = SecurityConfig::from_json_str(r#"{
//!     "brute_force": { "failure_threshold": 3 },
//!     "rate_limit": { "route_classes": { "auth": { "limit": 5, "window_ms": 60000 } } }
//! }"#).unwrap();
//!
//! assert_eq!(config.brute_force.failure_threshold, 3);
//! assert_eq!(config.rate_limit.route_class("auth").limit, 5);
//! ```

use std::collections::HashMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

pub const DEFAULT_ROUTE_CLASS: &str = "default";

/// Milliseconds as a [`chrono::Duration`], saturating at `i64::MAX`.
pub fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub brute_force: BruteForceConfig,
    pub ip_reputation: IpReputationConfig,
    pub rate_limit: RateLimitConfig,
    pub audit: AuditConfig,
    /// How often the background sweep evicts expired state
    pub sweep_interval_ms: u64,
}

impl SecurityConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let config: SecurityConfig = serde_json::from_str(json)
            .map_err(|e| ValidationError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.brute_force.validate()?;
        self.rate_limit.validate()?;
        self.audit.validate()?;

        if self.sweep_interval_ms == 0 {
            return Err(ValidationError::InvalidConfig(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Brute force lockout settings.
///
/// The lockout duration doubles with every consecutive lockout of the same
/// identifier, starting at `lockout_base_duration_ms` and capped at
/// `lockout_max_duration_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BruteForceConfig {
    /// Whether brute force protection is enabled
    pub enabled: bool,
    /// Failures inside the attempt window that lock the identifier
    pub failure_threshold: u32,
    /// Window in which failures accumulate
    pub attempt_window_ms: u64,
    /// Duration of the first lockout
    pub lockout_base_duration_ms: u64,
    /// Upper bound for escalated lockouts
    pub lockout_max_duration_ms: u64,
    /// Distinct identifiers locked from one IP that trigger an IP block
    pub auto_block_threshold: u32,
    /// Rolling window for the cross-account check
    pub auto_block_window_ms: u64,
    /// Unlocked records idle for this long are evicted by the sweep
    pub idle_ttl_ms: u64,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            attempt_window_ms: 15 * MINUTE_MS,
            lockout_base_duration_ms: 15 * MINUTE_MS,
            lockout_max_duration_ms: DAY_MS,
            auto_block_threshold: 3,
            auto_block_window_ms: HOUR_MS,
            idle_ttl_ms: DAY_MS,
        }
    }
}

impl BruteForceConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn attempt_window(&self) -> Duration {
        millis(self.attempt_window_ms)
    }

    pub fn lockout_base_duration(&self) -> Duration {
        millis(self.lockout_base_duration_ms)
    }

    pub fn auto_block_window(&self) -> Duration {
        millis(self.auto_block_window_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        millis(self.idle_ttl_ms)
    }

    /// Lockout duration for the `nth` consecutive lockout (1-based).
    pub fn lockout_duration(&self, nth: u32) -> Duration {
        let doublings = nth.saturating_sub(1).min(32);
        let escalated = self
            .lockout_base_duration_ms
            .saturating_mul(1u64 << doublings);
        millis(escalated.min(self.lockout_max_duration_ms))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.failure_threshold == 0 {
            return Err(ValidationError::InvalidConfig(
                "failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.attempt_window_ms == 0 {
            return Err(ValidationError::InvalidConfig(
                "attempt_window_ms must be greater than zero".to_string(),
            ));
        }
        if self.lockout_base_duration_ms == 0 {
            return Err(ValidationError::InvalidConfig(
                "lockout_base_duration_ms must be greater than zero".to_string(),
            ));
        }
        if self.lockout_base_duration_ms > self.lockout_max_duration_ms {
            return Err(ValidationError::InvalidConfig(
                "lockout_base_duration_ms exceeds lockout_max_duration_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpReputationConfig {
    /// TTL applied to blocks issued without one; `0` blocks until unblocked
    pub ip_block_default_ttl_ms: u64,
    /// TTL of blocks issued by automatic policy
    pub auto_block_ttl_ms: u64,
    /// State changes kept per entry
    pub history_limit: usize,
    /// NORMAL entries untouched for this long are dropped by the sweep
    pub retention_ms: u64,
}

impl Default for IpReputationConfig {
    fn default() -> Self {
        Self {
            ip_block_default_ttl_ms: DAY_MS,
            auto_block_ttl_ms: HOUR_MS,
            history_limit: 16,
            retention_ms: 7 * DAY_MS,
        }
    }
}

impl IpReputationConfig {
    pub fn default_block_ttl(&self) -> Option<Duration> {
        (self.ip_block_default_ttl_ms > 0).then(|| millis(self.ip_block_default_ttl_ms))
    }

    pub fn auto_block_ttl(&self) -> Option<Duration> {
        (self.auto_block_ttl_ms > 0).then(|| millis(self.auto_block_ttl_ms))
    }

    pub fn retention(&self) -> Duration {
        millis(self.retention_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteClassLimit {
    pub limit: u32,
    pub window_ms: u64,
}

impl RouteClassLimit {
    pub fn new(limit: u32, window_ms: u64) -> Self {
        Self { limit, window_ms }
    }

    pub fn window(&self) -> Duration {
        millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-route-class limits; `default` is used for unknown classes
    pub route_classes: HashMap<String, RouteClassLimit>,
    /// Denials inside the escalation window that mark a key as abusive
    pub escalation_threshold: u32,
    pub escalation_window_ms: u64,
    /// Block the IP behind an abusive key
    pub auto_block_on_abuse: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let route_classes = HashMap::from([
            (DEFAULT_ROUTE_CLASS.to_string(), RouteClassLimit::new(100, MINUTE_MS)),
            ("auth".to_string(), RouteClassLimit::new(10, MINUTE_MS)),
            ("api".to_string(), RouteClassLimit::new(300, MINUTE_MS)),
            ("admin".to_string(), RouteClassLimit::new(60, MINUTE_MS)),
        ]);

        Self {
            route_classes,
            escalation_threshold: 10,
            escalation_window_ms: 5 * MINUTE_MS,
            auto_block_on_abuse: true,
        }
    }
}

impl RateLimitConfig {
    /// Resolve a route class, falling back to `default`.
    pub fn route_class(&self, class: &str) -> RouteClassLimit {
        self.route_classes
            .get(class)
            .or_else(|| self.route_classes.get(DEFAULT_ROUTE_CLASS))
            .copied()
            .unwrap_or(RouteClassLimit::new(100, MINUTE_MS))
    }

    pub fn escalation_window(&self) -> Duration {
        millis(self.escalation_window_ms)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        for (class, limit) in &self.route_classes {
            if limit.window_ms == 0 {
                return Err(ValidationError::InvalidConfig(format!(
                    "route class {class} has a zero window"
                )));
            }
        }
        if self.escalation_threshold == 0 {
            return Err(ValidationError::InvalidConfig(
                "escalation_threshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Events kept in memory for queries; the oldest are dropped first
    pub memory_capacity: usize,
    pub default_query_limit: usize,
    pub max_query_limit: usize,
    /// Sink writes attempted per event before it is dropped
    pub max_delivery_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 10_000,
            default_query_limit: 100,
            max_query_limit: 1_000,
            max_delivery_attempts: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
        }
    }
}

impl AuditConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> std::time::Duration {
        let doublings = attempt.saturating_sub(1).min(20);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << doublings)
            .min(self.retry_max_delay_ms);
        std::time::Duration::from_millis(delay)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.memory_capacity == 0 {
            return Err(ValidationError::InvalidConfig(
                "memory_capacity must be greater than zero".to_string(),
            ));
        }
        if self.default_query_limit == 0 || self.default_query_limit > self.max_query_limit {
            return Err(ValidationError::InvalidConfig(
                "default_query_limit must be between 1 and max_query_limit".to_string(),
            ));
        }
        if self.max_delivery_attempts == 0 {
            return Err(ValidationError::InvalidConfig(
                "max_delivery_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            brute_force: BruteForceConfig::default(),
            ip_reputation: IpReputationConfig::default(),
            rate_limit: RateLimitConfig::default(),
            audit: AuditConfig::default(),
            sweep_interval_ms: MINUTE_MS,
        }
    }
}
