//! Builder for constructing Rampart instances
//!
//! Every store defaults to in-memory state and the system clock. Replace the
//! repositories to share state between instances, or the clock to drive
//! time in tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use rampart::{RampartBuilder, TracingSink};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let rampart = RampartBuilder::new()
//!     .with_config_json(r#"{ "brute_force": { "failure_threshold": 3 } }"#)?
//!     .with_audit_sink(Arc::new(TracingSink))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use rampart_core::{
    clock::{Clock, SystemClock},
    services::{AuditLog, BruteForceGuard, IpReputationStore, RateLimiter},
    storage::{AttemptRecord, IpEntry, RateWindow},
};

use crate::{
    AttemptRepository, AuditSink, BruteForceConfig, InMemoryRepository, IpRepository, Rampart,
    RateWindowRepository, RouteClassLimit, SecurityConfig,
};

/// Errors that can occur when building a Rampart instance.
#[derive(Debug, thiserror::Error)]
pub enum RampartBuilderError {
    /// Invalid configuration provided
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Builder for [`Rampart`].
///
/// # Defaults
///
/// - Configuration: [`SecurityConfig::default`]
/// - Clock: system clock
/// - Repositories: in-memory
/// - Audit sink: none, events are kept in memory only
pub struct RampartBuilder {
    config: SecurityConfig,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn AuditSink>>,
    attempts: Option<Arc<dyn AttemptRepository>>,
    ips: Option<Arc<dyn IpRepository>>,
    windows: Option<Arc<dyn RateWindowRepository>>,
}

impl Default for RampartBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RampartBuilder {
    pub fn new() -> Self {
        Self {
            config: SecurityConfig::default(),
            clock: Arc::new(SystemClock),
            sink: None,
            attempts: None,
            ips: None,
            windows: None,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: SecurityConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the configuration from JSON; omitted fields keep their defaults.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rampart::RampartBuilder;
    ///
    /// let builder = RampartBuilder::new()
    ///     .with_config_json(r#"{ "rate_limit": { "escalation_threshold": 20 } }"#)
    ///     .unwrap();
    /// ```
    pub fn with_config_json(mut self, json: &str) -> Result<Self, RampartBuilderError> {
        self.config = SecurityConfig::from_json_str(json)
            .map_err(|e| RampartBuilderError::InvalidConfiguration(e.to_string()))?;
        Ok(self)
    }

    /// Configure brute force protection settings.
    ///
    /// Default: enabled, 5 failures lock for 15 minutes, doubling per
    /// consecutive lockout up to 24 hours
    pub fn with_brute_force_protection(mut self, config: BruteForceConfig) -> Self {
        self.config.brute_force = config;
        self
    }

    /// Set the limit for one rate limit route class, adding it if new.
    pub fn with_route_class(mut self, class: &str, limit: u32, window_ms: u64) -> Self {
        self.config
            .rate_limit
            .route_classes
            .insert(class.to_string(), RouteClassLimit::new(limit, window_ms));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deliver audit events to `sink` once background tasks are started.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_attempt_repository(mut self, repository: Arc<dyn AttemptRepository>) -> Self {
        self.attempts = Some(repository);
        self
    }

    pub fn with_ip_repository(mut self, repository: Arc<dyn IpRepository>) -> Self {
        self.ips = Some(repository);
        self
    }

    pub fn with_rate_window_repository(
        mut self,
        repository: Arc<dyn RateWindowRepository>,
    ) -> Self {
        self.windows = Some(repository);
        self
    }

    /// Validate the configuration and wire the stores together.
    pub fn build(self) -> Result<Rampart, RampartBuilderError> {
        self.config
            .validate()
            .map_err(|e| RampartBuilderError::InvalidConfiguration(e.to_string()))?;

        let config = self.config;
        let clock = self.clock;

        let audit = Arc::new(AuditLog::new(config.audit.clone(), clock.clone()));

        let ips = self
            .ips
            .unwrap_or_else(|| Arc::new(InMemoryRepository::<IpEntry>::new()));
        let reputation = Arc::new(IpReputationStore::new(
            ips,
            config.ip_reputation.clone(),
            audit.clone(),
            clock.clone(),
        ));

        let attempts = self
            .attempts
            .unwrap_or_else(|| Arc::new(InMemoryRepository::<AttemptRecord>::new()));
        let guard = Arc::new(
            BruteForceGuard::new(
                attempts,
                config.brute_force.clone(),
                audit.clone(),
                clock.clone(),
            )
            .with_reputation(reputation.clone()),
        );

        let windows = self
            .windows
            .unwrap_or_else(|| Arc::new(InMemoryRepository::<RateWindow>::new()));
        let limiter = Arc::new(
            RateLimiter::new(
                windows,
                config.rate_limit.clone(),
                audit.clone(),
                clock.clone(),
            )
            .with_reputation(reputation.clone()),
        );

        tracing::debug!(
            brute_force_enabled = config.brute_force.enabled,
            sink = self.sink.is_some(),
            "Built rampart"
        );

        Ok(Rampart::from_parts(
            config, clock, audit, reputation, guard, limiter, self.sink,
        ))
    }
}
