//! Core functionality for the rampart project
//!
//! This crate contains the access-protection engine: brute force lockout,
//! IP reputation, rate limiting and the security audit log, plus a read-only
//! dashboard that aggregates them.
//!
//! The engine is designed to be assembled by the `rampart` crate and is not
//! usually constructed piece by piece by application code.
//!
//! See [`services::BruteForceGuard`], [`services::IpReputationStore`],
//! [`services::RateLimiter`] and [`services::AuditLog`] for the stores, and
//! [`repositories::KeyedRepository`] for the storage seam they share.
//!
//! All state is held per process. Running several instances requires a
//! [`repositories::KeyedRepository`] backed by a shared store.
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod id;
pub mod repositories;
pub mod services;
pub mod storage;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SecurityConfig;
pub use error::Error;
pub use events::{AuditEvent, AuditSink, EventDetails, SecurityEventType, Severity};
pub use storage::{IpState, LockoutStatus, RateDecision};
