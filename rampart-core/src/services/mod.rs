//! Service layer
//!
//! Each service owns one kind of state and the policy around it. Services
//! depend on each other leaf-first: the audit log has no dependencies, the IP
//! reputation store writes to the audit log, and the brute force guard and
//! rate limiter may hand abusive IPs to the reputation store.

pub mod admin;
pub mod audit;
pub mod brute_force;
pub mod dashboard;
pub mod ip_reputation;
pub mod rate_limit;

pub use admin::{AdminAction, AdminOutcome};
pub use audit::{AuditHealth, AuditLog, AuditQuery, SeverityCounts};
pub use brute_force::{BruteForceGuard, BruteForceStats};
pub use dashboard::{Offender, OffenderKind, Section, SecurityDashboard, SecurityOverview};
pub use ip_reputation::IpReputationStore;
pub use rate_limit::{RateLimiter, RateViolation};
