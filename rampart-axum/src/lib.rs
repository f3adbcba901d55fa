//! # Rampart Axum Integration
//!
//! This crate provides Axum routes and middleware for the Rampart access-protection engine.
//!
//! ## Features
//!
//! - **Admin routes**: audit log queries, brute force stats, the security overview and
//!   administrative overrides (unlock, block, unblock, whitelist)
//! - **Rate limiting**: a layer per route class, keyed by caller identity or peer address
//! - **IP guard**: a layer rejecting blocked peers with `403`
//!
//! Administrators are authenticated by the host. Its access-control layer inserts an
//! [`AdminActor`] request extension, which is recorded on every override.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::{net::SocketAddr, sync::Arc};
//! use axum::{Router, routing::post};
//! use rampart::RampartBuilder;
//! use rampart_axum::{admin_routes, ip_guard_layer, rate_limit_layer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let rampart = Arc::new(RampartBuilder::new().build().unwrap());
//!
//!     let app = Router::new()
//!         .route("/login", post(login_handler))
//!         .layer(rate_limit_layer(rampart.clone(), "auth"))
//!         // Mount behind your own admin authentication
//!         .nest("/admin/security", admin_routes(rampart.clone()))
//!         .layer(ip_guard_layer(rampart));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
//!         .await
//!         .unwrap();
//! }
//!
//! async fn login_handler() -> &'static str {
//!     "This route is rate limited!"
//! }
//! ```

mod error;
mod extractors;
mod middleware;
mod routes;
mod types;

pub use error::{Result, SecurityError};
pub use extractors::{AdminActor, CallerId, PeerIp};
pub use middleware::{
    IpGuardLayer, IpGuardService, RateLimitLayer, RateLimitService, ip_guard_layer,
    rate_limit_layer,
};
pub use routes::{AdminState, create_admin_router};
pub use types::{AuditLogParams, AuditLogResponse};

use axum::Router;
use rampart::Rampart;
use std::sync::Arc;

/// Create the administrative routes for your Axum application.
///
/// # Routes
///
/// - `GET /audit-logs?event_type&user_id&risk_level&start_date&end_date&limit`
/// - `GET /brute-force/stats`
/// - `GET /overview`
/// - `POST /actions` with a JSON [`rampart::AdminAction`]; requires [`AdminActor`]
///
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use axum::Router;
/// # let rampart = Arc::new(rampart::RampartBuilder::new().build().unwrap());
/// let app: Router = Router::new().nest("/admin/security", rampart_axum::admin_routes(rampart));
/// ```
pub fn admin_routes(rampart: Arc<Rampart>) -> Router {
    create_admin_router(rampart)
}
