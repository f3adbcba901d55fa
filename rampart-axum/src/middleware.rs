//! Tower layers that put rampart decisions in front of a router.
//!
//! Both layers decide synchronously from in-memory state before the inner
//! service runs; denied requests never reach it.
//!
//! ```rust,no_run
//! use std::{net::SocketAddr, sync::Arc};
//! use axum::{Router, routing::post};
//! use rampart::RampartBuilder;
//! use rampart_axum::{ip_guard_layer, rate_limit_layer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let rampart = Arc::new(RampartBuilder::new().build()?);
//!
//! let app = Router::new()
//!     .route("/login", post(|| async { "ok" }))
//!     .layer(rate_limit_layer(rampart.clone(), "auth"))
//!     .layer(ip_guard_layer(rampart));
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
//! # Ok(())
//! # }
//! ```

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use rampart::Rampart;
use tower::{Layer, Service};

use crate::{
    error::SecurityError,
    extractors::{AdminActor, CallerId, peer_ip, peer_key, rate_key},
};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

/// Rate limit every request against `route_class`.
///
/// Requests are keyed by `actor:<id>` when an [`AdminActor`] or [`CallerId`]
/// extension is present, otherwise by `ip:<peer address>`. Denied requests
/// get `429` with `Retry-After`; allowed ones carry `x-ratelimit-limit` and
/// `x-ratelimit-remaining`.
pub fn rate_limit_layer(rampart: Arc<Rampart>, route_class: &str) -> RateLimitLayer {
    RateLimitLayer {
        rampart,
        route_class: Arc::from(route_class),
    }
}

/// Reject requests from blocked peers with `403`.
pub fn ip_guard_layer(rampart: Arc<Rampart>) -> IpGuardLayer {
    IpGuardLayer { rampart }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    rampart: Arc<Rampart>,
    route_class: Arc<str>,
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            rampart: self.rampart.clone(),
            route_class: self.route_class.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    rampart: Arc<Rampart>,
    route_class: Arc<str>,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let mut inner = self.inner.clone();

        let Some(key) = rate_key(request.extensions()) else {
            tracing::debug!(
                route_class = %self.route_class,
                "No caller identity or peer address, skipping rate limit"
            );
            return Box::pin(async move { inner.call(request).await });
        };

        let fallback = peer_key(request.extensions()).filter(|peer| *peer != key);
        let route_class = &self.route_class;
        let decision = match self
            .rampart
            .check_rate_limit_or(route_class, &key, fallback.as_deref())
        {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "No usable rate limit key, allowing request");
                return Box::pin(async move { inner.call(request).await });
            }
        };

        if !decision.allowed {
            let response = SecurityError::RateLimited {
                retry_after_ms: decision.retry_after_ms,
            }
            .into_response();
            return Box::pin(async move { Ok(response) });
        }

        Box::pin(async move {
            let mut response = inner.call(request).await?;
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
            Ok(response)
        })
    }
}

#[derive(Clone)]
pub struct IpGuardLayer {
    rampart: Arc<Rampart>,
}

impl<S> Layer<S> for IpGuardLayer {
    type Service = IpGuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IpGuardService {
            inner,
            rampart: self.rampart.clone(),
        }
    }
}

#[derive(Clone)]
pub struct IpGuardService<S> {
    inner: S,
    rampart: Arc<Rampart>,
}

impl<S> Service<Request> for IpGuardService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let mut inner = self.inner.clone();

        if let Some(ip) = peer_ip(request.extensions()) {
            let extensions = request.extensions();
            let subject = extensions
                .get::<AdminActor>()
                .map(|actor| actor.0.as_str())
                .or_else(|| extensions.get::<CallerId>().map(|caller| caller.0.as_str()));

            if !self.rampart.check_ip(&ip, subject) {
                let response = SecurityError::IpBlocked.into_response();
                return Box::pin(async move { Ok(response) });
            }
        }

        Box::pin(async move { inner.call(request).await })
    }
}
