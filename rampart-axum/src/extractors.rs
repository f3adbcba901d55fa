use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{Extensions, StatusCode, request::Parts},
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::error::SecurityError;

/// The authenticated administrator behind a request.
///
/// Rampart does not authenticate administrators itself. The host's
/// access-control layer inserts this as a request extension once it has
/// verified the caller may perform overrides; admin actions without it are
/// rejected with `401`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminActor(pub String);

impl<S> FromRequestParts<S> for AdminActor
where
    S: Send + Sync,
{
    type Rejection = SecurityError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AdminActor>()
            .filter(|actor| !actor.0.trim().is_empty())
            .cloned()
            .ok_or(SecurityError::Unauthorized)
    }
}

/// Identity of an authenticated, non-admin caller, used to key rate limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

/// The peer address of the connection, when the server exposes it through
/// `into_make_service_with_connect_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIp(pub Option<String>);

impl<S> FromRequestParts<S> for PeerIp
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(PeerIp(peer_ip(&parts.extensions)))
    }
}

pub(crate) fn peer_ip(extensions: &Extensions) -> Option<String> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Bytes of a caller identity escaped before it becomes part of a rate key.
const IDENTITY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'_')
    .remove(b'-')
    .remove(b'@')
    .remove(b'+');

/// Rate limit key for a request: the caller identity when known, otherwise
/// the peer address.
pub(crate) fn rate_key(extensions: &Extensions) -> Option<String> {
    let admin = extensions.get::<AdminActor>().map(|AdminActor(id)| id);
    let caller = extensions.get::<CallerId>().map(|CallerId(id)| id);

    admin
        .into_iter()
        .chain(caller)
        .map(|id| id.trim())
        .find(|id| !id.is_empty())
        .map(|id| format!("actor:{}", utf8_percent_encode(id, IDENTITY)))
        .or_else(|| peer_key(extensions))
}

/// Rate limit key for the peer address alone.
pub(crate) fn peer_key(extensions: &Extensions) -> Option<String> {
    peer_ip(extensions).map(|ip| format!("ip:{ip}"))
}
