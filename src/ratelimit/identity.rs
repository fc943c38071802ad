//! Caller identity resolution.
//!
//! Precedence is fixed: the first entry of the `X-Forwarded-For` chain, then
//! the peer IP of the connection, then the literal `"unknown"`. Callers behind
//! a shared forwarding proxy therefore share one quota bucket, as do all
//! callers whose address cannot be determined.

use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Header carrying the forwarded-address chain.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Key used when no address is available.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Request metadata the resolver needs, as supplied by the network stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Raw `X-Forwarded-For` header values, in the order they were received.
    pub forwarded_for: Vec<String>,
    /// Address of the directly connected peer.
    pub peer_addr: Option<IpAddr>,
}

impl RequestMeta {
    /// Metadata with only a peer address.
    pub fn from_peer(addr: IpAddr) -> Self {
        Self {
            forwarded_for: Vec::new(),
            peer_addr: Some(addr),
        }
    }

    /// Metadata with a forwarded chain and an optional peer address.
    pub fn forwarded(chain: impl Into<String>, peer_addr: Option<IpAddr>) -> Self {
        Self {
            forwarded_for: vec![chain.into()],
            peer_addr,
        }
    }

    /// Metadata for a request with no address information at all.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Collect metadata from request headers and the connection address.
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let forwarded_for = headers
            .get_all(FORWARDED_FOR)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();

        Self {
            forwarded_for,
            peer_addr: peer.map(|addr| addr.ip()),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestMeta
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(RequestMeta::from_headers(&parts.headers, peer))
    }
}

/// Opaque per-caller key that partitions quota state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap an existing key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The shared bucket for unidentifiable callers.
    pub fn unknown() -> Self {
        Self(UNKNOWN_IDENTITY.to_string())
    }

    /// Borrow the key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Derive the identity for a request. Never fails.
pub fn resolve_identity(meta: &RequestMeta) -> Identity {
    if let Some(client) = first_forwarded(&meta.forwarded_for) {
        return Identity::new(client);
    }

    match meta.peer_addr {
        Some(addr) => Identity::new(addr.to_string()),
        None => Identity::unknown(),
    }
}

/// First entry of the chain, if that entry is non-empty.
fn first_forwarded(values: &[String]) -> Option<&str> {
    let first = values.first()?.split(',').next()?.trim();
    (!first.is_empty()).then_some(first)
}
