//! Per-request authentication pipeline.
//!
//! Strictly sequential per request: trust check, cache lookup, directory
//! fallback, cache fill. The outcome is a [`Decision`] that the forwarding
//! strategy turns into a response. Concurrent requests share only the
//! identity cache, which synchronizes itself.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::header::HeaderName;
use http::{HeaderMap, HeaderValue, StatusCode};
use tracing::trace;

use crate::cache::IdentityCache;
use crate::resolver::{IdentityResolver, UserProfile};
use crate::trust::TrustedRanges;

/// Response/request header carrying the display name.
pub const HEADER_USER_NAME: HeaderName = HeaderName::from_static("peergate-user-name");
/// Response/request header carrying the login identifier.
pub const HEADER_USER_LOGIN: HeaderName = HeaderName::from_static("peergate-user-login");
/// Response/request header carrying the avatar URL.
pub const HEADER_USER_AVATAR: HeaderName = HeaderName::from_static("peergate-user-avatar");

/// Request header naming the peer host (access-check mode).
pub const HEADER_REMOTE_ADDR: HeaderName = HeaderName::from_static("peergate-remote-addr");
/// Request header naming the peer port (access-check mode).
pub const HEADER_REMOTE_PORT: HeaderName = HeaderName::from_static("peergate-remote-port");

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The declared peer address headers are missing or unparsable.
    BadPeerAddr,
    /// The directory could not be queried.
    Unreachable,
    /// The peer is a tagged service endpoint; such peers never get an
    /// identity.
    TaggedPeer,
}

impl DenyReason {
    /// Client-facing status for this denial.
    ///
    /// Resolution failures never surface as server errors.
    pub fn status(self) -> StatusCode {
        match self {
            DenyReason::BadPeerAddr | DenyReason::Unreachable => StatusCode::UNAUTHORIZED,
            DenyReason::TaggedPeer => StatusCode::FORBIDDEN,
        }
    }
}

/// Outcome of the pipeline for one request. Never stored.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Peer is in a trusted range; allowed with no identity headers.
    Bypassed,
    /// Peer resolved to a user; identity headers carry the profile.
    Resolved(Arc<UserProfile>),
    /// Peer denied; respond with the reason's status and stop.
    Denied(DenyReason),
}

impl Decision {
    /// Login to record in the access log (`unknown` for anything that is not
    /// a resolved user).
    pub fn login(&self) -> &str {
        match self {
            Decision::Resolved(profile) if !profile.login.is_empty() => &profile.login,
            _ => "unknown",
        }
    }
}

/// The identity-resolution pipeline shared by both forwarding strategies.
///
/// Built once at startup with its cache and resolver injected; cheap to share
/// across connection tasks behind an `Arc`.
pub struct AuthPipeline {
    trusted: TrustedRanges,
    cache: IdentityCache,
    resolver: IdentityResolver,
}

impl AuthPipeline {
    /// Assemble the pipeline from its already-constructed parts.
    pub fn new(trusted: TrustedRanges, cache: IdentityCache, resolver: IdentityResolver) -> Self {
        Self {
            trusted,
            cache,
            resolver,
        }
    }

    /// Decide what to do with a request from `peer`.
    ///
    /// Trusted peers never reach the directory. A cache hit wins even when
    /// the entry is about to expire; there is no refresh-ahead.
    pub async fn authorize(&self, peer: SocketAddr) -> Decision {
        if self.trusted.contains(peer.ip()) {
            trace!(peer = %peer, "peer is in a trusted range");
            return Decision::Bypassed;
        }

        if let Some(profile) = self.cache.get(peer.ip()) {
            trace!(peer = %peer, login = %profile.login, "identity served from cache");
            return Decision::Resolved(profile);
        }

        match self.resolver.resolve(peer).await {
            Ok(profile) => Decision::Resolved(profile),
            Err(reason) => Decision::Denied(reason),
        }
    }
}

/// Parse the peer address declared in the request headers (access-check
/// mode).
///
/// Both headers are required together; anything missing or unparsable is a
/// denial with an unauthorized outcome, and the directory is never consulted
/// for such requests.
pub fn peer_from_headers(headers: &HeaderMap) -> Result<SocketAddr, DenyReason> {
    let host = headers
        .get(&HEADER_REMOTE_ADDR)
        .and_then(|v| v.to_str().ok())
        .ok_or(DenyReason::BadPeerAddr)?;
    let port = headers
        .get(&HEADER_REMOTE_PORT)
        .and_then(|v| v.to_str().ok())
        .ok_or(DenyReason::BadPeerAddr)?;

    let ip: IpAddr = host.parse().map_err(|_| DenyReason::BadPeerAddr)?;
    let port: u16 = port.parse().map_err(|_| DenyReason::BadPeerAddr)?;
    Ok(SocketAddr::new(ip, port))
}

/// Set the three identity headers from `profile`.
///
/// A profile field that does not fit in a header value (non-ASCII display
/// names can) is carried as an empty value rather than dropping the header.
pub fn apply_identity(headers: &mut HeaderMap, profile: &UserProfile) {
    let value = |s: &str| HeaderValue::from_str(s).unwrap_or(HeaderValue::from_static(""));
    headers.insert(HEADER_USER_NAME, value(&profile.name));
    headers.insert(HEADER_USER_LOGIN, value(&profile.login));
    headers.insert(HEADER_USER_AVATAR, value(&profile.avatar));
}

/// Remove any identity headers already present.
///
/// Applied to inbound requests in proxy mode so a client can never smuggle
/// an identity past a trust bypass.
pub fn strip_identity(headers: &mut HeaderMap) {
    headers.remove(&HEADER_USER_NAME);
    headers.remove(&HEADER_USER_LOGIN);
    headers.remove(&HEADER_USER_AVATAR);
}
