//! Identity resolver adapter.
//!
//! Wraps the directory call and translates its answer into either a
//! [`UserProfile`] or a denial reason. On success the profile is written to
//! the identity cache under the peer's host address; denials are never
//! cached, so a denied peer is re-resolved on its next request.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::cache::IdentityCache;
use crate::directory::Directory;
use crate::pipeline::DenyReason;

/// A verified human user behind a peer address.
///
/// Created only by the resolver adapter on a successful lookup and immutable
/// afterwards. Any field may be empty; the directory decides what it knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    /// Display name, e.g. `Ada Lovelace`.
    pub name: String,
    /// Login identifier, e.g. `ada@example.com`.
    pub login: String,
    /// Profile picture URL.
    pub avatar: String,
}

/// Resolves peers through the directory and keeps the cache warm.
pub struct IdentityResolver {
    directory: Arc<dyn Directory>,
    cache: IdentityCache,
}

impl IdentityResolver {
    /// Build a resolver over `directory`, filling `cache` on success.
    pub fn new(directory: Arc<dyn Directory>, cache: IdentityCache) -> Self {
        Self { directory, cache }
    }

    /// Resolve `peer` to a user profile.
    ///
    /// A directory failure maps to [`DenyReason::Unreachable`]; a tagged
    /// (service) peer maps to [`DenyReason::TaggedPeer`] and is never given a
    /// profile. On success the cache is warm for this peer's host address.
    pub async fn resolve(&self, peer: SocketAddr) -> Result<Arc<UserProfile>, DenyReason> {
        let reply = match self.directory.whois(peer).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(peer = %peer, error = %err, "directory lookup failed");
                return Err(DenyReason::Unreachable);
            }
        };

        if reply.is_tagged() {
            debug!(peer = %peer, "peer is a tagged service endpoint");
            return Err(DenyReason::TaggedPeer);
        }

        let profile = Arc::new(UserProfile {
            name: reply.user.display_name,
            login: reply.user.login,
            avatar: reply.user.avatar_url,
        });
        self.cache.insert(peer.ip(), profile.clone());
        Ok(profile)
    }
}
