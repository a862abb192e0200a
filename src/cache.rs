//! Bounded, TTL-based identity cache.
//!
//! Maps a peer's host address to its resolved profile so that repeated
//! requests from the same peer cost one directory lookup per TTL window
//! instead of one per request. The cache is a best-effort accelerator, never
//! a source of truth: a false miss is always safe, a false hit is never
//! acceptable. Expiry is enforced at read time, so a stale entry is never
//! returned even if it is still physically stored.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::resolver::UserProfile;

/// Concurrent identity cache keyed by peer host address.
///
/// Every entry has unit cost, so the capacity bound is a maximum entry count.
/// When the bound is reached an approximate least-valuable entry is evicted
/// (TinyLFU admission/eviction); correctness never depends on which entry
/// goes, only on the bound being respected. All entries share the single TTL
/// fixed at construction. Internally synchronized; callers never take locks.
#[derive(Clone)]
pub struct IdentityCache {
    inner: Cache<String, Arc<UserProfile>>,
}

impl IdentityCache {
    /// Create a cache bounded to `max_entries` with a uniform `ttl`.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    /// Look up the profile for a peer host address.
    ///
    /// Returns `None` when the key was never set, has expired, or was
    /// evicted. A miss is an ordinary outcome, not an error.
    pub fn get(&self, ip: IpAddr) -> Option<Arc<UserProfile>> {
        self.inner.get(&ip.to_string())
    }

    /// Insert or overwrite the profile for a peer host address.
    pub fn insert(&self, ip: IpAddr, profile: Arc<UserProfile>) {
        self.inner.insert(ip.to_string(), profile);
    }

    /// Number of entries currently stored.
    ///
    /// Runs pending housekeeping first so the count reflects evictions.
    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn profile(login: &str) -> Arc<UserProfile> {
        Arc::new(UserProfile {
            name: format!("{login} name"),
            login: login.to_string(),
            avatar: format!("https://avatars.example/{login}.png"),
        })
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(100, 64, 0, last))
    }

    #[test]
    fn test_get_after_insert() {
        let cache = IdentityCache::new(16, Duration::from_secs(60));
        cache.insert(ip(1), profile("ada"));

        let hit = cache.get(ip(1)).expect("entry should be present");
        assert_eq!(hit.login, "ada");
        assert!(cache.get(ip(2)).is_none());
    }

    #[test]
    fn test_insert_overwrites() {
        let cache = IdentityCache::new(16, Duration::from_secs(60));
        cache.insert(ip(1), profile("ada"));
        cache.insert(ip(1), profile("grace"));

        assert_eq!(cache.get(ip(1)).unwrap().login, "grace");
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let cache = IdentityCache::new(16, Duration::from_millis(80));
        cache.insert(ip(1), profile("ada"));
        assert!(cache.get(ip(1)).is_some());

        std::thread::sleep(Duration::from_millis(200));
        assert!(cache.get(ip(1)).is_none(), "entry must not outlive its TTL");
    }

    #[test]
    fn test_capacity_is_respected() {
        let cache = IdentityCache::new(8, Duration::from_secs(60));
        for last in 0..64u8 {
            cache.insert(ip(last), profile("user"));
        }
        assert!(
            cache.entry_count() <= 8,
            "stored entries exceed capacity: {}",
            cache.entry_count()
        );
    }

    #[test]
    fn test_ipv6_and_ipv4_keys_are_distinct() {
        let cache = IdentityCache::new(16, Duration::from_secs(60));
        let v6: IpAddr = "fd7a::1".parse().unwrap();
        cache.insert(v6, profile("ada"));

        assert!(cache.get(v6).is_some());
        assert!(cache.get(ip(1)).is_none());
    }
}
