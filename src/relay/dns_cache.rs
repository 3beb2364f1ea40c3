//! Host-to-IP resolution cache
//!
//! Association creation resolves SOCKS5 domain targets through the system
//! resolver; this cache keeps those answers for a short, fixed TTL so a
//! burst of datagrams to the same host costs one lookup. IPv4 answers are
//! preferred because the tunnel address pool is usually v4-first.
//!
//! Staleness is only checked on read; stale entries linger until the next
//! resolution of the same host overwrites them. The cache never shrinks.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::lookup_host;
use tracing::{debug, trace};

use crate::error::RelayError;

/// Default TTL for cached resolutions
pub const DNS_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    ip: IpAddr,
    inserted_at: Instant,
}

/// DNS resolution cache with a fixed TTL.
#[derive(Debug)]
pub struct DnsCache {
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl DnsCache {
    /// Create a cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Create a cache with the default 5 second TTL.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DNS_CACHE_TTL)
    }

    /// Resolve `host`, consulting the cache first.
    ///
    /// Fresh entries are returned as-is; otherwise the system resolver is
    /// queried, the first IPv4 answer (or the first answer of any family)
    /// is cached with the current time and returned.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DnsFailure`] when the lookup errors or yields
    /// no addresses.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, RelayError> {
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(host) {
                if entry.inserted_at.elapsed() < self.ttl {
                    trace!(host, ip = %entry.ip, "DNS cache hit");
                    return Ok(entry.ip);
                }
            }
        }

        let addrs: Vec<IpAddr> = lookup_host((host, 0u16))
            .await
            .map_err(|e| RelayError::dns(host, e.to_string()))?
            .map(|sa| sa.ip())
            .collect();

        let ip = addrs
            .iter()
            .copied()
            .find(IpAddr::is_ipv4)
            .or_else(|| addrs.first().copied())
            .ok_or_else(|| RelayError::dns(host, "no addresses returned"))?;

        debug!(host, %ip, "DNS resolved");

        self.cache.write().insert(
            host.to_owned(),
            CacheEntry {
                ip,
                inserted_at: Instant::now(),
            },
        );

        Ok(ip)
    }

    /// Number of cached entries, fresh or stale.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Look up a cached entry without resolving, honoring freshness.
    #[must_use]
    pub fn peek(&self, host: &str) -> Option<IpAddr> {
        let cache = self.cache.read();
        cache
            .get(host)
            .filter(|e| e.inserted_at.elapsed() < self.ttl)
            .map(|e| e.ip)
    }

    #[cfg(test)]
    fn insert_at(&self, host: &str, ip: IpAddr, inserted_at: Instant) {
        self.cache
            .write()
            .insert(host.to_owned(), CacheEntry { ip, inserted_at });
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}
