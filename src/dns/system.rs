use super::{ResolveError, ResolveOutcome, Resolver};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

const MAX_CACHE_ENTRIES: usize = 512;
const MAX_HOST_LENGTH: usize = 255;
const DEFAULT_TTL: Duration = Duration::from_secs(60);

struct Cached {
    expires_at: Instant,
    addresses: Vec<IpAddr>,
}

/// Lookup results in insertion order; the front is evicted first.
#[derive(Default)]
struct HostCache {
    entries: FxHashMap<String, Cached>,
    order: VecDeque<String>,
}

impl HostCache {
    fn get(&mut self, host: &str, now: Instant) -> Option<Vec<IpAddr>> {
        let fresh = self.entries.get(host)?.expires_at > now;
        if fresh {
            return self.entries.get(host).map(|entry| entry.addresses.clone());
        }
        self.forget(host);
        None
    }

    fn put(&mut self, host: String, cached: Cached) {
        self.forget(&host);
        self.order.push_back(host.clone());
        self.entries.insert(host, cached);
        while self.order.len() > MAX_CACHE_ENTRIES {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn forget(&mut self, host: &str) {
        if self.entries.remove(host).is_some() {
            self.order.retain(|entry| entry != host);
        }
    }
}

/// Blocking resolver over the platform's `getaddrinfo`. Answers are cached
/// per lowercased hostname for a fixed TTL, IPv4 addresses first.
pub struct SystemResolver {
    cache: Mutex<HostCache>,
    ttl: Duration,
}

impl std::fmt::Debug for SystemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemResolver")
            .field("ttl", &self.ttl)
            .field("cached", &self.cache.lock().entries.len())
            .finish()
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl SystemResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(HostCache::default()),
            ttl: ttl.max(Duration::from_secs(1)),
        }
    }

    fn cache_lookup(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.cache.lock().get(host, Instant::now())
    }

    fn cache_insert(&self, host: &str, addresses: &[IpAddr]) {
        if addresses.is_empty() {
            return;
        }
        let cached = Cached {
            expires_at: Instant::now() + self.ttl,
            addresses: addresses.to_vec(),
        };
        self.cache.lock().put(host.to_string(), cached);
    }

    fn lookup(host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let sockets = (host, 0)
            .to_socket_addrs()
            .map_err(|err| ResolveError::LookupFailed(format!("{host}: {err}")))?;
        let mut addresses: Vec<IpAddr> = Vec::new();
        for socket in sockets {
            if !addresses.contains(&socket.ip()) {
                addresses.push(socket.ip());
            }
        }
        // stable: keeps the platform's order within each family
        addresses.sort_by_key(IpAddr::is_ipv6);
        if addresses.is_empty() {
            return Err(ResolveError::LookupFailed(format!("{host}: no addresses")));
        }
        Ok(addresses)
    }

    fn outcome(&self, addresses: Vec<IpAddr>) -> ResolveOutcome {
        ResolveOutcome {
            addresses,
            ttl: self.ttl,
        }
    }
}

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<ResolveOutcome, ResolveError> {
        let host = host.trim().trim_end_matches('.');
        if host.is_empty() || host.len() > MAX_HOST_LENGTH {
            return Err(ResolveError::Unsupported);
        }
        if let Ok(literal) = host.parse::<IpAddr>() {
            return Ok(self.outcome(vec![literal]));
        }

        let host = host.to_ascii_lowercase();
        if let Some(cached) = self.cache_lookup(&host) {
            return Ok(self.outcome(cached));
        }
        let addresses = Self::lookup(&host)?;
        self.cache_insert(&host, &addresses);
        Ok(self.outcome(addresses))
    }
}
