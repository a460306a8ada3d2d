use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

type Resolver = Box<dyn Fn(&str) -> io::Result<Vec<SocketAddr>> + Send>;

/// Caches `host:port` lookups; failures are cached too, for a shorter time.
pub struct DnsCache {
    ok_ttl: Duration,
    fail_ttl: Duration,
    entries: HashMap<String, (Instant, Option<SocketAddr>)>,
    resolver: Resolver,
}

impl DnsCache {
    pub fn new(ok_ttl: Duration, fail_ttl: Duration) -> Self {
        Self::with_resolver(
            ok_ttl,
            fail_ttl,
            Box::new(|address| Ok(address.to_socket_addrs()?.collect())),
        )
    }

    pub fn with_resolver(ok_ttl: Duration, fail_ttl: Duration, resolver: Resolver) -> Self {
        Self {
            ok_ttl,
            fail_ttl,
            entries: HashMap::new(),
            resolver,
        }
    }

    pub fn resolve(&mut self, address: &str, now: Instant) -> Option<SocketAddr> {
        if let Some((resolved_at, cached)) = self.entries.get(address) {
            let ttl = if cached.is_some() {
                self.ok_ttl
            } else {
                self.fail_ttl
            };
            if now.duration_since(*resolved_at) < ttl {
                return *cached;
            }
        }

        let resolved = match (self.resolver)(address) {
            Ok(addrs) => addrs.into_iter().next(),
            Err(e) => {
                tracing::warn!("Failed to resolve {}: {}", address, e);
                None
            }
        };

        self.entries.insert(address.to_string(), (now, resolved));
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_cache(fail: bool) -> (DnsCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = DnsCache::with_resolver(
            Duration::from_secs(60),
            Duration::from_secs(5),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(io::Error::new(io::ErrorKind::NotFound, "no such host"))
                } else {
                    Ok(vec!["10.0.0.1:4000".parse().unwrap()])
                }
            }),
        );
        (cache, calls)
    }

    #[test]
    fn test_success_cached_until_ttl() {
        let (mut cache, calls) = counting_cache(false);
        let start = Instant::now();

        assert!(cache.resolve("node-a:4000", start).is_some());
        assert!(cache.resolve("node-a:4000", start + Duration::from_secs(59)).is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.resolve("node-a:4000", start + Duration::from_secs(61));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_cached_for_shorter_time() {
        let (mut cache, calls) = counting_cache(true);
        let start = Instant::now();

        assert!(cache.resolve("missing:4000", start).is_none());
        assert!(cache.resolve("missing:4000", start + Duration::from_secs(4)).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.resolve("missing:4000", start + Duration::from_secs(6));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_literal_address_resolves() {
        let mut cache = DnsCache::new(Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(
            cache.resolve("127.0.0.1:4321", Instant::now()),
            Some("127.0.0.1:4321".parse().unwrap())
        );
    }
}
