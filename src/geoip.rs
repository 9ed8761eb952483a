/// GeoIP Enrichment
///
/// The actual database reader is an external collaborator; this module
/// treats it as an opaque `IP -> (country, lat, lon)` lookup behind a
/// process-wide, LRU-bounded cache. Lookups on the hot parse path never
/// block: a cache miss enqueues a background resolution and the event goes
/// out with a partial (or empty) location.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::types::Location;

/// Opaque resolver collaborator. Implementations may hit a local mmdb file,
/// an external process, anything - the cache does not care.
pub trait GeoIpResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> Option<Location>;
}

/// Resolver used when no GeoIP database is configured: every lookup is a
/// miss and events carry empty locations.
pub struct NullResolver;

impl GeoIpResolver for NullResolver {
    fn resolve(&self, _ip: &str) -> Option<Location> {
        None
    }
}

/// Fixed-map resolver for tests and demos
pub struct StaticResolver {
    entries: std::collections::HashMap<String, Location>,
}

impl StaticResolver {
    pub fn new(entries: std::collections::HashMap<String, Location>) -> Self {
        Self { entries }
    }
}

impl GeoIpResolver for StaticResolver {
    fn resolve(&self, ip: &str) -> Option<Location> {
        self.entries.get(ip).cloned()
    }
}

/// Process-wide bounded location cache, read-mostly
pub struct GeoIpService {
    cache: RwLock<LruCache<String, Location>>,
    pending_tx: mpsc::UnboundedSender<String>,
}

impl GeoIpService {
    /// Create the service and spawn its background resolver task.
    pub fn start(resolver: Arc<dyn GeoIpResolver>, capacity: usize) -> Arc<Self> {
        let (pending_tx, mut pending_rx) = mpsc::unbounded_channel::<String>();
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        let service = Arc::new(Self {
            cache: RwLock::new(LruCache::new(capacity)),
            pending_tx,
        });

        let svc = Arc::clone(&service);
        tokio::spawn(async move {
            while let Some(ip) = pending_rx.recv().await {
                if svc.peek(&ip).is_some() {
                    continue;
                }
                let resolver = Arc::clone(&resolver);
                let ip_for_lookup = ip.clone();
                let resolved = tokio::task::spawn_blocking(move || {
                    resolver.resolve(&ip_for_lookup)
                })
                .await
                .ok()
                .flatten();
                // Cache misses too, so the same dead IP is not re-queued on
                // every event it appears in.
                svc.insert(ip, resolved.unwrap_or_default());
            }
        });

        service
    }

    /// Strip the port from a remote address ("1.2.3.4:5678" -> "1.2.3.4")
    pub fn ip_of(remote_addr: &str) -> &str {
        match remote_addr.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => remote_addr,
        }
    }

    fn peek(&self, ip: &str) -> Option<Location> {
        let cache = self.cache.read().ok()?;
        cache.peek(ip).cloned()
    }

    fn insert(&self, ip: String, location: Location) {
        if let Ok(mut cache) = self.cache.write() {
            cache.put(ip, location);
        }
    }

    /// Non-blocking lookup: returns the cached location if present, else
    /// enqueues a background resolution and returns an empty location.
    pub fn lookup(&self, remote_addr: &str) -> Location {
        let ip = Self::ip_of(remote_addr);
        if let Ok(mut cache) = self.cache.write() {
            if let Some(loc) = cache.get(ip) {
                return loc.clone();
            }
        }
        let _ = self.pending_tx.send(ip.to_string());
        Location::default()
    }

    /// Number of cached addresses
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn us_location() -> Location {
        Location {
            country: Some("US".to_string()),
            lat: Some(37.7749),
            lon: Some(-122.4194),
        }
    }

    #[test]
    fn test_ip_of_strips_port() {
        assert_eq!(GeoIpService::ip_of("192.168.1.1:1234"), "192.168.1.1");
        assert_eq!(GeoIpService::ip_of("192.168.1.1"), "192.168.1.1");
        assert_eq!(GeoIpService::ip_of("host.example.com:99"), "host.example.com");
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let mut entries = HashMap::new();
        entries.insert("192.168.1.1".to_string(), us_location());
        let service = GeoIpService::start(Arc::new(StaticResolver::new(entries)), 100);

        // First lookup is a miss and must not block
        let first = service.lookup("192.168.1.1:5000");
        assert_eq!(first, Location::default());

        // Give the background resolver a moment to fill the cache
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if service.lookup("192.168.1.1:5000").country.is_some() {
                break;
            }
        }
        assert_eq!(service.lookup("192.168.1.1").country.as_deref(), Some("US"));
    }

    #[tokio::test]
    async fn test_null_resolver_caches_empty() {
        let service = GeoIpService::start(Arc::new(NullResolver), 10);
        let loc = service.lookup("10.0.0.1:1");
        assert!(loc.country.is_none());
    }
}
