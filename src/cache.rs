use std::time::Duration;

use moka::future::Cache;
use prometheus::Counter;

/// TTL'd membership cache keyed by DID or AT-URI. A hit means the row was
/// seen in the database recently enough that the existence probe can be
/// skipped; entries expire so a deleted row is eventually re-checked.
#[derive(Clone)]
pub struct PresenceCache {
    cache: Cache<String, ()>,
    hits: &'static Counter,
    misses: &'static Counter,
}

impl PresenceCache {
    pub fn new(
        max_capacity: u64,
        ttl: Duration,
        hits: &'static Counter,
        misses: &'static Counter,
    ) -> Self {
        let cache: Cache<String, ()> = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self {
            cache,
            hits,
            misses,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let present = self.cache.get(key).is_some();
        if present {
            self.hits.inc();
        } else {
            self.misses.inc();
        }
        present
    }

    pub async fn insert(&self, key: &str) {
        self.cache.insert(key.to_string(), ()).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }
}
