use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::response::InsightResponse;
use crate::task::ContextValue;

/// Compute the cache/coalescing fingerprint for a query.
///
/// Canonicalisation: trim, collapse internal whitespace, lowercase. The
/// tenant always participates; context keys participate only when
/// whitelisted (sorted, so map ordering cannot change the hash).
pub fn fingerprint(
    query: &str,
    tenant_id: &str,
    context: &BTreeMap<String, ContextValue>,
    whitelist: &[String],
) -> String {
    let canonical: String = query
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update([0u8]);
    hasher.update(tenant_id.as_bytes());
    // BTreeMap iterates sorted; filter to the whitelist.
    for (key, value) in context {
        if whitelist.iter().any(|w| w == key) {
            hasher.update([0u8]);
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
        }
    }
    // 16 bytes of the digest is plenty for a process-local keyspace.
    hex::encode(&hasher.finalize()[..16])
}

struct CacheEntry {
    response: Arc<InsightResponse>,
    stored_at: Instant,
}

/// Bounded LRU of approved responses with lazy TTL expiry.
///
/// Reads update recency. Expired entries are dropped on lookup rather than
/// swept; the LRU bound keeps total memory fixed either way.
pub struct ResultCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<Arc<InsightResponse>> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let fresh = guard.get(fingerprint).and_then(|entry| {
            if entry.stored_at.elapsed() <= self.ttl {
                Some(entry.response.clone())
            } else {
                None
            }
        });
        match fresh {
            Some(response) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(response)
            }
            None => {
                // Either absent or expired; expired entries are dropped now.
                guard.pop(fingerprint);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn store(&self, fingerprint: String, response: Arc<InsightResponse>) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.put(
            fingerprint,
            CacheEntry {
                response,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn evict(&self, fingerprint: &str) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.pop(fingerprint);
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
