//! Deduplication of mesh packets
//!
//! A flooded mesh delivers the same packet several times: once per relay
//! that rebroadcasts it, and once more when the radio echoes a packet this
//! node sent. The [`DeduplicationCache`] remembers `(origin, packet_id)`
//! pairs for a retention window so each logical packet is processed once.
//!
//! # Retention
//!
//! Entries live in an LRU bounded by capacity and expire after the TTL.
//! Entries are never promoted on lookup, so LRU order is insertion order
//! and expired entries are always at the old end; they are evicted
//! opportunistically on every insert. Time comes from [`tokio::time`], so
//! tests can fast-forward the window with a paused clock.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ProcessorConfig;

/// Key for deduplication cache entries
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct DedupKey {
    /// Originating node
    pub origin: u32,
    /// Packet id
    pub packet_id: u32,
}

impl DedupKey {
    /// Create a key
    pub fn new(origin: u32, packet_id: u32) -> Self {
        Self { origin, packet_id }
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}:{:08x}", self.origin, self.packet_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    first_seen: Instant,
    seen_count: u32,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Total packets checked
    pub total_checks: u64,
    /// Packets that were duplicates
    pub duplicates_blocked: u64,
    /// Packets that were new (passed through)
    pub new_packets: u64,
    /// Entries expired by TTL
    pub ttl_expirations: u64,
    /// Entries evicted by capacity
    pub lru_evictions: u64,
}

impl DedupStats {
    /// Get the duplicate rate (0.0 to 1.0)
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.duplicates_blocked as f64 / self.total_checks as f64
        }
    }
}

#[derive(Debug)]
struct Inner {
    entries: LruCache<DedupKey, CacheEntry>,
    stats: DedupStats,
}

/// LRU-based deduplication cache with TTL expiration
#[derive(Debug, Clone)]
pub struct DeduplicationCache {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl DeduplicationCache {
    /// Create a new deduplication cache with default settings
    pub fn new() -> Self {
        Self::with_capacity_and_ttl(1000, Duration::from_secs(300))
    }

    /// Create from processor configuration
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self::with_capacity_and_ttl(config.dedup_cache_size, config.dedup_ttl)
    }

    /// Create with custom capacity and TTL
    pub fn with_capacity_and_ttl(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::new(cap),
                stats: DedupStats::default(),
            })),
            ttl,
        }
    }

    /// Decide whether a packet should be processed.
    ///
    /// Returns `true` the first time `(origin, packet_id)` is seen within the
    /// retention window and records it; `false` for every repeat.
    pub fn should_process(&self, origin: u32, packet_id: u32) -> bool {
        let key = DedupKey::new(origin, packet_id);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.stats.total_checks += 1;

        let live = inner
            .entries
            .peek(&key)
            .map(|entry| now.duration_since(entry.first_seen) <= self.ttl);

        match live {
            Some(true) => {
                if let Some(entry) = inner.entries.peek_mut(&key) {
                    entry.seen_count += 1;
                    debug!(key = %key, seen_count = entry.seen_count, "Duplicate packet detected");
                }
                inner.stats.duplicates_blocked += 1;
                false
            }
            Some(false) => {
                trace!(key = %key, "Cache entry expired, treating as new");
                inner.entries.pop(&key);
                inner.stats.ttl_expirations += 1;
                Self::record(&mut inner, key, now, self.ttl);
                inner.stats.new_packets += 1;
                true
            }
            None => {
                Self::record(&mut inner, key, now, self.ttl);
                inner.stats.new_packets += 1;
                trace!(key = %key, "New packet recorded");
                true
            }
        }
    }

    /// Record a packet without checking.
    ///
    /// Used for packets this node sends, so the radio's echo is dropped.
    pub fn mark_processed(&self, origin: u32, packet_id: u32) {
        let key = DedupKey::new(origin, packet_id);
        let mut inner = self.inner.lock();
        inner.entries.pop(&key);
        Self::record(&mut inner, key, Instant::now(), self.ttl);
    }

    fn record(inner: &mut Inner, key: DedupKey, now: Instant, ttl: Duration) {
        let expired = Self::evict_expired(inner, now, ttl);
        inner.stats.ttl_expirations += expired as u64;
        if inner.entries.len() >= inner.entries.cap().get() {
            inner.stats.lru_evictions += 1;
        }
        inner.entries.put(
            key,
            CacheEntry {
                first_seen: now,
                seen_count: 1,
            },
        );
    }

    fn evict_expired(inner: &mut Inner, now: Instant, ttl: Duration) -> usize {
        let mut expired = 0;
        while let Some((_, entry)) = inner.entries.peek_lru() {
            if now.duration_since(entry.first_seen) <= ttl {
                break;
            }
            inner.entries.pop_lru();
            expired += 1;
        }
        expired
    }

    /// Drop every entry older than the TTL.
    ///
    /// Returns the number of entries expired.
    pub fn expire_old_entries(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired = Self::evict_expired(&mut inner, Instant::now(), self.ttl);
        inner.stats.ttl_expirations += expired as u64;
        expired
    }

    /// Get the number of entries in the cache
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> DedupStats {
        self.inner.lock().stats.clone()
    }

    /// Clear all cache entries
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Get the configured TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get the cache capacity
    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.cap().get()
    }
}

impl Default for DeduplicationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(DedupKey::new(0x64, 0x7).to_string(), "00000064:00000007");
    }

    #[test]
    fn test_first_sighting_passes() {
        let cache = DeduplicationCache::new();
        assert!(cache.should_process(100, 7));
        assert_eq!(cache.len(), 1);

        let stats = cache.stats();
        assert_eq!(stats.total_checks, 1);
        assert_eq!(stats.new_packets, 1);
        assert_eq!(stats.duplicates_blocked, 0);
    }

    #[test]
    fn test_repeats_are_blocked() {
        let cache = DeduplicationCache::new();
        assert!(cache.should_process(100, 7));
        assert!(!cache.should_process(100, 7));
        assert!(!cache.should_process(100, 7));

        let stats = cache.stats();
        assert_eq!(stats.total_checks, 3);
        assert_eq!(stats.duplicates_blocked, 2);
        assert!((stats.duplicate_rate() - 2.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn test_key_includes_origin() {
        let cache = DeduplicationCache::new();
        assert!(cache.should_process(1, 42));
        assert!(cache.should_process(2, 42));
        assert!(cache.should_process(1, 43));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_mark_processed_blocks_echo() {
        let cache = DeduplicationCache::new();
        cache.mark_processed(0xABCD, 99);
        assert!(!cache.should_process(0xABCD, 99));
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = DeduplicationCache::with_capacity_and_ttl(3, Duration::from_secs(300));
        for id in 1..=4 {
            assert!(cache.should_process(1, id));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().lru_evictions, 1);

        // Oldest entry was evicted
        assert!(cache.should_process(1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiration() {
        let cache = DeduplicationCache::with_capacity_and_ttl(10, Duration::from_secs(60));
        assert!(cache.should_process(100, 7));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!cache.should_process(100, 7));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.should_process(100, 7));
        assert_eq!(cache.stats().ttl_expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_evicted_on_insert() {
        let cache = DeduplicationCache::with_capacity_and_ttl(10, Duration::from_secs(60));
        assert!(cache.should_process(1, 1));
        assert!(cache.should_process(1, 2));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.should_process(1, 3));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_old_entries() {
        let cache = DeduplicationCache::with_capacity_and_ttl(10, Duration::from_secs(60));
        cache.should_process(1, 1);
        tokio::time::advance(Duration::from_secs(45)).await;
        cache.should_process(1, 2);
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(cache.expire_old_entries(), 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.should_process(1, 2));
    }

    #[test]
    fn test_clone_shares_data() {
        let cache1 = DeduplicationCache::new();
        cache1.should_process(1, 1);
        let cache2 = cache1.clone();
        assert!(!cache2.should_process(1, 1));
        assert_eq!(cache1.len(), cache2.len());
    }

    #[test]
    fn test_from_config() {
        let config = ProcessorConfig {
            dedup_cache_size: 500,
            dedup_ttl: Duration::from_secs(120),
            ..Default::default()
        };
        let cache = DeduplicationCache::from_config(&config);
        assert_eq!(cache.capacity(), 500);
        assert_eq!(cache.ttl(), Duration::from_secs(120));
    }

    #[test]
    fn test_clear() {
        let cache = DeduplicationCache::new();
        cache.should_process(1, 1);
        cache.should_process(2, 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
